//! Security policies consulted before code reaches an interpreter

use crate::error::{Result, ScriptError};
use std::fmt;

/// What the engine is about to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Execute a submitted job
    InjectCode,
    /// Load an imported module
    LoadModule,
    /// Attach a debug target to an engine
    AttachDebugger,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InjectCode => write!(f, "inject code"),
            Self::LoadModule => write!(f, "load module"),
            Self::AttachDebugger => write!(f, "attach debugger"),
        }
    }
}

/// Policy object passed to engines at construction
pub trait SecurityPolicy: Send + Sync + fmt::Debug {
    /// Allow or reject `action` for the code identified by `resource`
    ///
    /// `resource` is `None` for dynamic code.
    fn check(&self, action: Action, resource: Option<&str>, code: &str) -> Result<()>;
}

/// Permits everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl SecurityPolicy for AllowAll {
    fn check(&self, _action: Action, _resource: Option<&str>, _code: &str) -> Result<()> {
        Ok(())
    }
}

/// Rejects jobs that have no resource identity
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyDynamicCode;

impl SecurityPolicy for DenyDynamicCode {
    fn check(&self, action: Action, resource: Option<&str>, _code: &str) -> Result<()> {
        match (action, resource) {
            (Action::InjectCode, None) => Err(ScriptError::security(
                "dynamic code without a resource identity is not allowed",
            )),
            _ => Ok(()),
        }
    }
}
