//! # Scripthost Core
//!
//! Types shared by every scripthost crate.
//!
//! - [`ScriptError`] - one error type for engines, backends and debuggers
//! - [`ScriptSource`] / [`ScriptLanguage`] - what gets submitted, and to which backend
//! - [`Value`], [`Variable`], [`StackFrame`] - the host-side value model
//! - [`SecurityPolicy`] - checks run before code reaches an interpreter
//! - [`ScriptHostConfig`] - YAML/TOML/JSON configuration with env expansion

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod config;
pub mod error;
pub mod frame;
pub mod language;
pub mod policy;
pub mod script;
pub mod value;

pub use config::{DebugOptions, EngineConfig, ModuleConfig, ScriptHostConfig};
pub use error::{Result, ScriptError};
pub use frame::StackFrame;
pub use language::ScriptLanguage;
pub use policy::{Action, AllowAll, DenyDynamicCode, SecurityPolicy};
pub use script::{ScriptHandle, ScriptSource};
pub use value::{build_variables, Inspect, Member, Value, ValueInspector, Variable};

/// Prelude with commonly used types
pub mod prelude {
    pub use crate::config::{DebugOptions, EngineConfig, ScriptHostConfig};
    pub use crate::error::{Result, ScriptError};
    pub use crate::language::ScriptLanguage;
    pub use crate::script::ScriptSource;
    pub use crate::value::{Value, Variable};
}
