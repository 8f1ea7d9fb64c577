//! Interpreter backends

use crate::context::ExecutionRuntime;
use crate::rhai_backend::RhaiBackend;
use scripthost_core::{
    EngineConfig, Result, ScriptError, ScriptHandle, ScriptLanguage, ScriptSource, Value,
    ValueInspector,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Engine variables, by name
pub type Variables = BTreeMap<String, Value>;

/// An interpreter driven by an engine's worker thread
///
/// Backends are moved onto the worker thread and only ever used from there,
/// so they need `Send` but not `Sync`.
pub trait ScriptBackend: Send + fmt::Debug {
    /// Language this backend runs
    fn language(&self) -> ScriptLanguage;

    /// Inspector used to enumerate this backend's values from any thread
    fn inspector(&self) -> Arc<dyn ValueInspector>;

    /// Whether a job can be paused at arbitrary checkpoints
    fn supports_mid_execution_suspend(&self) -> bool;

    /// Wire the backend to its runtime, once, before the first job
    fn setup(&mut self, runtime: &Arc<ExecutionRuntime>) -> Result<()> {
        let _ = runtime;
        Ok(())
    }

    /// Execute one job
    ///
    /// `scope` holds the engine variables visible to the job; a backend
    /// writes any bindings the job creates or changes back into it.
    /// For [`ScriptSource::Compiled`] sources `code` is empty and the
    /// backend runs the handle's program.
    fn execute(
        &mut self,
        script: &ScriptSource,
        code: &str,
        scope: &mut Variables,
    ) -> Result<Value>;

    /// Release interpreter resources when the worker stops
    fn teardown(&mut self) {}
}

/// Create the backend registered for `config.language`
pub fn create_backend(config: &EngineConfig) -> Result<Box<dyn ScriptBackend>> {
    match config.language {
        ScriptLanguage::Rhai => Ok(Box::new(RhaiBackend::new(config))),
        other => Err(ScriptError::unsupported_language(other.to_string())),
    }
}

/// Parse `source` for `config.language` without running it
pub fn compile(config: &EngineConfig, source: &ScriptSource) -> Result<ScriptHandle> {
    if let Some(handle) = source.handle() {
        if handle.language() != config.language {
            return Err(ScriptError::unsupported_language(handle.language().to_string()));
        }
        return Ok(handle.clone());
    }
    match config.language {
        ScriptLanguage::Rhai => RhaiBackend::new(config).compile(source),
        other => Err(ScriptError::unsupported_language(other.to_string())),
    }
}
