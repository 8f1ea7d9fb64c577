//! Interactive read-eval-print engine

use crate::engine::{EngineBuilder, ScriptEngine};
use crate::result::ScriptResult;
use scripthost_core::{EngineConfig, Result, ScriptLanguage, ScriptSource, Value};
use std::ops::Deref;

/// Label attached to every REPL job
pub const REPL_JOB_LABEL: &str = "repl";

/// Engine that keeps its scope between evaluated lines
///
/// Variables bound by one line are visible to the next, and the worker
/// stops once the shell has been idle for the configured grace period.
#[derive(Debug, Clone)]
pub struct ReplEngine {
    engine: ScriptEngine,
}

impl ReplEngine {
    /// Create a REPL for `language` with the default interactive settings
    pub fn new(language: ScriptLanguage) -> Result<Self> {
        Self::with_config(EngineConfig::repl(language))
    }

    /// Create a REPL from a custom configuration; scope persistence is forced on
    pub fn with_config(mut config: EngineConfig) -> Result<Self> {
        config.persist_scope = true;
        Self::from_builder(EngineBuilder::new(config))
    }

    /// Create a REPL from a prepared builder
    ///
    /// The builder's configuration must have `persist_scope` enabled for
    /// bindings to survive between lines.
    pub fn from_builder(builder: EngineBuilder) -> Result<Self> {
        Ok(Self {
            engine: builder.build()?,
        })
    }

    /// Evaluate one line (or block) of input
    pub fn evaluate(&self, input: &str) -> ScriptResult {
        self.engine
            .submit_labeled(ScriptSource::inline(input), REPL_JOB_LABEL)
    }

    /// Evaluate and wait for the value
    pub fn evaluate_sync(&self, input: &str) -> Result<Value> {
        self.evaluate(input).wait()
    }

    /// Render an outcome the way the shell echoes it
    ///
    /// Unit results echo nothing.
    pub fn echo(&self, outcome: &Result<Value>) -> Option<String> {
        match outcome {
            Ok(value) if value.is_unit() => None,
            Ok(value) => Some(self.engine.inspector().display(value)),
            Err(err) => Some(format!("error: {err}")),
        }
    }

    /// Underlying engine
    pub fn engine(&self) -> &ScriptEngine {
        &self.engine
    }
}

impl Deref for ReplEngine {
    type Target = ScriptEngine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}
