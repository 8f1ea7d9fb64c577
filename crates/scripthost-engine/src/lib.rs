//! # Scripthost Engine
//!
//! Script engines that run jobs one at a time on a dedicated worker thread.
//!
//! ## Supported Languages
//!
//! - **Rhai** - embedded, with full checkpoint (debugger) support
//! - **Lua** / **JavaScript** / **WebAssembly** - no backend yet, creation
//!   fails with [`ScriptError::UnsupportedLanguage`]
//!
//! ## Features
//!
//! - FIFO job queue with write-once [`ScriptResult`] handles
//! - Buffered engine variables and optional scope persistence
//! - Idle termination, graceful and forced shutdown
//! - Module bridge with per-engine caching and pluggable locators
//! - [`ExecutionHook`] checkpoints for debuggers
//! - [`ReplEngine`] for interactive shells

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod backend;
pub mod context;
pub mod engine;
pub mod job;
pub mod modules;
pub mod repl;
pub mod result;
pub mod rhai_backend;

pub use backend::{create_backend, ScriptBackend, Variables};
pub use context::{
    Checkpoint, CheckpointKind, ExecutionHook, ExecutionRuntime, FrameLocation, FrameScope,
};
pub use engine::{EngineBuilder, EngineEvent, EngineState, ScriptEngine, WeakScriptEngine};
pub use job::{EngineId, JobId, JobInfo, JobState};
pub use modules::{
    FileSystemLocator, ImportContext, LoadedModule, MemoryLocator, ModuleBridge,
    ModuleCacheStats, Resource, ResourceLocator,
};
pub use repl::ReplEngine;
pub use result::ScriptResult;
pub use rhai_backend::{RhaiBackend, RhaiInspector};
pub use scripthost_core::{Result, ScriptError};

use scripthost_core::{EngineConfig, ScriptLanguage};

/// Create an engine for a language id such as `"rhai"`
pub fn create_engine(language: &str) -> Result<ScriptEngine> {
    let language: ScriptLanguage = language.parse()?;
    ScriptEngine::new(EngineConfig::for_language(language))
}

/// Create a REPL engine for a language id such as `"rhai"`
pub fn create_repl_engine(language: &str) -> Result<ReplEngine> {
    ReplEngine::new(language.parse()?)
}

/// Prelude with commonly used types
pub mod prelude {
    pub use crate::engine::{EngineState, ScriptEngine};
    pub use crate::repl::ReplEngine;
    pub use crate::result::ScriptResult;
    pub use scripthost_core::prelude::*;
}
