//! # Scripthost Debug
//!
//! Debug targets for scripthost engines: line breakpoints, suspend and
//! resume, stepping, and stack/variable inspection that works the same way
//! for every backend.
//!
//! ```no_run
//! use scripthost_core::{DebugOptions, EngineConfig, ScriptSource};
//! use scripthost_debug::{Breakpoint, DebugTarget};
//! use scripthost_engine::ScriptEngine;
//!
//! # fn main() -> scripthost_core::Result<()> {
//! let engine = ScriptEngine::new(EngineConfig::default())?;
//! let target = DebugTarget::attach(&engine, DebugOptions::default())?;
//! target.add_breakpoint(Breakpoint::new("main", 2));
//!
//! let result = engine.submit(ScriptSource::inline_named("let a = 1;\nlet b = a + 1;", "main"));
//! // ... wait for a suspend event, inspect `target.stack()`, then:
//! target.resume()?;
//! result.wait()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod breakpoints;
pub mod events;
pub mod target;

pub use breakpoints::{Breakpoint, BreakpointSet};
pub use events::{DebugEvent, DebugEventKind, EventReason};
pub use target::{DebugTarget, StepMode, TargetState};
