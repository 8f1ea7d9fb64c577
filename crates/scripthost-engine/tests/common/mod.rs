//! Scripted backend for engine tests
//!
//! Each line of a job is one command, preceded by a statement checkpoint:
//!
//! - `sleep N` waits N milliseconds, checkpointing every 5ms
//! - `value N` sets the job result to the integer N
//! - `fail MSG` fails the job with an execution error
//! - `panic` panics inside the backend

#![allow(dead_code)]

use parking_lot::Mutex;
use scripthost_core::{
    Member, Result, ScriptError, ScriptLanguage, ScriptSource, Value, ValueInspector,
};
use scripthost_engine::{CheckpointKind, ExecutionRuntime, ScriptBackend, Variables};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Wall-clock interval of one executed job
#[derive(Debug, Clone)]
pub struct Span {
    pub code: String,
    pub start: Instant,
    pub end: Instant,
}

/// Shared record of executed jobs
#[derive(Debug, Clone, Default)]
pub struct Timeline(Arc<Mutex<Vec<Span>>>);

impl Timeline {
    pub fn spans(&self) -> Vec<Span> {
        self.0.lock().clone()
    }
}

#[derive(Debug)]
pub struct OpaqueInspector;

impl ValueInspector for OpaqueInspector {
    fn enumerate_members(&self, _value: &Value) -> Result<Vec<Member>> {
        Ok(Vec::new())
    }
}

#[derive(Debug)]
pub struct ScriptedBackend {
    timeline: Timeline,
    runtime: Option<Arc<ExecutionRuntime>>,
    suspendable: bool,
}

impl ScriptedBackend {
    pub fn new(timeline: Timeline) -> Self {
        Self {
            timeline,
            runtime: None,
            suspendable: true,
        }
    }

    /// Backend that only honors breakpoint-driven suspension
    pub fn breakpoint_only(timeline: Timeline) -> Self {
        Self {
            suspendable: false,
            ..Self::new(timeline)
        }
    }

    fn checkpoint(&self, script: &ScriptSource, line: usize, kind: CheckpointKind) -> Result<()> {
        let Some(runtime) = &self.runtime else {
            return Ok(());
        };
        let resource = script.resource();
        let no_variables = Vec::<(String, Value)>::new;
        runtime.checkpoint(resource.as_deref(), line, 0, kind, &no_variables)
    }

    fn run(&self, script: &ScriptSource, code: &str) -> Result<Value> {
        let mut value = Value::UNIT;
        for (index, command) in code.lines().enumerate() {
            let line = index + 1;
            self.checkpoint(script, line, CheckpointKind::Statement)?;

            let (verb, arg) = command.trim().split_once(' ').unwrap_or((command.trim(), ""));
            match verb {
                "sleep" => {
                    let total: u64 = arg.parse().unwrap_or(0);
                    let mut slept = 0;
                    while slept < total {
                        thread::sleep(Duration::from_millis(5));
                        slept += 5;
                        self.checkpoint(script, line, CheckpointKind::Expression)?;
                    }
                }
                "value" => value = Value::from(arg.parse::<i64>().unwrap_or(0)),
                "fail" => return Err(ScriptError::execution(arg)),
                "panic" => panic!("scripted panic"),
                "" => {}
                other => return Err(ScriptError::compilation(format!("unknown command {other}"))),
            }
        }
        Ok(value)
    }
}

impl ScriptBackend for ScriptedBackend {
    fn language(&self) -> ScriptLanguage {
        ScriptLanguage::Rhai
    }

    fn inspector(&self) -> Arc<dyn ValueInspector> {
        Arc::new(OpaqueInspector)
    }

    fn supports_mid_execution_suspend(&self) -> bool {
        self.suspendable
    }

    fn setup(&mut self, runtime: &Arc<ExecutionRuntime>) -> Result<()> {
        self.runtime = Some(Arc::clone(runtime));
        Ok(())
    }

    fn execute(
        &mut self,
        script: &ScriptSource,
        code: &str,
        _scope: &mut Variables,
    ) -> Result<Value> {
        let start = Instant::now();
        let outcome = self.run(script, code);
        self.timeline.0.lock().push(Span {
            code: code.to_string(),
            start,
            end: Instant::now(),
        });
        outcome
    }
}
