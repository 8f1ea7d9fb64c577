//! Debug target: pauses an engine's worker at breakpoints and steps
//!
//! The target is an [`ExecutionHook`]. Every checkpoint reported by the
//! backend is tested against the breakpoint set and any pending step
//! request; on a match the worker blocks inside the hook until the
//! controller resumes, steps, disconnects or terminates. Controller calls
//! only flip state under the session lock and never run script code;
//! expression evaluation is handed to the blocked worker.

use crate::breakpoints::{Breakpoint, BreakpointSet};
use crate::events::{DebugEvent, EventReason};
use parking_lot::{Condvar, Mutex, MutexGuard};
use scripthost_core::{
    Action, DebugOptions, Member, Result, ScriptError, ScriptLanguage, StackFrame, Value,
    ValueInspector, Variable,
};
use scripthost_engine::{Checkpoint, ExecutionHook, JobInfo, ScriptEngine, WeakScriptEngine};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Debug target lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    /// The engine runs freely
    Running,
    /// The worker is blocked at a checkpoint
    Suspended,
    /// The target ended; no further suspension
    Terminated,
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Suspended => write!(f, "suspended"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Step policy armed when resuming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// Stop at the next statement or new location, entering calls and modules
    Into,
    /// Stop at the next statement or location in the same or an outer frame
    Over,
    /// Stop once the current frame has returned
    Return,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Resume,
    Step(StepMode),
    Terminate,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Location {
    resource: Option<String>,
    line: usize,
    depth: usize,
}

impl Location {
    fn of(checkpoint: &Checkpoint<'_>) -> Self {
        Self {
            resource: checkpoint.resource.map(str::to_owned),
            line: checkpoint.line,
            depth: checkpoint.depth,
        }
    }
}

#[derive(Debug)]
struct StepRequest {
    mode: StepMode,
    from: Location,
}

impl StepRequest {
    /// A new statement on the starting line (the next loop iteration, say)
    /// completes a step just like a new line does.
    fn completes_at(&self, here: &Location, statement: bool) -> bool {
        let from = &self.from;
        let moved = statement || here != from;
        match self.mode {
            StepMode::Into => moved,
            StepMode::Over => here.depth < from.depth || (here.depth == from.depth && moved),
            StepMode::Return => here.depth < from.depth,
        }
    }
}

#[derive(Debug)]
enum Evaluation {
    Pending(String),
    Done(Result<Value>),
}

#[derive(Debug)]
struct Session {
    state: TargetState,
    command: Option<Command>,
    step: Option<StepRequest>,
    startup_pending: bool,
    load_pending: bool,
    suspend_requested: bool,
    /// Location of the last suspension, until execution moves on
    last_stop: Option<Location>,
    stack: Option<Arc<[Arc<StackFrame>]>>,
    evaluation: Option<Evaluation>,
    thread: Option<ThreadId>,
    jobs_started: u64,
    frame_seen: bool,
    terminate_reason: EventReason,
    terminate_sent: bool,
}

impl Session {
    fn pending_expression(&mut self) -> Option<String> {
        match self.evaluation.take() {
            Some(Evaluation::Pending(expression)) => Some(expression),
            other => {
                self.evaluation = other;
                None
            }
        }
    }
}

struct TargetShared {
    engine: WeakScriptEngine,
    engine_id: u64,
    language: ScriptLanguage,
    can_suspend: bool,
    options: DebugOptions,
    inspector: Arc<dyn ValueInspector>,
    breakpoints: BreakpointSet,
    session: Mutex<Session>,
    changed: Condvar,
    listeners: Mutex<Vec<mpsc::UnboundedSender<DebugEvent>>>,
}

impl TargetShared {
    fn emit(&self, event: DebugEvent) {
        trace!(engine = self.engine_id, %event, "Debug event");
        self.listeners.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn is_tracked(&self, resource: Option<&str>) -> bool {
        resource.is_some() || self.options.track_dynamic_code
    }

    fn stop_reason(
        &self,
        session: &Session,
        here: &Location,
        statement: bool,
    ) -> Option<EventReason> {
        if session.startup_pending {
            Some(EventReason::Startup)
        } else if session.suspend_requested {
            Some(EventReason::UserRequest)
        } else if session.load_pending {
            Some(EventReason::ScriptLoad)
        } else if session.last_stop.is_none()
            && self.breakpoints.hits(here.resource.as_deref(), here.line)
        {
            Some(EventReason::Breakpoint)
        } else if session
            .step
            .as_ref()
            .is_some_and(|step| step.completes_at(here, statement))
        {
            Some(EventReason::Step)
        } else {
            None
        }
    }

    /// Block the worker until the controller issues a command
    fn suspend_here(
        &self,
        mut session: MutexGuard<'_, Session>,
        checkpoint: &Checkpoint<'_>,
        here: Location,
        reason: EventReason,
    ) -> Result<()> {
        let thread = thread::current().id();
        session.state = TargetState::Suspended;
        session.command = None;
        session.step = None;
        session.startup_pending = false;
        session.load_pending = false;
        session.suspend_requested = false;
        session.stack = Some(capture_stack(checkpoint));
        session.last_stop = Some(here.clone());

        info!(
            engine = self.engine_id,
            resource = here.resource.as_deref().unwrap_or("<dynamic>"),
            line = here.line,
            %reason,
            "Debug target suspended"
        );
        self.emit(DebugEvent::suspend(
            thread,
            reason,
            here.resource.as_deref(),
            here.line,
        ));
        self.changed.notify_all();

        loop {
            if let Some(expression) = session.pending_expression() {
                let outcome =
                    MutexGuard::unlocked(&mut session, || checkpoint.evaluate(&expression));
                trace!(engine = self.engine_id, %expression, ok = outcome.is_ok(), "Evaluated");
                session.evaluation = Some(Evaluation::Done(outcome));
                self.changed.notify_all();
            } else if session.state == TargetState::Suspended {
                self.changed.wait(&mut session);
            } else {
                break;
            }
        }
        session.stack = None;

        match session.command.take() {
            Some(Command::Step(mode)) => {
                session.step = Some(StepRequest { mode, from: here });
                drop(session);
                self.emit(DebugEvent::resume(thread, EventReason::Step));
                Ok(())
            }
            Some(Command::Resume) => {
                drop(session);
                self.emit(DebugEvent::resume(thread, EventReason::UserRequest));
                Ok(())
            }
            Some(Command::Disconnect) => Ok(()),
            Some(Command::Terminate) | None => Err(ScriptError::Cancelled),
        }
    }

    fn finish(&self) {
        let mut session = self.session.lock();
        session.state = TargetState::Terminated;
        session.stack = None;
        if session.terminate_sent {
            return;
        }
        session.terminate_sent = true;
        let reason = session.terminate_reason;
        let thread = session.thread;
        drop(session);

        self.changed.notify_all();
        info!(engine = self.engine_id, %reason, "Debug target terminated");
        self.emit(DebugEvent::terminate(thread, reason));
    }
}

/// Snapshot the logical call stack, innermost frame first
///
/// Only the innermost frame carries variables; the backend exposes the
/// scope of the running frame alone.
fn capture_stack(checkpoint: &Checkpoint<'_>) -> Arc<[Arc<StackFrame>]> {
    checkpoint
        .frames
        .iter()
        .rev()
        .enumerate()
        .map(|(index, frame)| {
            let scope = if index == 0 {
                checkpoint.variables()
            } else {
                Vec::new()
            };
            StackFrame::capture(
                index,
                frame.resource.clone(),
                frame.line,
                scope,
                checkpoint.inspector,
            )
        })
        .collect()
}

impl ExecutionHook for TargetShared {
    fn on_engine_started(&self, thread: ThreadId) {
        self.session.lock().thread = Some(thread);
    }

    fn on_job_started(&self, job: &JobInfo) {
        let mut session = self.session.lock();
        session.jobs_started += 1;
        session.thread = Some(thread::current().id());
        session.last_stop = None;
        debug!(engine = self.engine_id, job = %job.id, "Debugging job");
    }

    fn on_script_loaded(&self, resource: Option<&str>, root: bool) {
        if !self.is_tracked(resource) {
            return;
        }
        if self.options.suspend_on_script_load {
            self.session.lock().load_pending = true;
        }
        trace!(engine = self.engine_id, ?resource, root, "Script loaded");
        self.emit(DebugEvent::script_load(thread::current().id(), resource));
    }

    fn on_checkpoint(&self, checkpoint: &Checkpoint<'_>) -> Result<()> {
        let mut session = self.session.lock();
        session.frame_seen = true;
        if session.state == TargetState::Terminated {
            return Err(ScriptError::Cancelled);
        }
        if !self.is_tracked(checkpoint.resource) {
            return Ok(());
        }

        let here = Location::of(checkpoint);
        let statement = checkpoint.is_statement();
        if statement || session.last_stop.as_ref() != Some(&here) {
            session.last_stop = None;
        }

        match self.stop_reason(&session, &here, statement) {
            Some(reason) => self.suspend_here(session, checkpoint, here, reason),
            None => Ok(()),
        }
    }

    fn on_job_finished(&self, job: &JobInfo, outcome: &Result<Value>) {
        let mut session = self.session.lock();
        session.step = None;
        session.last_stop = None;

        let failed_to_start = session.jobs_started == 1
            && !session.frame_seen
            && session.state == TargetState::Running;
        let Err(error) = outcome else {
            return;
        };
        if !failed_to_start {
            return;
        }

        session.state = TargetState::Terminated;
        session.terminate_sent = true;
        drop(session);
        self.changed.notify_all();

        warn!(engine = self.engine_id, job = %job.id, %error, "Debug target failed to start");
        self.emit(DebugEvent::terminate(
            Some(thread::current().id()),
            EventReason::StartupFailure,
        ));

        // The engine stays usable; only the debug session ends.
        if let Some(engine) = self.engine.upgrade() {
            engine.detach_hook();
        }
    }

    fn on_cancel_requested(&self) {
        let mut session = self.session.lock();
        if session.state == TargetState::Suspended {
            session.command = Some(Command::Terminate);
        }
        session.state = TargetState::Terminated;
        drop(session);
        self.changed.notify_all();
    }

    fn on_engine_terminated(&self) {
        self.finish();
    }
}

impl fmt::Debug for TargetShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugTarget")
            .field("engine", &self.engine_id)
            .field("language", &self.language)
            .field("state", &self.session.lock().state)
            .field("breakpoints", &self.breakpoints.len())
            .finish()
    }
}

/// Breakpoint and stepping controller attached to one engine
///
/// Cloning the handle is cheap; clones control the same target.
#[derive(Clone)]
pub struct DebugTarget {
    shared: Arc<TargetShared>,
}

impl DebugTarget {
    /// Attach to `engine`
    ///
    /// The engine's security policy must allow [`Action::AttachDebugger`],
    /// and no other hook may be attached.
    pub fn attach(engine: &ScriptEngine, options: DebugOptions) -> Result<Self> {
        engine
            .policy()
            .check(Action::AttachDebugger, Some(engine.name()), "")?;

        let shared = Arc::new(TargetShared {
            engine: engine.downgrade(),
            engine_id: engine.id(),
            language: engine.language(),
            can_suspend: engine.supports_mid_execution_suspend(),
            inspector: engine.inspector(),
            breakpoints: BreakpointSet::new(),
            session: Mutex::new(Session {
                state: TargetState::Running,
                command: None,
                step: None,
                startup_pending: options.suspend_on_startup,
                load_pending: false,
                suspend_requested: false,
                last_stop: None,
                stack: None,
                evaluation: None,
                thread: engine.thread_id(),
                jobs_started: 0,
                frame_seen: false,
                terminate_reason: EventReason::Completion,
                terminate_sent: false,
            }),
            options,
            changed: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
        });

        engine.attach_hook(shared.clone())?;
        info!(engine = engine.id(), "Debug target attached");
        Ok(Self { shared })
    }

    /// Current state
    pub fn state(&self) -> TargetState {
        self.shared.session.lock().state
    }

    /// Whether the worker is blocked at a checkpoint
    pub fn is_suspended(&self) -> bool {
        self.state() == TargetState::Suspended
    }

    /// Whether [`suspend`](Self::suspend) can pause a running job
    pub fn can_suspend(&self) -> bool {
        self.shared.can_suspend
    }

    /// Options the target was attached with
    pub fn options(&self) -> &DebugOptions {
        &self.shared.options
    }

    /// The debugged engine, while it is alive
    pub fn engine(&self) -> Option<ScriptEngine> {
        self.shared.engine.upgrade()
    }

    /// Receive debug events, in the order they occur
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DebugEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.listeners.lock().push(tx);
        rx
    }

    /// Add a breakpoint; returns false if it already existed
    pub fn add_breakpoint(&self, breakpoint: Breakpoint) -> bool {
        debug!(engine = self.shared.engine_id, %breakpoint, "Breakpoint added");
        self.shared.breakpoints.add(breakpoint)
    }

    /// Remove a breakpoint; returns false if it did not exist
    pub fn remove_breakpoint(&self, breakpoint: &Breakpoint) -> bool {
        self.shared.breakpoints.remove(breakpoint)
    }

    /// Enable or disable an existing breakpoint; returns false if it does not exist
    pub fn set_breakpoint_enabled(&self, breakpoint: &Breakpoint, enabled: bool) -> bool {
        debug!(engine = self.shared.engine_id, %breakpoint, enabled, "Breakpoint toggled");
        self.shared.breakpoints.set_enabled(breakpoint, enabled)
    }

    /// Remove every breakpoint
    pub fn remove_all_breakpoints(&self) {
        self.shared.breakpoints.clear();
    }

    /// Current breakpoints, sorted
    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.shared.breakpoints.to_vec()
    }

    /// Ask the running job to pause at its next checkpoint
    pub fn suspend(&self) -> Result<()> {
        if !self.shared.can_suspend {
            return Err(ScriptError::suspend_unsupported(
                self.shared.language.to_string(),
            ));
        }

        let mut session = self.shared.session.lock();
        match session.state {
            TargetState::Terminated => Err(ScriptError::EngineTerminated),
            TargetState::Suspended => Ok(()),
            TargetState::Running => {
                session.suspend_requested = true;
                Ok(())
            }
        }
    }

    /// Continue until the next breakpoint
    pub fn resume(&self) -> Result<()> {
        self.send(Command::Resume)
    }

    /// Continue to the next location, entering calls and imported modules
    pub fn step_into(&self) -> Result<()> {
        self.send(Command::Step(StepMode::Into))
    }

    /// Continue to the next location of the current frame or an outer one
    pub fn step_over(&self) -> Result<()> {
        self.send(Command::Step(StepMode::Over))
    }

    /// Continue until the current frame returns
    pub fn step_return(&self) -> Result<()> {
        self.send(Command::Step(StepMode::Return))
    }

    fn send(&self, command: Command) -> Result<()> {
        let mut session = self.shared.session.lock();
        match session.state {
            TargetState::Terminated => return Err(ScriptError::EngineTerminated),
            TargetState::Running => return Err(ScriptError::NotSuspended),
            TargetState::Suspended => {}
        }
        session.command = Some(command);
        session.state = TargetState::Running;
        drop(session);

        self.shared.changed.notify_all();
        Ok(())
    }

    /// Call stack of the suspended job, innermost first
    pub fn stack(&self) -> Result<Vec<Arc<StackFrame>>> {
        let session = self.shared.session.lock();
        match (&session.state, &session.stack) {
            (TargetState::Suspended, Some(stack)) => Ok(stack.to_vec()),
            _ => Err(ScriptError::NotSuspended),
        }
    }

    /// Variables of a frame of the suspended job
    pub fn variables(&self, frame: usize) -> Result<Vec<Variable>> {
        let stack = self.stack()?;
        let frame = stack
            .get(frame)
            .ok_or(ScriptError::InvalidFrame { index: frame })?;
        Ok(frame.variables().to_vec())
    }

    /// Evaluate an expression in a frame of the suspended job
    ///
    /// The expression runs on the worker thread against a copy of the
    /// frame's scope; the suspended job does not observe its side effects.
    /// Only the innermost frame has a scope to evaluate in. Evaluation
    /// errors are reported through the returned variable.
    pub fn evaluate(&self, expression: &str, frame: usize) -> Result<Variable> {
        let shared = &self.shared;
        let mut session = shared.session.lock();
        let stack = match (session.state, &session.stack) {
            (TargetState::Suspended, Some(stack)) => Arc::clone(stack),
            (TargetState::Terminated, _) => return Err(ScriptError::EngineTerminated),
            _ => return Err(ScriptError::NotSuspended),
        };
        let owner = stack
            .get(frame)
            .ok_or(ScriptError::InvalidFrame { index: frame })?;
        if frame != 0 {
            return Err(ScriptError::inspection(format!(
                "frame {frame} has no scope to evaluate in"
            )));
        }
        if session.evaluation.is_some() {
            return Err(ScriptError::invalid_state("another evaluation is in progress"));
        }

        session.evaluation = Some(Evaluation::Pending(expression.to_string()));
        shared.changed.notify_all();
        let outcome = loop {
            match session.evaluation.take() {
                Some(Evaluation::Done(outcome)) => break outcome,
                pending => session.evaluation = pending,
            }
            shared.changed.wait(&mut session);
        };
        drop(session);

        let member = match outcome {
            Ok(value) => Member::new(expression, value),
            Err(error) => Member::failed(expression, error),
        };
        Ok(Variable::new(
            member,
            Arc::clone(&shared.inspector),
            Arc::downgrade(owner),
        ))
    }

    /// Expand a variable of the suspended job
    pub fn children(&self, variable: &Variable) -> Result<Vec<Variable>> {
        if !self.is_suspended() {
            return Err(ScriptError::NotSuspended);
        }
        Ok(variable.children().to_vec())
    }

    /// Block until the target reaches `state` or `timeout` elapses
    pub fn wait_for_state(&self, state: TargetState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut session = self.shared.session.lock();
        while session.state != state {
            if self.shared.changed.wait_until(&mut session, deadline).timed_out() {
                return session.state == state;
            }
        }
        true
    }

    /// Terminate the debugged engine
    ///
    /// A suspended job is released and resolves with
    /// [`ScriptError::Cancelled`]; queued jobs are cancelled.
    pub fn terminate(&self) -> Result<()> {
        {
            let mut session = self.shared.session.lock();
            if session.state == TargetState::Terminated {
                return Ok(());
            }
            session.terminate_reason = EventReason::UserRequest;
        }

        match self.shared.engine.upgrade() {
            Some(engine) => engine.terminate(true),
            None => self.shared.finish(),
        }
        Ok(())
    }

    /// Detach from the engine and let it run on
    ///
    /// Breakpoints are cleared and a suspended job continues.
    pub fn disconnect(&self) -> Result<()> {
        self.shared.breakpoints.clear();
        if let Some(engine) = self.shared.engine.upgrade() {
            engine.detach_hook();
        }

        let mut session = self.shared.session.lock();
        if session.state == TargetState::Terminated {
            return Ok(());
        }
        if session.state == TargetState::Suspended {
            session.command = Some(Command::Disconnect);
        }
        session.state = TargetState::Terminated;
        session.terminate_sent = true;
        session.step = None;
        session.startup_pending = false;
        session.load_pending = false;
        session.suspend_requested = false;
        let thread = session.thread;
        drop(session);

        self.shared.changed.notify_all();
        info!(engine = self.shared.engine_id, "Debug target disconnected");
        self.shared
            .emit(DebugEvent::terminate(thread, EventReason::Disconnect));
        Ok(())
    }
}

impl fmt::Debug for DebugTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.shared, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(line: usize, depth: usize) -> Location {
        Location {
            resource: Some("main".to_string()),
            line,
            depth,
        }
    }

    #[test]
    fn test_step_policies() {
        let from = location(6, 1);
        let step = |mode| StepRequest {
            mode,
            from: from.clone(),
        };

        let into = step(StepMode::Into);
        assert!(!into.completes_at(&location(6, 1), false));
        assert!(into.completes_at(&location(2, 2), false));
        assert!(into.completes_at(&location(7, 1), false));

        let over = step(StepMode::Over);
        assert!(!over.completes_at(&location(6, 1), false));
        assert!(!over.completes_at(&location(2, 2), true));
        assert!(over.completes_at(&location(7, 1), false));

        let ret = StepRequest {
            mode: StepMode::Return,
            from: location(2, 2),
        };
        assert!(!ret.completes_at(&location(3, 2), true));
        assert!(ret.completes_at(&location(6, 1), false));
    }

    #[test]
    fn test_new_statement_on_same_line_completes_step() {
        let from = location(3, 1);
        for mode in [StepMode::Into, StepMode::Over] {
            let step = StepRequest {
                mode,
                from: from.clone(),
            };
            assert!(!step.completes_at(&from, false));
            assert!(step.completes_at(&from, true));
        }

        let ret = StepRequest {
            mode: StepMode::Return,
            from: from.clone(),
        };
        assert!(!ret.completes_at(&from, true));
    }

    #[test]
    fn test_step_over_skips_imported_module() {
        let over = StepRequest {
            mode: StepMode::Over,
            from: location(1, 1),
        };
        let in_module = Location {
            resource: Some("memory:util".to_string()),
            line: 1,
            depth: 2,
        };
        assert!(!over.completes_at(&in_module, true));
    }
}
