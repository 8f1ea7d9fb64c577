//! Execution context shared between an engine and its backend
//!
//! Backends report progress through [`ExecutionRuntime`]: a checkpoint per
//! executable node, plus enter/leave notifications for loaded modules. The
//! runtime tracks the logical call stack and forwards everything to an
//! optional [`ExecutionHook`] (a debugger, usually).

use crate::job::{EngineId, JobInfo};
use crate::modules::{LoadedModule, ModuleBridge, Resource};
use parking_lot::{Mutex, RwLock};
use scripthost_core::{
    Action, Result, ScriptError, ScriptLanguage, SecurityPolicy, Value, ValueInspector,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use tracing::{debug, trace};

/// Position of one logical frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLocation {
    /// Resource identity of the frame's code, `None` for dynamic code
    pub resource: Option<String>,
    /// Current line (1-based)
    pub line: usize,
}

/// What a checkpoint marks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    /// A statement is about to start
    Statement,
    /// An expression inside the current statement is about to be evaluated
    Expression,
}

/// Access to the innermost frame's scope at a checkpoint
///
/// Only valid while the checkpoint is being handled.
pub trait FrameScope {
    /// Variables visible in the innermost frame
    fn variables(&self) -> Vec<(String, Value)>;

    /// Evaluate an expression against the innermost frame
    ///
    /// Changes made by the expression are not written back to the frame.
    fn evaluate(&self, expression: &str) -> Result<Value> {
        let _ = expression;
        Err(ScriptError::invalid_state(
            "expression evaluation is not supported by this backend",
        ))
    }
}

impl<F> FrameScope for F
where
    F: Fn() -> Vec<(String, Value)>,
{
    fn variables(&self) -> Vec<(String, Value)> {
        self()
    }
}

/// A point where execution may pause
///
/// Checkpoints are delivered on the worker thread, before the statement or
/// expression at `line` runs. One statement produces a `Statement`
/// checkpoint followed by `Expression` checkpoints for its parts.
pub struct Checkpoint<'a> {
    /// Resource of the code being executed
    pub resource: Option<&'a str>,
    /// Line about to execute (1-based)
    pub line: usize,
    /// Statement or expression
    pub kind: CheckpointKind,
    /// Number of logical frames, 1 at the top level of the root script
    pub depth: usize,
    /// Logical call stack, outermost first
    pub frames: &'a [FrameLocation],
    /// Inspector for values captured from this checkpoint
    pub inspector: &'a Arc<dyn ValueInspector>,
    scope: &'a dyn FrameScope,
}

impl Checkpoint<'_> {
    /// Snapshot of the variables visible in the innermost frame
    pub fn variables(&self) -> Vec<(String, Value)> {
        self.scope.variables()
    }

    /// Evaluate `expression` in the innermost frame
    pub fn evaluate(&self, expression: &str) -> Result<Value> {
        self.scope.evaluate(expression)
    }

    /// Whether this checkpoint starts a statement
    pub fn is_statement(&self) -> bool {
        self.kind == CheckpointKind::Statement
    }
}

impl fmt::Debug for Checkpoint<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checkpoint")
            .field("resource", &self.resource)
            .field("line", &self.line)
            .field("kind", &self.kind)
            .field("depth", &self.depth)
            .finish()
    }
}

/// Observer of engine execution, called on the worker thread
///
/// `on_checkpoint` may block to suspend the job. Returning an error aborts
/// the running job with that error.
pub trait ExecutionHook: Send + Sync + fmt::Debug {
    /// The worker thread started
    fn on_engine_started(&self, _thread: ThreadId) {}

    /// A job is about to execute
    fn on_job_started(&self, _job: &JobInfo) {}

    /// A script was loaded: the job's root script or an imported module
    fn on_script_loaded(&self, _resource: Option<&str>, _root: bool) {}

    /// Execution reached a checkpoint
    fn on_checkpoint(&self, checkpoint: &Checkpoint<'_>) -> Result<()>;

    /// A job finished, successfully or not
    fn on_job_finished(&self, _job: &JobInfo, _outcome: &Result<Value>) {}

    /// A forced termination was requested; called on the requesting thread
    fn on_cancel_requested(&self) {}

    /// The worker thread is shutting down
    fn on_engine_terminated(&self) {}
}

#[derive(Debug, Default)]
struct FrameTracker {
    frames: Vec<FrameLocation>,
    bases: Vec<usize>,
}

impl FrameTracker {
    fn update(&mut self, resource: Option<&str>, line: usize, call_level: usize) -> usize {
        let index = self.bases.last().copied().unwrap_or(0) + call_level;
        let location = FrameLocation {
            resource: resource.map(str::to_owned),
            line,
        };

        self.frames.truncate(index + 1);
        while self.frames.len() <= index {
            self.frames.push(location.clone());
        }
        self.frames[index] = location;
        index + 1
    }
}

/// Runtime services for one engine's backend
pub struct ExecutionRuntime {
    engine: EngineId,
    language: ScriptLanguage,
    cancelled: AtomicBool,
    muted: AtomicBool,
    hook: RwLock<Option<Arc<dyn ExecutionHook>>>,
    frames: Mutex<FrameTracker>,
    modules: ModuleBridge,
    policy: Arc<dyn SecurityPolicy>,
    inspector: Arc<dyn ValueInspector>,
}

impl ExecutionRuntime {
    /// Create a runtime
    pub fn new(
        engine: EngineId,
        language: ScriptLanguage,
        modules: ModuleBridge,
        policy: Arc<dyn SecurityPolicy>,
        inspector: Arc<dyn ValueInspector>,
    ) -> Self {
        Self {
            engine,
            language,
            cancelled: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            hook: RwLock::new(None),
            frames: Mutex::new(FrameTracker::default()),
            modules,
            policy,
            inspector,
        }
    }

    /// Owning engine
    pub fn engine_id(&self) -> EngineId {
        self.engine
    }

    /// Backend language
    pub fn language(&self) -> ScriptLanguage {
        self.language
    }

    /// Module registry of this engine
    pub fn modules(&self) -> &ModuleBridge {
        &self.modules
    }

    /// Security policy of this engine
    pub fn policy(&self) -> &Arc<dyn SecurityPolicy> {
        &self.policy
    }

    /// Value inspector of the backend
    pub fn inspector(&self) -> &Arc<dyn ValueInspector> {
        &self.inspector
    }

    /// Whether a forced termination is in progress
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            if let Some(hook) = self.hook() {
                hook.on_cancel_requested();
            }
        }
    }

    /// Currently attached hook
    pub fn hook(&self) -> Option<Arc<dyn ExecutionHook>> {
        self.hook.read().clone()
    }

    pub(crate) fn attach_hook(&self, hook: Arc<dyn ExecutionHook>) -> Result<()> {
        let mut slot = self.hook.write();
        if slot.is_some() {
            return Err(ScriptError::invalid_state(
                "an execution hook is already attached",
            ));
        }
        *slot = Some(hook);
        Ok(())
    }

    pub(crate) fn detach_hook(&self) -> Option<Arc<dyn ExecutionHook>> {
        self.hook.write().take()
    }

    /// Report that execution is about to run `line`
    ///
    /// `call_level` is the function nesting inside the current script, 0
    /// at its top level. `scope` is only consulted if the hook asks for
    /// variables or an evaluation. Fails with [`ScriptError::Cancelled`]
    /// once a forced termination was requested, which backends must
    /// propagate.
    pub fn checkpoint(
        &self,
        resource: Option<&str>,
        line: usize,
        call_level: usize,
        kind: CheckpointKind,
        scope: &dyn FrameScope,
    ) -> Result<()> {
        if self.is_cancelled() {
            return Err(ScriptError::Cancelled);
        }
        if self.muted.load(Ordering::SeqCst) {
            return Ok(());
        }

        let Some(hook) = self.hook() else {
            self.frames.lock().update(resource, line, call_level);
            return Ok(());
        };

        let (depth, frames) = {
            let mut tracker = self.frames.lock();
            let depth = tracker.update(resource, line, call_level);
            (depth, tracker.frames.clone())
        };

        trace!(resource = resource.unwrap_or("<dynamic>"), line, depth, ?kind, "Checkpoint");
        hook.on_checkpoint(&Checkpoint {
            resource,
            line,
            kind,
            depth,
            frames: &frames,
            inspector: &self.inspector,
            scope,
        })?;

        if self.is_cancelled() {
            return Err(ScriptError::Cancelled);
        }
        Ok(())
    }

    /// Run `f` with checkpoints switched off
    ///
    /// Used for code the debugger runs on a suspended worker, which must
    /// not re-enter the hook.
    pub fn muted<T>(&self, f: impl FnOnce() -> T) -> T {
        let was_muted = self.muted.swap(true, Ordering::SeqCst);
        let outcome = f();
        self.muted.store(was_muted, Ordering::SeqCst);
        outcome
    }

    /// Load a module through the bridge
    ///
    /// Runs the security check and brackets `load` with script enter/leave
    /// notifications so its frames nest under the importing statement.
    pub fn load_module<F>(
        &self,
        name: &str,
        requesting: Option<&str>,
        load: F,
    ) -> Result<Arc<LoadedModule>>
    where
        F: FnOnce(&Resource, String) -> Result<Value>,
    {
        self.modules.resolve(name, requesting, |resource, code| {
            self.policy
                .check(Action::LoadModule, Some(resource.id()), &code)?;

            self.enter_script(Some(resource.id()));
            let outcome = load(resource, code);
            self.leave_script();
            outcome
        })
    }

    /// A nested script (module) starts executing
    pub fn enter_script(&self, resource: Option<&str>) {
        {
            let mut tracker = self.frames.lock();
            let base = tracker.frames.len();
            tracker.bases.push(base);
        }
        debug!(resource = resource.unwrap_or("<dynamic>"), "Script loaded");
        if let Some(hook) = self.hook() {
            hook.on_script_loaded(resource, false);
        }
    }

    /// The innermost nested script finished
    pub fn leave_script(&self) {
        let mut tracker = self.frames.lock();
        if let Some(base) = tracker.bases.pop() {
            tracker.frames.truncate(base);
        }
    }

    /// Current logical call stack, outermost first
    pub fn frames(&self) -> Vec<FrameLocation> {
        self.frames.lock().frames.clone()
    }

    pub(crate) fn engine_started(&self, thread: ThreadId) {
        if let Some(hook) = self.hook() {
            hook.on_engine_started(thread);
        }
    }

    pub(crate) fn begin_job(&self, job: &JobInfo) {
        {
            let mut tracker = self.frames.lock();
            tracker.frames.clear();
            tracker.bases.clear();
        }
        if let Some(hook) = self.hook() {
            hook.on_job_started(job);
            hook.on_script_loaded(job.resource.as_deref(), true);
        }
    }

    pub(crate) fn end_job(&self, job: &JobInfo, outcome: &Result<Value>) {
        self.frames.lock().frames.clear();
        if let Some(hook) = self.hook() {
            hook.on_job_finished(job, outcome);
        }
    }

    pub(crate) fn engine_terminated(&self) {
        self.modules.clear();
        if let Some(hook) = self.hook() {
            hook.on_engine_terminated();
        }
    }
}

impl fmt::Debug for ExecutionRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionRuntime")
            .field("engine", &self.engine)
            .field("language", &self.language)
            .field("cancelled", &self.is_cancelled())
            .field("hooked", &self.hook.read().is_some())
            .field("modules", &self.modules)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::MemoryLocator;
    use scripthost_core::{AllowAll, Member};

    #[derive(Debug)]
    struct NoMembers;

    impl ValueInspector for NoMembers {
        fn enumerate_members(&self, _value: &Value) -> Result<Vec<Member>> {
            Ok(Vec::new())
        }
    }

    #[derive(Debug, Default)]
    struct Recorder {
        depths: Mutex<Vec<(Option<String>, usize, usize)>>,
        loads: Mutex<Vec<(Option<String>, bool)>>,
    }

    impl ExecutionHook for Recorder {
        fn on_script_loaded(&self, resource: Option<&str>, root: bool) {
            self.loads.lock().push((resource.map(str::to_owned), root));
        }

        fn on_checkpoint(&self, cp: &Checkpoint<'_>) -> Result<()> {
            assert_eq!(cp.frames.len(), cp.depth);
            self.depths
                .lock()
                .push((cp.resource.map(str::to_owned), cp.line, cp.depth));
            Ok(())
        }
    }

    fn runtime(locator: MemoryLocator) -> ExecutionRuntime {
        ExecutionRuntime::new(
            1,
            ScriptLanguage::Rhai,
            ModuleBridge::new(Arc::new(locator)),
            Arc::new(AllowAll),
            Arc::new(NoMembers),
        )
    }

    fn job() -> JobInfo {
        JobInfo {
            id: crate::job::JobId::new(),
            engine: 1,
            label: None,
            resource: Some("main".to_string()),
        }
    }

    #[test]
    fn test_frame_depth_follows_call_level_and_modules() {
        let rt = runtime(MemoryLocator::new().with_module("util", "code"));
        let hook = Arc::new(Recorder::default());
        rt.attach_hook(hook.clone()).unwrap();
        let none = Vec::<(String, Value)>::new;

        rt.begin_job(&job());
        rt.checkpoint(Some("main"), 1, 0, CheckpointKind::Statement, &none).unwrap();
        rt.checkpoint(Some("main"), 5, 1, CheckpointKind::Statement, &none).unwrap();
        rt.load_module("util", Some("main"), |resource, _| {
            rt.checkpoint(Some(resource.id()), 1, 0, CheckpointKind::Statement, &none)?;
            Ok(Value::UNIT)
        })
        .unwrap();
        rt.checkpoint(Some("main"), 2, 0, CheckpointKind::Statement, &none).unwrap();

        let depths = hook.depths.lock().clone();
        assert_eq!(
            depths,
            vec![
                (Some("main".to_string()), 1, 1),
                (Some("main".to_string()), 5, 2),
                (Some("memory:util".to_string()), 1, 3),
                (Some("main".to_string()), 2, 1),
            ]
        );
        assert_eq!(
            hook.loads.lock().clone(),
            vec![
                (Some("main".to_string()), true),
                (Some("memory:util".to_string()), false)
            ]
        );
    }

    #[test]
    fn test_cancelled_runtime_rejects_checkpoints() {
        let rt = runtime(MemoryLocator::new());
        let none = Vec::<(String, Value)>::new;
        rt.checkpoint(None, 1, 0, CheckpointKind::Statement, &none).unwrap();

        rt.cancel();
        assert_eq!(
            rt.checkpoint(None, 2, 0, CheckpointKind::Statement, &none).unwrap_err(),
            ScriptError::Cancelled
        );
    }

    #[test]
    fn test_muted_runtime_skips_hook() {
        let rt = runtime(MemoryLocator::new());
        let hook = Arc::new(Recorder::default());
        rt.attach_hook(hook.clone()).unwrap();
        let none = Vec::<(String, Value)>::new;

        rt.begin_job(&job());
        rt.muted(|| rt.checkpoint(Some("main"), 1, 0, CheckpointKind::Expression, &none))
            .unwrap();
        assert!(hook.depths.lock().is_empty());

        rt.checkpoint(Some("main"), 2, 0, CheckpointKind::Statement, &none)
            .unwrap();
        assert_eq!(hook.depths.lock().len(), 1);
    }

    #[test]
    fn test_single_hook() {
        let rt = runtime(MemoryLocator::new());
        rt.attach_hook(Arc::new(Recorder::default())).unwrap();
        assert!(rt.attach_hook(Arc::new(Recorder::default())).is_err());

        assert!(rt.detach_hook().is_some());
        assert!(rt.hook().is_none());
    }
}
