//! Script engine: a FIFO job queue served by one dedicated worker thread

use crate::backend::{self, create_backend, ScriptBackend, Variables};
use crate::context::{ExecutionHook, ExecutionRuntime};
use crate::job::{EngineId, Job, JobInfo};
use crate::modules::{FileSystemLocator, ModuleBridge, ModuleCacheStats, ResourceLocator};
use crate::result::ScriptResult;
use parking_lot::{Condvar, Mutex, RwLock};
use scripthost_core::{
    Action, AllowAll, EngineConfig, Result, ScriptError, ScriptLanguage, ScriptSource,
    SecurityPolicy, Value, ValueInspector,
};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Engine lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed, worker not started
    Created,
    /// Worker is executing a job
    Running,
    /// Worker is waiting for jobs
    Idle,
    /// Worker has stopped; no more jobs will run
    Terminated,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Idle => write!(f, "idle"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Notifications delivered to engine subscribers
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The worker thread started
    Started {
        /// Engine id
        engine: EngineId,
        /// Worker thread
        thread: ThreadId,
    },
    /// A job began executing
    JobStarted {
        /// The job
        job: JobInfo,
    },
    /// A job reached a terminal state
    JobFinished {
        /// The job
        job: JobInfo,
        /// Value or error the job resolved with
        outcome: Result<Value>,
    },
    /// The worker thread stopped
    Terminated {
        /// Engine id
        engine: EngineId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    /// Finish queued jobs first
    Drain,
    /// Cancel everything now
    Force,
}

struct Control {
    state: EngineState,
    jobs: VecDeque<Job>,
    shutdown: Option<Shutdown>,
    terminate_on_idle: bool,
    idle_timeout: Duration,
    idle_since: Instant,
    current: Option<JobInfo>,
}

/// Engine variables plus the names callers wrote during the running job
#[derive(Default)]
struct Bindings {
    values: Variables,
    /// `Some` while a job runs
    pinned: Option<BTreeSet<String>>,
}

struct EngineShared {
    id: EngineId,
    config: EngineConfig,
    language: ScriptLanguage,
    supports_suspend: bool,
    control: Mutex<Control>,
    wakeup: Condvar,
    variables: RwLock<Bindings>,
    runtime: Arc<ExecutionRuntime>,
    backend: Mutex<Option<Box<dyn ScriptBackend>>>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<EngineEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    thread: Mutex<Option<ThreadId>>,
}

impl EngineShared {
    fn emit(&self, event: EngineEvent) {
        self.listeners.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn is_worker_thread(&self) -> bool {
        *self.thread.lock() == Some(thread::current().id())
    }

    fn terminate(&self, force: bool) {
        let mut control = self.control.lock();
        match control.state {
            EngineState::Terminated => return,
            EngineState::Created => {
                let jobs: Vec<Job> = control.jobs.drain(..).collect();
                control.state = EngineState::Terminated;
                drop(control);

                let outcome = if force {
                    ScriptError::Cancelled
                } else {
                    ScriptError::EngineTerminated
                };
                for job in jobs {
                    job.result.resolve(Err(outcome.clone()));
                }
                finish(self);
                return;
            }
            EngineState::Running | EngineState::Idle => {}
        }

        let cancelled: Vec<Job> = if force {
            control.shutdown = Some(Shutdown::Force);
            control.jobs.drain(..).collect()
        } else {
            control.shutdown.get_or_insert(Shutdown::Drain);
            Vec::new()
        };
        drop(control);

        info!(engine = self.id, force, "Terminating script engine");
        if force {
            self.runtime.cancel();
        }
        for job in cancelled {
            job.result.resolve(Err(ScriptError::Cancelled));
        }
        self.wakeup.notify_all();
    }
}

/// Lives as long as some [`ScriptEngine`] handle does
///
/// The worker only holds the shared state, so dropping the last handle
/// lets queued jobs finish and then stops the worker.
struct Owner {
    shared: Weak<EngineShared>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            debug!(engine = shared.id, "Last engine handle dropped");
            shared.terminate(false);
        }
    }
}

/// Handle to a script engine
///
/// Cloning the handle is cheap; all clones drive the same worker. Jobs run
/// strictly one at a time, in submission order, on a thread owned by the
/// engine. Dropping the last handle terminates the engine once its queue
/// is drained.
#[derive(Clone)]
pub struct ScriptEngine {
    shared: Arc<EngineShared>,
    owner: Arc<Owner>,
}

/// Non-owning engine handle
#[derive(Clone)]
pub struct WeakScriptEngine {
    shared: Weak<EngineShared>,
    owner: Weak<Owner>,
}

impl WeakScriptEngine {
    /// Upgrade to a full handle while some full handle is still alive
    pub fn upgrade(&self) -> Option<ScriptEngine> {
        let owner = self.owner.upgrade()?;
        let shared = self.shared.upgrade()?;
        Some(ScriptEngine { shared, owner })
    }
}

impl fmt::Debug for WeakScriptEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakScriptEngine").finish_non_exhaustive()
    }
}

/// Builder for [`ScriptEngine`]
#[derive(Debug)]
pub struct EngineBuilder {
    config: EngineConfig,
    backend: Option<Box<dyn ScriptBackend>>,
    locator: Option<Arc<dyn ResourceLocator>>,
    policy: Arc<dyn SecurityPolicy>,
}

impl EngineBuilder {
    /// Start from a configuration
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            backend: None,
            locator: None,
            policy: Arc::new(AllowAll),
        }
    }

    /// Use a specific backend instead of the one registered for the language
    pub fn backend(mut self, backend: Box<dyn ScriptBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Module locator (defaults to the configured filesystem roots)
    pub fn locator(mut self, locator: Arc<dyn ResourceLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    /// Security policy (defaults to [`AllowAll`])
    pub fn policy(mut self, policy: Arc<dyn SecurityPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Build the engine; the worker starts on [`ScriptEngine::start`] or the first submit
    pub fn build(self) -> Result<ScriptEngine> {
        let backend = match self.backend {
            Some(backend) => backend,
            None => create_backend(&self.config)?,
        };

        let locator = self.locator.unwrap_or_else(|| {
            Arc::new(FileSystemLocator::new(
                self.config.modules.roots.clone(),
                self.config.modules.extension.clone(),
            ))
        });

        let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);
        let language = backend.language();
        let runtime = Arc::new(ExecutionRuntime::new(
            id,
            language,
            ModuleBridge::new(locator),
            self.policy,
            backend.inspector(),
        ));

        debug!(
            engine = id,
            name = %self.config.name,
            language = %language,
            "Script engine created"
        );

        let shared = Arc::new(EngineShared {
            id,
            language,
            supports_suspend: backend.supports_mid_execution_suspend(),
            control: Mutex::new(Control {
                state: EngineState::Created,
                jobs: VecDeque::new(),
                shutdown: None,
                terminate_on_idle: self.config.terminate_on_idle,
                idle_timeout: self.config.idle_timeout,
                idle_since: Instant::now(),
                current: None,
            }),
            wakeup: Condvar::new(),
            variables: RwLock::new(Bindings::default()),
            runtime,
            backend: Mutex::new(Some(backend)),
            listeners: Mutex::new(Vec::new()),
            worker: Mutex::new(None),
            thread: Mutex::new(None),
            config: self.config,
        });
        let owner = Arc::new(Owner {
            shared: Arc::downgrade(&shared),
        });
        Ok(ScriptEngine { shared, owner })
    }
}

impl ScriptEngine {
    /// Create an engine from configuration with default locator and policy
    pub fn new(config: EngineConfig) -> Result<Self> {
        EngineBuilder::new(config).build()
    }

    /// Builder for engines with custom backend, locator or policy
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Engine id
    pub fn id(&self) -> EngineId {
        self.shared.id
    }

    /// Engine name
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Backend language
    pub fn language(&self) -> ScriptLanguage {
        self.shared.language
    }

    /// Current lifecycle state
    pub fn state(&self) -> EngineState {
        self.shared.control.lock().state
    }

    /// Whether the worker has stopped
    pub fn is_terminated(&self) -> bool {
        self.state() == EngineState::Terminated
    }

    /// Worker thread, once started
    pub fn thread_id(&self) -> Option<ThreadId> {
        *self.shared.thread.lock()
    }

    /// Job currently executing, if any
    pub fn current_job(&self) -> Option<JobInfo> {
        self.shared.control.lock().current.clone()
    }

    /// Jobs waiting in the queue
    pub fn queued_jobs(&self) -> usize {
        self.shared.control.lock().jobs.len()
    }

    /// Whether the backend can pause a running job at any checkpoint
    pub fn supports_mid_execution_suspend(&self) -> bool {
        self.shared.supports_suspend
    }

    /// Inspector for values produced by this engine
    pub fn inspector(&self) -> Arc<dyn ValueInspector> {
        Arc::clone(self.shared.runtime.inspector())
    }

    /// Security policy of this engine
    pub fn policy(&self) -> Arc<dyn SecurityPolicy> {
        Arc::clone(self.shared.runtime.policy())
    }

    /// Module cache statistics
    pub fn module_stats(&self) -> ModuleCacheStats {
        self.shared.runtime.modules().stats()
    }

    /// Non-owning handle to this engine
    pub fn downgrade(&self) -> WeakScriptEngine {
        WeakScriptEngine {
            shared: Arc::downgrade(&self.shared),
            owner: Arc::downgrade(&self.owner),
        }
    }

    /// Start the worker thread; no-op if already started
    pub fn start(&self) -> Result<()> {
        let mut control = self.shared.control.lock();
        match control.state {
            EngineState::Created => {}
            EngineState::Terminated => return Err(ScriptError::EngineTerminated),
            EngineState::Running | EngineState::Idle => return Ok(()),
        }

        let backend = self
            .shared
            .backend
            .lock()
            .take()
            .ok_or_else(|| ScriptError::invalid_state("engine backend already taken"))?;

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("script-engine-{}", self.shared.id))
            .spawn(move || run_worker(shared, backend))
            .map_err(|e| ScriptError::Io {
                message: format!("Failed to spawn engine worker: {e}"),
            })?;

        control.state = EngineState::Idle;
        control.idle_since = Instant::now();
        *self.shared.worker.lock() = Some(handle);
        Ok(())
    }

    /// Queue a job; the worker is started if needed
    pub fn submit(&self, source: impl Into<ScriptSource>) -> ScriptResult {
        self.enqueue(source.into(), None)
    }

    /// Queue a job with a label shown in events and logs
    pub fn submit_labeled(
        &self,
        source: impl Into<ScriptSource>,
        label: impl Into<String>,
    ) -> ScriptResult {
        self.enqueue(source.into(), Some(label.into()))
    }

    fn enqueue(&self, source: ScriptSource, label: Option<String>) -> ScriptResult {
        let job = Job::new(self.shared.id, source, label);
        let result = job.result.clone();

        let needs_start = {
            let mut control = self.shared.control.lock();
            if control.state == EngineState::Terminated || control.shutdown.is_some() {
                drop(control);
                debug!(
                    engine = self.shared.id,
                    job = %job.info.id,
                    "Rejected job on terminated engine"
                );
                job.result.resolve(Err(ScriptError::EngineTerminated));
                return result;
            }
            trace!(engine = self.shared.id, job = %job.info.id, "Job queued");
            control.jobs.push_back(job);
            control.state == EngineState::Created
        };
        self.shared.wakeup.notify_all();

        if needs_start {
            if let Err(err) = self.start() {
                error!(engine = self.shared.id, error = %err, "Failed to start engine worker");
                fail_all(&self.shared, err);
            }
        }
        result
    }

    /// Parse a script ahead of time
    ///
    /// The returned source keeps the resource identity of `source` and can
    /// be submitted any number of times without parsing again. Parsing
    /// happens on the calling thread with the engine's configured limits.
    pub fn compile(&self, source: &ScriptSource) -> Result<ScriptSource> {
        let handle = backend::compile(&self.shared.config, source)?;
        trace!(engine = self.shared.id, script = %source.name(), "Script compiled");
        Ok(ScriptSource::Compiled(handle))
    }

    /// Submit and block until the job finishes
    ///
    /// Fails with [`ScriptError::InvalidState`] when called from the worker
    /// thread, which would otherwise wait on itself.
    pub fn execute_sync(&self, source: impl Into<ScriptSource>) -> Result<Value> {
        if self.shared.is_worker_thread() {
            return Err(ScriptError::invalid_state(
                "execute_sync called from the engine worker thread",
            ));
        }
        self.submit(source).wait()
    }

    /// Set an engine variable
    ///
    /// Variables set before the worker starts are buffered and visible to
    /// the first job. A value set while a job runs is visible to the next
    /// job and is not overwritten by the running job's scope.
    pub fn set_variable(&self, name: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        if self.is_terminated() {
            return Err(ScriptError::EngineTerminated);
        }
        let name = name.into();
        let mut bindings = self.shared.variables.write();
        if let Some(pinned) = bindings.pinned.as_mut() {
            pinned.insert(name.clone());
        }
        bindings.values.insert(name, value.into());
        Ok(())
    }

    /// Get an engine variable
    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.shared.variables.read().values.get(name).cloned()
    }

    /// Whether an engine variable exists
    pub fn has_variable(&self, name: &str) -> bool {
        self.shared.variables.read().values.contains_key(name)
    }

    /// Snapshot of all engine variables
    pub fn variables(&self) -> Variables {
        self.shared.variables.read().values.clone()
    }

    /// Stop the worker once the queue stays empty for `grace`
    pub fn set_terminate_on_idle(&self, enabled: bool, grace: Duration) {
        let mut control = self.shared.control.lock();
        control.terminate_on_idle = enabled;
        control.idle_timeout = grace;
        control.idle_since = Instant::now();
        drop(control);
        self.shared.wakeup.notify_all();
    }

    /// Terminate the engine
    ///
    /// Without `force`, queued jobs still run and new submissions are
    /// rejected. With `force`, queued jobs resolve with
    /// [`ScriptError::Cancelled`] and the running job is aborted at its next
    /// checkpoint. Returns immediately; use [`join`](Self::join) to wait.
    pub fn terminate(&self, force: bool) {
        self.shared.terminate(force);
    }

    /// Block until the worker has stopped
    ///
    /// Returns immediately when called from the worker thread.
    pub fn join(&self) {
        if self.shared.is_worker_thread() {
            return;
        }
        let mut control = self.shared.control.lock();
        while control.state != EngineState::Terminated {
            self.shared.wakeup.wait(&mut control);
        }
        drop(control);

        if let Some(handle) = self.shared.worker.lock().take() {
            if handle.join().is_err() {
                warn!(engine = self.shared.id, "Engine worker panicked");
            }
        }
    }

    /// Block until the worker has stopped or `timeout` elapses
    ///
    /// Returns whether the engine is terminated.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut control = self.shared.control.lock();
        while control.state != EngineState::Terminated {
            if self.shared.wakeup.wait_until(&mut control, deadline).timed_out() {
                return control.state == EngineState::Terminated;
            }
        }
        true
    }

    /// Receive engine events
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.listeners.lock().push(tx);
        rx
    }

    /// Attach an execution hook (at most one at a time)
    pub fn attach_hook(&self, hook: Arc<dyn ExecutionHook>) -> Result<()> {
        if self.is_terminated() {
            return Err(ScriptError::EngineTerminated);
        }
        self.shared.runtime.attach_hook(hook)
    }

    /// Detach the current execution hook
    pub fn detach_hook(&self) -> Option<Arc<dyn ExecutionHook>> {
        self.shared.runtime.detach_hook()
    }
}

impl fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("id", &self.shared.id)
            .field("name", &self.shared.config.name)
            .field("language", &self.shared.language)
            .field("state", &self.state())
            .finish()
    }
}

fn run_worker(shared: Arc<EngineShared>, mut backend: Box<dyn ScriptBackend>) {
    let thread = thread::current().id();
    *shared.thread.lock() = Some(thread);
    info!(engine = shared.id, name = %shared.config.name, "Script engine started");

    if let Err(err) = backend.setup(&shared.runtime) {
        error!(engine = shared.id, error = %err, "Backend setup failed");
        fail_all(&shared, err);
        finish(&shared);
        return;
    }

    shared.runtime.engine_started(thread);
    shared.emit(EngineEvent::Started {
        engine: shared.id,
        thread,
    });

    while let Some(job) = next_job(&shared) {
        run_job(&shared, backend.as_mut(), job);
    }

    backend.teardown();
    finish(&shared);
}

fn next_job(shared: &EngineShared) -> Option<Job> {
    let mut control = shared.control.lock();
    loop {
        if control.shutdown == Some(Shutdown::Force) {
            return None;
        }

        if let Some(job) = control.jobs.pop_front() {
            shared.variables.write().pinned = Some(BTreeSet::new());
            control.state = EngineState::Running;
            control.current = Some(job.info.clone());
            return Some(job);
        }

        if control.shutdown == Some(Shutdown::Drain) {
            return None;
        }

        if control.state != EngineState::Idle {
            control.state = EngineState::Idle;
            control.idle_since = Instant::now();
        }

        if control.terminate_on_idle {
            let deadline = control.idle_since + control.idle_timeout;
            if Instant::now() >= deadline {
                debug!(engine = shared.id, "Idle timeout reached");
                return None;
            }
            shared.wakeup.wait_until(&mut control, deadline);
        } else {
            shared.wakeup.wait(&mut control);
        }
    }
}

fn run_job(shared: &EngineShared, backend: &mut dyn ScriptBackend, job: Job) {
    let info = job.info.clone();
    job.result.mark_running();
    debug!(engine = shared.id, job = %info.id, label = ?info.label, "Job started");
    shared.emit(EngineEvent::JobStarted { job: info.clone() });

    let outcome = execute_job(shared, backend, &job);
    shared.variables.write().pinned = None;
    let outcome = match outcome {
        Ok(_) if shared.runtime.is_cancelled() => Err(ScriptError::Cancelled),
        other => other,
    };

    shared.runtime.end_job(&info, &outcome);
    shared.control.lock().current = None;

    match &outcome {
        Ok(_) => debug!(engine = shared.id, job = %info.id, "Job completed"),
        Err(err) => debug!(engine = shared.id, job = %info.id, error = %err, "Job failed"),
    }

    job.result.resolve(outcome.clone());
    shared.emit(EngineEvent::JobFinished { job: info, outcome });
}

fn execute_job(
    shared: &EngineShared,
    backend: &mut dyn ScriptBackend,
    job: &Job,
) -> Result<Value> {
    let code = job.source.code()?;
    shared
        .runtime
        .policy()
        .check(Action::InjectCode, job.info.resource.as_deref(), &code)?;

    shared.runtime.begin_job(&job.info);
    let mut scope = shared.variables.read().values.clone();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        backend.execute(&job.source, &code, &mut scope)
    }))
    .unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(engine = shared.id, job = %job.info.id, %message, "Backend panicked");
        Err(ScriptError::panic(message))
    });

    if shared.config.persist_scope {
        let mut bindings = shared.variables.write();
        let Bindings { values, pinned } = &mut *bindings;
        values.extend(scope.into_iter().filter(|(name, _)| {
            !pinned.as_ref().is_some_and(|pinned| pinned.contains(name))
        }));
    }
    outcome
}

/// Resolve every queued job with `err`
fn fail_all(shared: &EngineShared, err: ScriptError) {
    let jobs: Vec<Job> = shared.control.lock().jobs.drain(..).collect();
    for job in jobs {
        job.result.resolve(Err(err.clone()));
    }
}

fn finish(shared: &EngineShared) {
    let leftover: Vec<Job> = {
        let mut control = shared.control.lock();
        control.state = EngineState::Terminated;
        control.current = None;
        control.jobs.drain(..).collect()
    };
    for job in leftover {
        job.result.resolve(Err(ScriptError::EngineTerminated));
    }

    shared.runtime.engine_terminated();
    shared.wakeup.notify_all();
    info!(engine = shared.id, "Script engine terminated");
    shared.emit(EngineEvent::Terminated { engine: shared.id });
}
