//! Write-once job results

use crate::job::JobState;
use parking_lot::{Condvar, Mutex};
use scripthost_core::{Result, ScriptError, Value};
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Future-like handle to the outcome of a submitted job
///
/// The outcome is written exactly once, by the engine worker. Callers can
/// block ([`wait`](Self::wait)), poll ([`get`](Self::get)) or `.await` it.
/// `get` returning `None` means "not resolved yet"; a script that produced
/// nothing resolves to `Ok(())`.
#[derive(Clone)]
pub struct ScriptResult {
    inner: Arc<ResultCell>,
}

struct ResultCell {
    slot: Mutex<Slot>,
    ready: Condvar,
    notify: Notify,
}

struct Slot {
    state: JobState,
    outcome: Option<Result<Value>>,
}

impl ScriptResult {
    pub(crate) fn pending() -> Self {
        Self {
            inner: Arc::new(ResultCell {
                slot: Mutex::new(Slot {
                    state: JobState::Queued,
                    outcome: None,
                }),
                ready: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Create an already resolved result
    pub fn resolved_with(outcome: Result<Value>) -> Self {
        let result = Self::pending();
        result.resolve(outcome);
        result
    }

    pub(crate) fn mark_running(&self) {
        let mut slot = self.inner.slot.lock();
        if slot.state == JobState::Queued {
            slot.state = JobState::Running;
        }
    }

    /// Store the outcome; returns false if one was already stored
    pub(crate) fn resolve(&self, outcome: Result<Value>) -> bool {
        let mut slot = self.inner.slot.lock();
        if slot.outcome.is_some() {
            return false;
        }

        slot.state = match &outcome {
            Ok(_) => JobState::Completed,
            Err(ScriptError::Cancelled) => JobState::Cancelled,
            Err(_) => JobState::Failed,
        };
        slot.outcome = Some(outcome);
        drop(slot);

        self.inner.ready.notify_all();
        self.inner.notify.notify_waiters();
        true
    }

    /// Current lifecycle state of the job
    pub fn state(&self) -> JobState {
        self.inner.slot.lock().state
    }

    /// Whether the outcome is available
    pub fn is_ready(&self) -> bool {
        self.inner.slot.lock().outcome.is_some()
    }

    /// Outcome if resolved, `None` otherwise
    pub fn get(&self) -> Option<Result<Value>> {
        self.inner.slot.lock().outcome.clone()
    }

    /// Block the calling thread until the outcome is available
    pub fn wait(&self) -> Result<Value> {
        let mut slot = self.inner.slot.lock();
        loop {
            if let Some(outcome) = &slot.outcome {
                return outcome.clone();
            }
            self.inner.ready.wait(&mut slot);
        }
    }

    /// Block for at most `timeout`; `None` if still unresolved
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Value>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.slot.lock();
        loop {
            if let Some(outcome) = &slot.outcome {
                return Some(outcome.clone());
            }
            if self.inner.ready.wait_until(&mut slot, deadline).timed_out() {
                return slot.outcome.clone();
            }
        }
    }

    /// Wait asynchronously for the outcome
    pub async fn resolved(&self) -> Result<Value> {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(outcome) = self.get() {
                return outcome;
            }
            notified.await;
        }
    }
}

impl IntoFuture for ScriptResult {
    type Output = Result<Value>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.resolved().await })
    }
}

impl fmt::Debug for ScriptResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.inner.slot.lock();
        f.debug_struct("ScriptResult")
            .field("state", &slot.state)
            .field("ready", &slot.outcome.is_some())
            .finish()
    }
}
