//! Units of work queued on an engine

use crate::result::ScriptResult;
use scripthost_core::ScriptSource;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Engine identifier, unique within the process
pub type EngineId = u64;

/// Job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting in the engine queue
    Queued,
    /// Executing on the worker thread
    Running,
    /// Finished with a value
    Completed,
    /// Finished with an error
    Failed,
    /// Discarded by a forced termination
    Cancelled,
}

impl JobState {
    /// Whether the job has reached a final state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Description of a job handed to listeners and hooks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    /// Job id
    pub id: JobId,
    /// Engine the job was submitted to
    pub engine: EngineId,
    /// Caller supplied label
    pub label: Option<String>,
    /// Resource identity of the job's code, `None` for dynamic code
    pub resource: Option<String>,
}

pub(crate) struct Job {
    pub(crate) info: JobInfo,
    pub(crate) source: ScriptSource,
    pub(crate) result: ScriptResult,
}

impl Job {
    pub(crate) fn new(engine: EngineId, source: ScriptSource, label: Option<String>) -> Self {
        Self {
            info: JobInfo {
                id: JobId::new(),
                engine,
                label,
                resource: source.resource(),
            },
            source,
            result: ScriptResult::pending(),
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.info.id)
            .field("label", &self.info.label)
            .field("source", &self.source.name())
            .finish()
    }
}
