//! Debug events delivered to target listeners

use serde::{Deserialize, Serialize};
use std::fmt;
use std::thread::ThreadId;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugEventKind {
    /// Execution paused
    Suspend,
    /// Execution continued
    Resume,
    /// The target ended
    Terminate,
    /// A script or module began executing
    ScriptLoad,
}

/// Why it happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventReason {
    /// A breakpoint was hit
    Breakpoint,
    /// A step request completed or was issued
    Step,
    /// Explicit suspend, resume or terminate call
    UserRequest,
    /// Suspended before the first statement
    Startup,
    /// Suspended because a script was loaded
    ScriptLoad,
    /// The engine finished
    Completion,
    /// The first job failed before any frame existed
    StartupFailure,
    /// The controller disconnected
    Disconnect,
}

impl fmt::Display for EventReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Breakpoint => "breakpoint",
            Self::Step => "step",
            Self::UserRequest => "user-request",
            Self::Startup => "startup",
            Self::ScriptLoad => "script-load",
            Self::Completion => "completion",
            Self::StartupFailure => "startup-failure",
            Self::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}

/// Immutable debug event record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugEvent {
    /// Event kind
    pub kind: DebugEventKind,
    /// Execution thread the event originated from, if known
    pub thread: Option<ThreadId>,
    /// Reason code
    pub reason: Option<EventReason>,
    /// Resource involved (suspend location or loaded script)
    pub resource: Option<String>,
    /// Line involved, for suspend events
    pub line: Option<usize>,
}

impl DebugEvent {
    fn new(kind: DebugEventKind, thread: Option<ThreadId>, reason: Option<EventReason>) -> Self {
        Self {
            kind,
            thread,
            reason,
            resource: None,
            line: None,
        }
    }

    /// Execution paused at `resource:line`
    pub fn suspend(
        thread: ThreadId,
        reason: EventReason,
        resource: Option<&str>,
        line: usize,
    ) -> Self {
        Self {
            resource: resource.map(str::to_owned),
            line: Some(line),
            ..Self::new(DebugEventKind::Suspend, Some(thread), Some(reason))
        }
    }

    /// Execution continued
    pub fn resume(thread: ThreadId, reason: EventReason) -> Self {
        Self::new(DebugEventKind::Resume, Some(thread), Some(reason))
    }

    /// The target ended
    pub fn terminate(thread: Option<ThreadId>, reason: EventReason) -> Self {
        Self::new(DebugEventKind::Terminate, thread, Some(reason))
    }

    /// A script began executing
    pub fn script_load(thread: ThreadId, resource: Option<&str>) -> Self {
        Self {
            resource: resource.map(str::to_owned),
            ..Self::new(DebugEventKind::ScriptLoad, Some(thread), None)
        }
    }

    /// Whether this is a suspend event
    pub fn is_suspend(&self) -> bool {
        self.kind == DebugEventKind::Suspend
    }
}

impl fmt::Display for DebugEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(reason) = self.reason {
            write!(f, " ({reason})")?;
        }
        match (&self.resource, self.line) {
            (Some(resource), Some(line)) => write!(f, " at {resource}:{line}"),
            (None, Some(line)) => write!(f, " at <dynamic>:{line}"),
            (Some(resource), None) => write!(f, " {resource}"),
            (None, None) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_event_display() {
        let thread = thread::current().id();
        let event = DebugEvent::suspend(thread, EventReason::Breakpoint, Some("main"), 3);
        assert!(event.is_suspend());
        assert_eq!(event.to_string(), "Suspend (breakpoint) at main:3");

        let event = DebugEvent::terminate(None, EventReason::StartupFailure);
        assert_eq!(event.to_string(), "Terminate (startup-failure)");
        assert_eq!(event.thread, None);
    }
}
