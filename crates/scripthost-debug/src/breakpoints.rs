//! Breakpoint set shared between a debug target and its worker

use parking_lot::RwLock;
use scripthost_core::script::resource_id;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// A line breakpoint, keyed by resource and line
///
/// A disabled breakpoint stays in its set but never stops execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Breakpoint {
    /// Resource identity the breakpoint applies to
    pub resource: String,
    /// Line (1-based)
    pub line: usize,
    /// Whether the breakpoint stops execution
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl Breakpoint {
    /// Breakpoint on a named resource
    pub fn new(resource: impl Into<String>, line: usize) -> Self {
        Self {
            resource: resource.into(),
            line,
            enabled: true,
        }
    }

    /// Same breakpoint, enabled or disabled
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    fn key(&self) -> (String, usize) {
        (self.resource.clone(), self.line)
    }

    /// Breakpoint on a script file, keyed by its canonical path
    pub fn at_file(path: impl AsRef<Path>, line: usize) -> Self {
        Self::new(resource_id(path.as_ref()), line)
    }
}

impl fmt::Display for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.line)?;
        if !self.enabled {
            write!(f, " (disabled)")?;
        }
        Ok(())
    }
}

/// Breakpoint collection holding at most one breakpoint per location
///
/// Written by the controller, read by the worker at every checkpoint.
#[derive(Debug, Default)]
pub struct BreakpointSet {
    inner: RwLock<HashMap<(String, usize), Breakpoint>>,
}

impl BreakpointSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a breakpoint; returns false if its location was already present
    ///
    /// Re-adding a location keeps one breakpoint and takes the new
    /// `enabled` flag.
    pub fn add(&self, breakpoint: Breakpoint) -> bool {
        self.inner
            .write()
            .insert(breakpoint.key(), breakpoint)
            .is_none()
    }

    /// Remove the breakpoint at the same location; returns false if none was present
    pub fn remove(&self, breakpoint: &Breakpoint) -> bool {
        self.inner.write().remove(&breakpoint.key()).is_some()
    }

    /// Enable or disable the breakpoint at the same location
    ///
    /// Returns false if no breakpoint is set there.
    pub fn set_enabled(&self, breakpoint: &Breakpoint, enabled: bool) -> bool {
        match self.inner.write().get_mut(&breakpoint.key()) {
            Some(existing) => {
                existing.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Remove every breakpoint
    pub fn clear(&self) {
        self.inner.write().clear();
    }

    /// Whether execution at `resource:line` should stop
    ///
    /// Code without a resource identity never matches.
    pub fn hits(&self, resource: Option<&str>, line: usize) -> bool {
        let Some(resource) = resource else {
            return false;
        };
        let inner = self.inner.read();
        if inner.is_empty() {
            return false;
        }
        inner
            .get(&(resource.to_string(), line))
            .is_some_and(|breakpoint| breakpoint.enabled)
    }

    /// Sorted snapshot
    pub fn to_vec(&self) -> Vec<Breakpoint> {
        let mut all: Vec<_> = self.inner.read().values().cloned().collect();
        all.sort();
        all
    }

    /// Number of breakpoints
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakpoints_are_deduplicated() {
        let set = BreakpointSet::new();
        assert!(set.add(Breakpoint::new("main", 2)));
        assert!(!set.add(Breakpoint::new("main", 2)));
        assert!(set.add(Breakpoint::new("main", 5)));
        assert_eq!(set.len(), 2);

        assert!(set.hits(Some("main"), 2));
        assert!(!set.hits(Some("main"), 3));
        assert!(!set.hits(None, 2));

        assert!(set.remove(&Breakpoint::new("main", 2)));
        assert!(!set.remove(&Breakpoint::new("main", 2)));
        assert_eq!(set.to_vec(), vec![Breakpoint::new("main", 5)]);

        set.clear();
        assert!(set.is_empty());
    }

    #[test]
    fn test_disabled_breakpoints_do_not_hit() {
        let set = BreakpointSet::new();
        let breakpoint = Breakpoint::new("main", 4);
        assert!(set.add(breakpoint.clone().with_enabled(false)));
        assert!(!set.hits(Some("main"), 4));
        assert_eq!(set.to_vec()[0].to_string(), "main:4 (disabled)");

        assert!(set.set_enabled(&breakpoint, true));
        assert!(set.hits(Some("main"), 4));

        assert!(!set.add(breakpoint.clone().with_enabled(false)));
        assert_eq!(set.len(), 1);
        assert!(!set.hits(Some("main"), 4));

        assert!(set.remove(&breakpoint));
        assert!(!set.set_enabled(&breakpoint, true));
    }

    #[test]
    fn test_enabled_defaults_when_missing() {
        let breakpoint: Breakpoint =
            serde_json::from_str(r#"{"resource": "main", "line": 2}"#).unwrap();
        assert!(breakpoint.enabled);
    }

    #[test]
    fn test_file_breakpoints_use_canonical_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.rhai");
        std::fs::write(&path, "1").unwrap();

        let direct = Breakpoint::at_file(&path, 1);
        let dotted = Breakpoint::at_file(dir.path().join(".").join("script.rhai"), 1);
        assert_eq!(direct, dotted);
        assert_eq!(direct.to_string(), format!("{}:1", resource_id(&path)));
    }
}
