//! Script sources submitted to an engine

use crate::error::{Result, ScriptError};
use crate::language::ScriptLanguage;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A script already parsed by a backend
///
/// Submitting a handle skips compilation. The handle is only accepted by
/// engines of the language that produced it.
#[derive(Clone)]
pub struct ScriptHandle {
    language: ScriptLanguage,
    name: Option<String>,
    program: Arc<dyn Any + Send + Sync>,
}

impl ScriptHandle {
    /// Wrap a backend's parsed program
    pub fn new<T>(language: ScriptLanguage, name: Option<String>, program: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self {
            language,
            name,
            program: Arc::new(program),
        }
    }

    /// Language the program was parsed for
    pub fn language(&self) -> ScriptLanguage {
        self.language
    }

    /// Resource identity carried over from the parsed source
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The parsed program, if it is a `T`
    pub fn program<T: Any>(&self) -> Option<&T> {
        self.program.downcast_ref()
    }
}

impl PartialEq for ScriptHandle {
    fn eq(&self, other: &Self) -> bool {
        self.language == other.language
            && self.name == other.name
            && Arc::ptr_eq(&self.program, &other.program)
    }
}

impl Eq for ScriptHandle {}

impl fmt::Debug for ScriptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptHandle")
            .field("language", &self.language)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Script source (inline or file-based)
///
/// A source has a stable *resource identity* when it is a file or a named
/// inline snippet. Unnamed inline code is dynamic: debug targets ignore it
/// unless dynamic code tracking is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScriptSource {
    /// Inline script code
    Inline {
        /// Script code
        code: String,
        /// Optional name, used as resource identity
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// File-based script
    File {
        /// Path to script file
        path: PathBuf,
    },
    /// Pre-parsed script
    #[serde(skip)]
    Compiled(ScriptHandle),
}

impl ScriptSource {
    /// Create inline script source
    pub fn inline<S: Into<String>>(code: S) -> Self {
        Self::Inline {
            code: code.into(),
            name: None,
        }
    }

    /// Create inline script with name
    pub fn inline_named<S: Into<String>, N: Into<String>>(code: S, name: N) -> Self {
        Self::Inline {
            code: code.into(),
            name: Some(name.into()),
        }
    }

    /// Create file-based script source
    pub fn file<P: Into<PathBuf>>(path: P) -> Self {
        Self::File { path: path.into() }
    }

    /// Get script code, reading it from disk for file sources
    ///
    /// Runs on the engine worker thread, so file reads are blocking.
    /// Pre-parsed scripts have no source text and yield an empty string.
    pub fn code(&self) -> Result<String> {
        match self {
            Self::Inline { code, .. } => Ok(code.clone()),
            Self::Compiled(_) => Ok(String::new()),
            Self::File { path } => std::fs::read_to_string(path).map_err(|e| ScriptError::Io {
                message: format!("Failed to read script file {}: {e}", path.display()),
            }),
        }
    }

    /// Stable resource identity, `None` for dynamic code
    pub fn resource(&self) -> Option<String> {
        match self {
            Self::Inline { name, .. } => name.clone(),
            Self::File { path } => Some(resource_id(path)),
            Self::Compiled(handle) => handle.name.clone(),
        }
    }

    /// Whether this source has no resource identity
    pub fn is_dynamic(&self) -> bool {
        match self {
            Self::Inline { name, .. } => name.is_none(),
            Self::File { .. } => false,
            Self::Compiled(handle) => handle.name.is_none(),
        }
    }

    /// The parsed program of a pre-parsed source
    pub fn handle(&self) -> Option<&ScriptHandle> {
        match self {
            Self::Compiled(handle) => Some(handle),
            _ => None,
        }
    }

    /// Get a descriptive name for this script
    pub fn name(&self) -> String {
        match self {
            Self::Inline { name, .. } => name.clone().unwrap_or_else(|| "inline".to_string()),
            Self::File { path } => path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unknown")
                .to_string(),
            Self::Compiled(handle) => handle
                .name
                .clone()
                .unwrap_or_else(|| "compiled".to_string()),
        }
    }
}

impl From<&str> for ScriptSource {
    fn from(code: &str) -> Self {
        Self::inline(code)
    }
}

impl From<String> for ScriptSource {
    fn from(code: String) -> Self {
        Self::inline(code)
    }
}

impl From<PathBuf> for ScriptSource {
    fn from(path: PathBuf) -> Self {
        Self::file(path)
    }
}

impl From<ScriptHandle> for ScriptSource {
    fn from(handle: ScriptHandle) -> Self {
        Self::Compiled(handle)
    }
}

/// Canonical identity string for a script file
///
/// Breakpoints, module caches and stack frames all key files by this
/// string, so two spellings of one path resolve to the same resource.
pub fn resource_id(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}
