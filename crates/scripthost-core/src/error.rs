//! Error types shared by engines, backends and debug targets

use rhai::EvalAltResult;

/// Result type alias using [`ScriptError`]
pub type Result<T, E = ScriptError> = std::result::Result<T, E>;

/// Error raised while submitting, executing, loading or debugging scripts
///
/// Errors are `Clone` because one outcome is delivered to the submitting
/// caller, to engine listeners and to an attached debug target.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    /// Script compilation/parsing error
    #[error("Script compilation error: {message}{}", position_suffix(.line, .column))]
    Compilation {
        /// Error message
        message: String,
        /// Line number if available
        line: Option<usize>,
        /// Column number if available
        column: Option<usize>,
    },

    /// Script runtime error
    #[error("Script execution error: {message}{}", position_suffix(.line, &None))]
    Execution {
        /// Error message
        message: String,
        /// Script line where error occurred
        line: Option<usize>,
    },

    /// An imported module could not be located
    #[error("Module not found: {module}")]
    ModuleNotFound {
        /// Import name as written in the script
        module: String,
    },

    /// The engine was terminated before the job could run
    #[error("Engine got terminated")]
    EngineTerminated,

    /// The job was cancelled by a forced termination
    #[error("Script execution was cancelled")]
    Cancelled,

    /// The backend cannot pause in the middle of a running job
    #[error("Suspending a running script is not supported by the {language} engine")]
    SuspendUnsupported {
        /// Language name
        language: String,
    },

    /// Unsupported language
    #[error("Unsupported script language: {language}")]
    UnsupportedLanguage {
        /// Language name
        language: String,
    },

    /// Rejected by the security policy
    #[error("Security violation: {message}")]
    SecurityViolation {
        /// Error message
        message: String,
    },

    /// Operation is only valid while a debug target is suspended
    #[error("Debug target is not suspended")]
    NotSuspended,

    /// Stack frame index out of range
    #[error("No stack frame at index {index}")]
    InvalidFrame {
        /// Requested frame index
        index: usize,
    },

    /// Enumerating the members of a value failed
    #[error("Failed to inspect value: {message}")]
    Inspection {
        /// Error message
        message: String,
    },

    /// Operation is not valid in the current engine or target state
    #[error("Invalid state: {message}")]
    InvalidState {
        /// Error message
        message: String,
    },

    /// Script execution panic
    #[error("Script panic: {message}")]
    Panic {
        /// Panic message
        message: String,
    },

    /// IO error (reading script files and modules)
    #[error("Script IO error: {message}")]
    Io {
        /// Error message
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },
}

fn position_suffix(line: &Option<usize>, column: &Option<usize>) -> String {
    match (line, column) {
        (Some(line), Some(column)) => format!(" at line {line}, column {column}"),
        (Some(line), None) => format!(" at line {line}"),
        _ => String::new(),
    }
}

impl ScriptError {
    /// Create a compilation error
    pub fn compilation<S: Into<String>>(message: S) -> Self {
        Self::Compilation {
            message: message.into(),
            line: None,
            column: None,
        }
    }

    /// Create an execution error
    pub fn execution<S: Into<String>>(message: S) -> Self {
        Self::Execution {
            message: message.into(),
            line: None,
        }
    }

    /// Create a module not found error
    pub fn module_not_found<S: Into<String>>(module: S) -> Self {
        Self::ModuleNotFound {
            module: module.into(),
        }
    }

    /// Create a suspend unsupported error
    pub fn suspend_unsupported<S: Into<String>>(language: S) -> Self {
        Self::SuspendUnsupported {
            language: language.into(),
        }
    }

    /// Create an unsupported language error
    pub fn unsupported_language<S: Into<String>>(language: S) -> Self {
        Self::UnsupportedLanguage {
            language: language.into(),
        }
    }

    /// Create a security violation error
    pub fn security<S: Into<String>>(message: S) -> Self {
        Self::SecurityViolation {
            message: message.into(),
        }
    }

    /// Create an inspection error
    pub fn inspection<S: Into<String>>(message: S) -> Self {
        Self::Inspection {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a panic error
    pub fn panic<S: Into<String>>(message: S) -> Self {
        Self::Panic {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether the job was cancelled rather than failing on its own
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether an import could not be resolved
    pub fn is_module_not_found(&self) -> bool {
        matches!(self, Self::ModuleNotFound { .. })
    }

    /// Line number attached to the error, if any
    pub fn line(&self) -> Option<usize> {
        match self {
            Self::Compilation { line, .. } | Self::Execution { line, .. } => *line,
            _ => None,
        }
    }

    /// Convert into a Rhai error so it can cross the interpreter boundary
    ///
    /// The `From<Box<EvalAltResult>>` conversion recovers the original
    /// variant on the way back out.
    pub fn into_rhai(self, pos: rhai::Position) -> Box<EvalAltResult> {
        match self {
            Self::ModuleNotFound { module } => EvalAltResult::ErrorModuleNotFound(module, pos),
            Self::Cancelled => EvalAltResult::ErrorTerminated(rhai::Dynamic::UNIT, pos),
            other => EvalAltResult::ErrorRuntime(rhai::Dynamic::from(other), pos),
        }
        .into()
    }
}

impl From<std::io::Error> for ScriptError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<rhai::ParseError> for ScriptError {
    fn from(err: rhai::ParseError) -> Self {
        let pos = err.position();
        Self::Compilation {
            message: err.err_type().to_string(),
            line: pos.line(),
            column: pos.position(),
        }
    }
}

impl From<Box<EvalAltResult>> for ScriptError {
    fn from(err: Box<EvalAltResult>) -> Self {
        let message = err.to_string();
        let line = err.position().line();

        match *err {
            EvalAltResult::ErrorModuleNotFound(module, _) => Self::ModuleNotFound { module },
            EvalAltResult::ErrorTerminated(..) => Self::Cancelled,
            EvalAltResult::ErrorRuntime(value, _) if value.is::<ScriptError>() => {
                value.cast::<ScriptError>()
            }
            EvalAltResult::ErrorInFunctionCall(_, _, inner, _)
            | EvalAltResult::ErrorInModule(_, inner, _) => match Self::from(inner) {
                Self::Execution { .. } => Self::Execution { message, line },
                other => other,
            },
            EvalAltResult::ErrorParsing(kind, pos) => Self::Compilation {
                message: kind.to_string(),
                line: pos.line(),
                column: pos.position(),
            },
            _ => Self::Execution { message, line },
        }
    }
}
