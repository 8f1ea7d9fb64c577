//! Engine and debugger configuration

use crate::error::{Result, ScriptError};
use crate::language::ScriptLanguage;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScriptHostConfig {
    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Debugger settings
    #[serde(default)]
    pub debug: DebugOptions,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Engine name, used for the worker thread and in logs
    #[serde(default = "default_engine_name")]
    pub name: String,

    /// Backend language
    #[serde(default = "default_language")]
    pub language: ScriptLanguage,

    /// Terminate the worker once the queue stays empty for `idle_timeout`
    #[serde(default)]
    pub terminate_on_idle: bool,

    /// Grace interval before an idle engine terminates
    #[serde(with = "humantime_serde", default = "default_idle_timeout")]
    pub idle_timeout: Duration,

    /// Write job scope changes back into the engine variables
    #[serde(default)]
    pub persist_scope: bool,

    /// Maximum interpreter operations per job (0 = unlimited)
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,

    /// Maximum string length (0 = unlimited)
    #[serde(default = "default_max_string_size")]
    pub max_string_size: usize,

    /// Maximum function call depth
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,

    /// Module resolution
    #[serde(default)]
    pub modules: ModuleConfig,
}

impl EngineConfig {
    /// Default configuration for `language`
    pub fn for_language(language: ScriptLanguage) -> Self {
        Self {
            language,
            ..Self::default()
        }
    }

    /// Configuration used by interactive shells
    ///
    /// Scope persists across lines and the worker stops after a short idle period.
    pub fn repl(language: ScriptLanguage) -> Self {
        Self {
            name: "repl".to_string(),
            language,
            terminate_on_idle: true,
            idle_timeout: Duration::from_secs(1),
            persist_scope: true,
            ..Self::default()
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: default_engine_name(),
            language: default_language(),
            terminate_on_idle: false,
            idle_timeout: default_idle_timeout(),
            persist_scope: false,
            max_operations: default_max_operations(),
            max_string_size: default_max_string_size(),
            max_call_depth: default_max_call_depth(),
            modules: ModuleConfig::default(),
        }
    }
}

/// Module resolution settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleConfig {
    /// Directories searched for imports, in order
    #[serde(default)]
    pub roots: Vec<PathBuf>,

    /// File extension appended to dotted import names
    #[serde(default = "default_module_extension")]
    pub extension: String,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            extension: default_module_extension(),
        }
    }
}

/// Debug target options
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DebugOptions {
    /// Suspend before the first statement of the first job
    #[serde(default)]
    pub suspend_on_startup: bool,

    /// Suspend whenever a tracked script or module is loaded
    #[serde(default)]
    pub suspend_on_script_load: bool,

    /// Include code without a resource identity in debugging
    #[serde(default)]
    pub track_dynamic_code: bool,
}

fn default_engine_name() -> String {
    "default".to_string()
}

fn default_language() -> ScriptLanguage {
    ScriptLanguage::Rhai
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_operations() -> u64 {
    0
}

fn default_max_string_size() -> usize {
    10 * 1024 * 1024
}

fn default_max_call_depth() -> usize {
    64
}

fn default_module_extension() -> String {
    "rhai".to_string()
}

/// Configuration file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// TOML format
    Toml,
    /// JSON format
    Json,
}

impl ConfigFormat {
    /// Detect format from file extension
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Ok(Self::Yaml),
            Some("toml") => Ok(Self::Toml),
            Some("json") => Ok(Self::Json),
            _ => Err(ScriptError::config(format!(
                "Unsupported config format: {}",
                path.display()
            ))),
        }
    }
}

/// Load configuration from a file
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<ScriptHostConfig> {
    let path = path.as_ref();

    let content = fs::read_to_string(path)
        .map_err(|e| ScriptError::config(format!("Failed to read config file: {e}")))?;

    let format = ConfigFormat::from_path(path)?;

    let config = load_from_str(&content, format)?;
    validate(&config)?;
    Ok(config)
}

/// Expand environment variables in configuration string
/// Supports syntax: ${VAR} and ${VAR:-default}
pub fn expand_env_vars(content: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}")
        .map_err(|e| ScriptError::config(format!("Invalid regex: {e}")))?;

    let mut result = String::with_capacity(content.len());
    let mut last_match = 0;

    for cap in re.captures_iter(content) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        let var_name = var_name.as_str();

        let value = match (env::var(var_name), cap.get(3)) {
            (Ok(val), _) => val,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                return Err(ScriptError::config(format!(
                    "Environment variable '{var_name}' not set and no default provided"
                )));
            }
        };

        result.push_str(&content[last_match..full_match.start()]);
        result.push_str(&value);
        last_match = full_match.end();
    }

    result.push_str(&content[last_match..]);

    Ok(result)
}

/// Load configuration from a string
pub fn load_from_str(content: &str, format: ConfigFormat) -> Result<ScriptHostConfig> {
    let expanded_content = expand_env_vars(content)?;

    let config = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(&expanded_content)
            .map_err(|e| ScriptError::config(format!("Failed to parse YAML: {e}")))?,
        ConfigFormat::Toml => toml::from_str(&expanded_content)
            .map_err(|e| ScriptError::config(format!("Failed to parse TOML: {e}")))?,
        ConfigFormat::Json => serde_json::from_str(&expanded_content)
            .map_err(|e| ScriptError::config(format!("Failed to parse JSON: {e}")))?,
    };

    Ok(config)
}

/// Validate configuration values
pub fn validate(config: &ScriptHostConfig) -> Result<()> {
    let engine = &config.engine;

    if engine.name.trim().is_empty() {
        return Err(ScriptError::config("engine.name must not be empty"));
    }

    if engine.terminate_on_idle && engine.idle_timeout.is_zero() {
        return Err(ScriptError::config(
            "engine.idle_timeout must be positive when terminate_on_idle is set",
        ));
    }

    if engine.max_call_depth == 0 {
        return Err(ScriptError::config("engine.max_call_depth must be at least 1"));
    }

    if engine.modules.roots.iter().any(|root| root.as_os_str().is_empty()) {
        return Err(ScriptError::config("engine.modules.roots must not contain empty paths"));
    }

    let ext = &engine.modules.extension;
    if ext.is_empty() || ext.starts_with('.') || ext.contains('/') {
        return Err(ScriptError::config(format!(
            "engine.modules.extension '{ext}' must be a bare extension like 'rhai'"
        )));
    }

    Ok(())
}
