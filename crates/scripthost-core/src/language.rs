//! Script languages known to the host

use crate::error::ScriptError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported scripting languages
///
/// The identifier string (`"rhai"`, `"lua"`, ...) is the key engine
/// factories use to pick a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
    /// Rhai scripting language
    Rhai,
    /// Lua scripting language (no backend yet)
    Lua,
    /// JavaScript (no backend yet)
    JavaScript,
    /// WebAssembly (no backend yet)
    Wasm,
}

impl ScriptLanguage {
    /// Get file extension for this language
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Rhai => "rhai",
            Self::Lua => "lua",
            Self::JavaScript => "js",
            Self::Wasm => "wasm",
        }
    }

    /// Detect language from file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "rhai" => Some(Self::Rhai),
            "lua" => Some(Self::Lua),
            "js" | "javascript" => Some(Self::JavaScript),
            "wasm" => Some(Self::Wasm),
            _ => None,
        }
    }

    /// Identifier used by engine factories
    pub fn id(&self) -> &'static str {
        match self {
            Self::Rhai => "rhai",
            Self::Lua => "lua",
            Self::JavaScript => "javascript",
            Self::Wasm => "wasm",
        }
    }
}

impl fmt::Display for ScriptLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for ScriptLanguage {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rhai" => Ok(Self::Rhai),
            "lua" => Ok(Self::Lua),
            "javascript" | "js" => Ok(Self::JavaScript),
            "wasm" => Ok(Self::Wasm),
            _ => Err(ScriptError::unsupported_language(s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_ids() {
        assert_eq!("rhai".parse::<ScriptLanguage>().unwrap(), ScriptLanguage::Rhai);
        assert_eq!("JS".parse::<ScriptLanguage>().unwrap(), ScriptLanguage::JavaScript);
        assert_eq!(ScriptLanguage::JavaScript.to_string(), "javascript");

        let err = "cobol".parse::<ScriptLanguage>().unwrap_err();
        assert_eq!(err, ScriptError::unsupported_language("cobol"));
    }

    #[test]
    fn test_extensions() {
        assert_eq!(ScriptLanguage::from_extension("RHAI"), Some(ScriptLanguage::Rhai));
        assert_eq!(ScriptLanguage::from_extension("py"), None);
        assert_eq!(ScriptLanguage::Lua.extension(), "lua");
    }
}
