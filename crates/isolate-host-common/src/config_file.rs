//! Configuration file structures for isolate-host.
//!
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`StartupConfig`]: What to boot and how

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.isolate]
/// heap_limit_mb = 256
/// consume_fuel = true
///
/// [runtime.execution]
/// max_fuel = 10_000_000
///
/// [startup]
/// bootstrap = "./bootstrap.wasm"
/// snapshot = "./bootstrap.snap"
/// exec_args = ["--trace"]
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (isolate + execution settings).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Startup configuration.
    #[serde(default)]
    pub startup: StartupConfig,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        debug!(path = %path.as_ref().display(), "Loaded configuration file");
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// Startup settings from the config file.
///
/// Command-line values take precedence over these.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StartupConfig {
    /// Path to the bootstrap module (`.wasm` or `.wat`).
    #[serde(default)]
    pub bootstrap: Option<String>,

    /// Path to a snapshot container built from the same bootstrap.
    #[serde(default)]
    pub snapshot: Option<String>,

    /// Execution arguments placed before the script arguments.
    #[serde(default)]
    pub exec_args: Vec<String>,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert!(config.startup.bootstrap.is_none());
        assert!(config.startup.snapshot.is_none());
        assert!(config.startup.exec_args.is_empty());
        assert!(!config.runtime.isolate.consume_fuel);
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [startup]
            bootstrap = "./main.wasm"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.startup.bootstrap.as_deref(), Some("./main.wasm"));
        // Defaults applied
        assert!(config.startup.snapshot.is_none());
        assert_eq!(config.runtime.isolate.heap_limit_mb, 512);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [runtime.isolate]
            pooling_allocator = true
            max_instances = 4
            heap_limit_mb = 128
            consume_fuel = true

            [runtime.execution]
            max_fuel = 5_000_000

            [startup]
            bootstrap = "./main.wat"
            snapshot = "./main.snap"
            exec_args = ["--inspect", "--trace"]
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert!(config.runtime.isolate.pooling_allocator);
        assert_eq!(config.runtime.isolate.max_instances, 4);
        assert_eq!(config.runtime.isolate.heap_limit_mb, 128);
        assert!(config.runtime.isolate.consume_fuel);
        assert_eq!(config.runtime.execution.max_fuel, 5_000_000);
        assert_eq!(config.startup.snapshot.as_deref(), Some("./main.snap"));
        assert_eq!(config.startup.exec_args, vec!["--inspect", "--trace"]);
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(result.is_err());
    }
}
