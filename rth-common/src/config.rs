//! Configuration for the RTH toolchain.
//!
//! Loaded from a TOML file; every field has a sensible default so an empty
//! (or absent) file yields a working configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level configuration, mirroring the sections of the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub test: TestConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Directories prepended to `PATH` when running build and test commands.
    #[serde(default = "default_path")]
    pub path: Vec<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfig {
    /// Default test timeout in seconds, used when a target declares none.
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
    /// Addresses (`host:port`) of remote test workers.
    #[serde(default)]
    pub remote_workers: Vec<String>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout_secs(),
            remote_workers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Upper bound on output-bytes-per-build-second before an artifact is
    /// refused by the size-factor cache wrapper. Zero disables the wrapper.
    #[serde(default)]
    pub max_size_factor: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_size_factor: 0 }
    }
}

fn default_path() -> Vec<String> {
    vec![
        "/usr/local/bin".to_string(),
        "/usr/bin".to_string(),
        "/bin".to_string(),
    ]
}

fn default_timeout_secs() -> u64 {
    600
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

impl Configuration {
    /// Loads configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&contents)?)
    }

    /// The default test timeout as a `Duration`.
    pub fn default_test_timeout(&self) -> Duration {
        Duration::from_secs(self.test.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Configuration::default();
        assert_eq!(config.test.timeout, 600);
        assert_eq!(config.build.path, ["/usr/local/bin", "/usr/bin", "/bin"]);
        assert!(config.test.remote_workers.is_empty());
        assert_eq!(config.cache.max_size_factor, 0);
    }

    #[test]
    fn test_parse_partial_file() {
        let config: Configuration = toml::from_str(
            r#"
            [test]
            timeout = 30
            remote_workers = ["10.0.0.1:7792", "10.0.0.2:7792"]

            [cache]
            max_size_factor = 90
            "#,
        )
        .unwrap();
        assert_eq!(config.test.timeout, 30);
        assert_eq!(config.test.remote_workers.len(), 2);
        assert_eq!(config.cache.max_size_factor, 90);
        // Unspecified sections keep their defaults.
        assert_eq!(config.build.path.len(), 3);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Configuration::load(Path::new("does_not_exist.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
