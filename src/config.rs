//! Configuration System using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. An optional TOML file (`flowlab.toml` unless another path is given)
//! 3. Environment variables prefixed with `FLOWLAB_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore, so field names that
//! contain single underscores stay intact:
//!
//! ```text
//! FLOWLAB_APPLICATION__LOG_LEVEL=debug
//! FLOWLAB_EXECUTOR__SENSOR_POLL_INTERVAL=250ms
//! FLOWLAB_STORAGE__FORMAT=csv
//! ```
//!
//! # Example
//!
//! ```no_run
//! use rust_flowlab::config::FlowlabConfig;
//!
//! let config = FlowlabConfig::load().unwrap();
//! println!("Poll interval: {:?}", config.executor.sensor_poll_interval);
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or deserialized
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// Values loaded but failed validation
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::LoadError(Box::new(err))
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowlabConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Run engine settings
    pub executor: ExecutorConfig,
    /// Experiment data log settings
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit diagnostics as JSON lines instead of human-readable text
    pub json_logs: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "rust_flowlab".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Executor timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Interval between two sensor reads
    #[serde(with = "humantime_serde")]
    pub sensor_poll_interval: Duration,
    /// Upper bound on the base-state restore of one component
    #[serde(with = "humantime_serde")]
    pub restore_timeout: Duration,
    /// Upper bound on acquiring one component's resource
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            sensor_poll_interval: Duration::from_secs(1),
            restore_timeout: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// On-disk format of the experiment data log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line
    Jsonl,
    /// Comma-separated values with a JSON payload column
    Csv,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Output directory for run logs
    pub output_dir: PathBuf,
    /// Log file format
    pub format: LogFormat,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            format: LogFormat::Jsonl,
        }
    }
}

impl FlowlabConfig {
    /// Load configuration from `flowlab.toml` in the working directory, if present.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if a source cannot be parsed or the result is invalid.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("flowlab.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and the environment still apply.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be loaded or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::from(Serialized::defaults(FlowlabConfig::default()))
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("FLOWLAB_").split("__")),
        )
    }

    /// Extract and validate from an arbitrary figment
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Sensor poll interval is non-zero
    /// - Restore and acquire timeouts are non-zero
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.executor.validate()
    }
}

impl ExecutorConfig {
    /// Rejects zero intervals and timeouts.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sensor_poll_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "sensor_poll_interval must be greater than zero".to_string(),
            ));
        }

        for (name, value) in [
            ("restore_timeout", self.restore_timeout),
            ("acquire_timeout", self.acquire_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = FlowlabConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.executor.sensor_poll_interval, Duration::from_secs(1));
        assert_eq!(config.storage.format, LogFormat::Jsonl);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = FlowlabConfig::default();
        config.application.log_level = "loud".to_string();

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid log_level 'loud'"));
    }

    #[test]
    fn test_zero_poll_interval() {
        let mut config = FlowlabConfig::default();
        config.executor.sensor_poll_interval = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_executor_config_validates_alone() {
        let config = ExecutorConfig {
            acquire_timeout: Duration::ZERO,
            ..ExecutorConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("acquire_timeout"));
        assert!(ExecutorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[executor]
sensor_poll_interval = "250ms"

[storage]
format = "csv"
output_dir = "/tmp/flowlab"
"#
        )
        .unwrap();

        let config = FlowlabConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(
            config.executor.sensor_poll_interval,
            Duration::from_millis(250)
        );
        // untouched keys keep their defaults
        assert_eq!(config.executor.restore_timeout, Duration::from_secs(10));
        assert_eq!(config.storage.format, LogFormat::Csv);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = FlowlabConfig::from_figment(
            Figment::from(Serialized::defaults(FlowlabConfig::default()))
                .merge(Toml::file("/nonexistent/flowlab.toml")),
        )
        .unwrap();
        assert_eq!(config.application.name, "rust_flowlab");
    }

    #[test]
    fn test_invalid_file_is_load_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[executor]\nsensor_poll_interval = \"soon\"").unwrap();
        assert!(matches!(
            FlowlabConfig::load_from(file.path()),
            Err(ConfigError::LoadError(_))
        ));
    }
}
