//! Configuration module for the sensor pipeline.
//!
//! Configuration is read from a TOML file, then selected values may be
//! overridden from environment variables, then the result is validated.
//!
//! ```toml
//! [[sensors]]
//! name = "temperature"
//! unit = "C"
//! min = 18.0
//! max = 26.0
//! period_ms = 500
//!
//! [processor]
//! batch_size = 10
//! batch_mode = "per_sensor"
//!
//! [logger]
//! dir = "logs"
//! prefix = "sensor"
//! max_lines = 100
//! ```

use std::collections::HashSet;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::generator::GeneratorConfig;
use crate::pipeline::BatchMode;
use crate::sink::SinkConfig;

/// Default path of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Default batch size (number of readings per summary)
const DEFAULT_BATCH_SIZE: usize = 10;

/// Maximum allowed batch size to prevent memory issues
const MAX_BATCH_SIZE: usize = 10_000;

/// Default log directory
const DEFAULT_LOG_DIR: &str = "logs";

/// Default log file prefix
const DEFAULT_LOG_PREFIX: &str = "sensor";

/// Default number of lines per log file
const DEFAULT_MAX_LINES: usize = 100;

/// Environment variables that override file values when set.
pub const ENV_BATCH_SIZE: &str = "SENSOR_PIPELINE_BATCH_SIZE";
pub const ENV_LOG_DIR: &str = "SENSOR_PIPELINE_LOG_DIR";
pub const ENV_MAX_LINES: &str = "SENSOR_PIPELINE_MAX_LINES";

/// Error type for configuration loading failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration error for {key}: {message}")]
    Invalid { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Configuration for the sensor pipeline.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    /// Simulated sensors, one generator each
    pub sensors: Vec<SensorConfig>,

    /// Batching settings
    #[serde(default)]
    pub processor: ProcessorConfig,

    /// Rotating log settings
    #[serde(default)]
    pub logger: LoggerConfig,
}

/// Settings for one simulated sensor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SensorConfig {
    pub name: String,
    pub unit: String,
    pub min: f64,
    pub max: f64,

    /// Emission period in milliseconds
    pub period_ms: u64,
}

impl SensorConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig::new(&self.name, &self.unit, self.min, self.max, self.period())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProcessorConfig {
    /// Number of readings aggregated into one summary line
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Whether sensors share one batch or get one each
    #[serde(default)]
    pub batch_mode: BatchMode,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_mode: BatchMode::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoggerConfig {
    /// Directory for log files, created if absent
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,

    /// Log file name prefix
    #[serde(default = "default_log_prefix")]
    pub prefix: String,

    /// Lines per file before rotating
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
}

impl LoggerConfig {
    pub fn sink_config(&self) -> SinkConfig {
        SinkConfig::new(&self.dir, &self.prefix, self.max_lines)
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            prefix: default_log_prefix(),
            max_lines: DEFAULT_MAX_LINES,
        }
    }
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_DIR)
}

fn default_log_prefix() -> String {
    DEFAULT_LOG_PREFIX.to_string()
}

fn default_max_lines() -> usize {
    DEFAULT_MAX_LINES
}

impl Config {
    /// Load, override and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, if an
    /// override variable is malformed, or if validation fails.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::from_toml_str(&text)?;
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text without overrides or validation.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply overrides looked up by variable name.
    ///
    /// `lookup` is normally `std::env::var`; tests pass a map instead.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_BATCH_SIZE) {
            self.processor.batch_size = parse_number(ENV_BATCH_SIZE, &value)?;
        }
        if let Some(value) = lookup(ENV_LOG_DIR) {
            self.logger.dir = PathBuf::from(value);
        }
        if let Some(value) = lookup(ENV_MAX_LINES) {
            self.logger.max_lines = parse_number(ENV_MAX_LINES, &value)?;
        }
        Ok(())
    }

    /// Check every invariant the pipeline relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sensors.is_empty() {
            return Err(ConfigError::invalid(
                "sensors",
                "at least one sensor must be configured",
            ));
        }

        let mut names = HashSet::new();
        for (i, sensor) in self.sensors.iter().enumerate() {
            let key = format!("sensors[{}]", i);

            if sensor.name.trim().is_empty() {
                return Err(ConfigError::invalid(key, "sensor name must not be empty"));
            }
            if !names.insert(sensor.name.as_str()) {
                return Err(ConfigError::invalid(
                    key,
                    format!("duplicate sensor name '{}'", sensor.name),
                ));
            }
            if !sensor.min.is_finite() || !sensor.max.is_finite() {
                return Err(ConfigError::invalid(key, "min and max must be finite"));
            }
            if sensor.min > sensor.max {
                return Err(ConfigError::invalid(
                    key,
                    format!("min {} is greater than max {}", sensor.min, sensor.max),
                ));
            }
            if sensor.period_ms == 0 {
                return Err(ConfigError::invalid(key, "period_ms must be greater than 0"));
            }
        }

        let batch_size = self.processor.batch_size;
        if batch_size == 0 {
            return Err(ConfigError::invalid(
                "processor.batch_size",
                "batch size must be greater than 0",
            ));
        }
        if batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::invalid(
                "processor.batch_size",
                format!(
                    "batch size {} exceeds maximum allowed ({})",
                    batch_size, MAX_BATCH_SIZE
                ),
            ));
        }

        if self.logger.prefix.trim().is_empty() {
            return Err(ConfigError::invalid(
                "logger.prefix",
                "prefix must not be empty",
            ));
        }
        if self.logger.max_lines == 0 {
            return Err(ConfigError::invalid(
                "logger.max_lines",
                "max lines must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Generator settings for every configured sensor.
    pub fn generator_configs(&self) -> Vec<GeneratorConfig> {
        self.sensors.iter().map(SensorConfig::generator_config).collect()
    }
}

impl Default for Config {
    /// Two sensors (temperature and pressure) with default batching and logging.
    fn default() -> Self {
        Self {
            sensors: vec![
                SensorConfig {
                    name: "temperature".to_string(),
                    unit: "C".to_string(),
                    min: 18.0,
                    max: 26.0,
                    period_ms: 500,
                },
                SensorConfig {
                    name: "pressure".to_string(),
                    unit: "hPa".to_string(),
                    min: 990.0,
                    max: 1030.0,
                    period_ms: 1_000,
                },
            ],
            processor: ProcessorConfig::default(),
            logger: LoggerConfig::default(),
        }
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(key, format!("'{}' is not a valid number", value)))
}
