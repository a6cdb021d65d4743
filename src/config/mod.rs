//! Configuration module for sigtap
//!
//! The service is configured from a single TOML file with one table per
//! concern:
//!
//! - `[worker]` - cadence of the acquisition loop and teardown limits
//! - `[broker]` - per-subscriber reply queue sizes
//! - `[taps]` - buffer sizes of the in-process sink registry
//! - `[logging]` - default log filter and optional log directory
//! - `[simulation]` - parameters of the simulated processing graph
//!
//! Every field has a serde default so partial files are accepted.
//!
//! # Config Location
//!
//! Without an explicit path the configuration is looked up in the
//! platform-appropriate config directory under `sigtap/config.toml`.
//!
//! # Example
//!
//! ```ignore
//! use sigtap::config::AcqConfig;
//!
//! let config = AcqConfig::load_or_default("sigtap.toml");
//! assert!(config.worker.update_period_ms > 0);
//! ```

use crate::error::{AcqError, Result, ResultExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for config directories
pub const APP_ID: &str = "sigtap";

/// Config filename
pub const CONFIG_FILE: &str = "config.toml";

/// Default cadence of the acquisition loop in milliseconds
pub const DEFAULT_UPDATE_PERIOD_MS: u64 = 40;

/// Default upper bound for draining taps before a scheduler is torn down
pub const DEFAULT_TEARDOWN_TIMEOUT_MS: u64 = 5_000;

/// Default per-subscriber reply queue size
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// Default number of samples a streaming tap buffers
pub const DEFAULT_STREAMING_CAPACITY: usize = 65_536;

/// Default number of completed datasets a windowed tap buffers
pub const DEFAULT_DATASET_CAPACITY: usize = 64;

// ==================== Config Paths ====================

/// Get the default config file path
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID).join(CONFIG_FILE))
}

// ==================== Acquisition Config ====================

/// Complete service configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AcqConfig {
    /// Acquisition loop settings
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Subscriber queue settings
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Tap buffer settings
    #[serde(default)]
    pub taps: TapConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Simulated engine settings
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl AcqConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a config file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AcqError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, returning defaults on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the config to disk as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AcqError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| AcqError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            AcqError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }

    /// Reject values the worker cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.worker.update_period_ms == 0 {
            return Err(AcqError::Config(
                "worker.update_period_ms must be greater than zero".to_string(),
            ));
        }
        if self.worker.command_capacity == 0 {
            return Err(AcqError::Config(
                "worker.command_capacity must be greater than zero".to_string(),
            ));
        }
        if self.broker.subscriber_capacity == 0 {
            return Err(AcqError::Config(
                "broker.subscriber_capacity must be greater than zero".to_string(),
            ));
        }
        if self.taps.streaming_capacity == 0 || self.taps.dataset_capacity == 0 {
            return Err(AcqError::Config(
                "tap capacities must be greater than zero".to_string(),
            ));
        }
        if self.simulation.block_size == 0 {
            return Err(AcqError::Config(
                "simulation.block_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

// ==================== Worker Config ====================

/// Acquisition loop configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Fixed cadence of the acquisition loop in milliseconds
    #[serde(default = "default_update_period_ms")]
    pub update_period_ms: u64,

    /// Maximum time spent draining taps before a scheduler is joined anyway
    #[serde(default = "default_teardown_timeout_ms")]
    pub teardown_timeout_ms: u64,

    /// Capacity of the command channel into the worker thread
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
}

fn default_update_period_ms() -> u64 {
    DEFAULT_UPDATE_PERIOD_MS
}

fn default_teardown_timeout_ms() -> u64 {
    DEFAULT_TEARDOWN_TIMEOUT_MS
}

fn default_command_capacity() -> usize {
    64
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            update_period_ms: DEFAULT_UPDATE_PERIOD_MS,
            teardown_timeout_ms: DEFAULT_TEARDOWN_TIMEOUT_MS,
            command_capacity: 64,
        }
    }
}

impl WorkerConfig {
    /// Loop cadence as a Duration
    pub fn update_period(&self) -> Duration {
        Duration::from_millis(self.update_period_ms)
    }

    /// Teardown drain limit as a Duration
    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}

// ==================== Broker Config ====================

/// Subscriber-side configuration of the in-process broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    /// Replies queued per subscriber before new ones are dropped
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
}

fn default_subscriber_capacity() -> usize {
    DEFAULT_SUBSCRIBER_CAPACITY
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

// ==================== Tap Config ====================

/// Buffer sizes of the in-process sink registry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TapConfig {
    /// Samples a streaming tap buffers before discarding the oldest
    #[serde(default = "default_streaming_capacity")]
    pub streaming_capacity: usize,

    /// Completed datasets a windowed tap buffers before discarding the oldest
    #[serde(default = "default_dataset_capacity")]
    pub dataset_capacity: usize,

    /// Sample rate assumed for sinks that do not declare one
    #[serde(default = "default_sample_rate")]
    pub default_sample_rate: f32,
}

fn default_streaming_capacity() -> usize {
    DEFAULT_STREAMING_CAPACITY
}

fn default_dataset_capacity() -> usize {
    DEFAULT_DATASET_CAPACITY
}

fn default_sample_rate() -> f32 {
    1.0
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            streaming_capacity: DEFAULT_STREAMING_CAPACITY,
            dataset_capacity: DEFAULT_DATASET_CAPACITY,
            default_sample_rate: 1.0,
        }
    }
}

// ==================== Logging Config ====================

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Directory for daily-rolling log files (stdout only when unset)
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_log_filter() -> String {
    "info,sigtap=debug".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            directory: None,
        }
    }
}

// ==================== Simulation Config ====================

/// Parameters of the simulated processing graph
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationConfig {
    /// Samples produced per sink per tick
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Tick period of the simulated scheduler in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

fn default_block_size() -> usize {
    256
}

fn default_tick_ms() -> u64 {
    10
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            block_size: 256,
            tick_ms: 10,
        }
    }
}

impl SimulationConfig {
    /// Tick period as a Duration
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

// ==================== Tests ====================
