//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::integrity::{default_database_path, DEFAULT_CHUNK_SIZE};
use crate::metrics::SamplerConfig;
use crate::watch::{parse_event_list, AggregationMode, EngineConfig, UnknownEventKind};

/// Watch engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Kinds to report. Empty means every kind.
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default = "default_inactivity_window_ms")]
    pub inactivity_window_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default)]
    pub aggregation: AggregationMode,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// Register existing subdirectories at startup.
    #[serde(default = "default_true")]
    pub recursive: bool,
}

fn default_inactivity_window_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_read_buffer_size() -> usize {
    64 * 1024
}

fn default_max_pending() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            inactivity_window_ms: default_inactivity_window_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            read_buffer_size: default_read_buffer_size(),
            aggregation: AggregationMode::default(),
            max_pending: default_max_pending(),
            recursive: true,
        }
    }
}

impl WatchConfig {
    /// Engine settings with the event allow-list resolved.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownEventKind`] for an unrecognized event name.
    pub fn engine_config(&self) -> Result<EngineConfig, UnknownEventKind> {
        Ok(EngineConfig {
            mask: parse_event_list(&self.events)?,
            inactivity_window: Duration::from_millis(self.inactivity_window_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            read_buffer_size: self.read_buffer_size,
            aggregation: self.aggregation,
            max_pending: self.max_pending,
            recursive: self.recursive,
        })
    }
}

/// Baseline store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityConfig {
    /// Database location. Defaults to the user data directory.
    #[serde(default)]
    pub database: Option<PathBuf>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            database: None,
            chunk_size: default_chunk_size(),
        }
    }
}

impl IntegrityConfig {
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.database.clone().unwrap_or_else(default_database_path)
    }
}

/// Host sampler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_read_warning_bytes")]
    pub read_warning_bytes: u64,
    #[serde(default = "default_read_critical_bytes")]
    pub read_critical_bytes: u64,
    #[serde(default = "default_cpu_warning_percent")]
    pub cpu_warning_percent: f64,
    #[serde(default = "default_cpu_critical_percent")]
    pub cpu_critical_percent: f64,
}

fn default_interval_secs() -> u64 {
    1
}

fn default_window() -> usize {
    10
}

fn default_read_warning_bytes() -> u64 {
    150 * 1024
}

fn default_read_critical_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_cpu_warning_percent() -> f64 {
    35.0
}

fn default_cpu_critical_percent() -> f64 {
    85.0
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
            window: default_window(),
            read_warning_bytes: default_read_warning_bytes(),
            read_critical_bytes: default_read_critical_bytes(),
            cpu_warning_percent: default_cpu_warning_percent(),
            cpu_critical_percent: default_cpu_critical_percent(),
        }
    }
}

impl MetricsConfig {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            interval: Duration::from_secs(self.interval_secs.max(1)),
            window: self.window.max(1),
            read_warning_bytes: self.read_warning_bytes as f64,
            read_critical_bytes: self.read_critical_bytes as f64,
            cpu_warning_percent: self.cpu_warning_percent,
            cpu_critical_percent: self.cpu_critical_percent,
            ..SamplerConfig::default()
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// Also write logs to this file.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IrondomeConfig {
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub integrity: IntegrityConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub log: LogConfig,
}
