use std::{env, path::Path, time::Duration};

use anyhow::{Context, Result};
use config as cfg;
use serde::{Deserialize, Serialize};

/// Adaptive batching knobs consumed by the sizer and the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    #[serde(default = "BatchingConfig::default_default_batch_size")]
    pub default_batch_size: usize,
    #[serde(default = "BatchingConfig::default_min_batch_size")]
    pub min_batch_size: usize,
    #[serde(default = "BatchingConfig::default_max_batch_size")]
    pub max_batch_size: usize,
    /// Admission threshold; calls are rejected outright above it.
    #[serde(default = "BatchingConfig::default_memory_threshold_percent")]
    pub memory_threshold_percent: f64,
    /// Below this the sizer is allowed to grow the candidate size.
    #[serde(default = "BatchingConfig::default_low_memory_percent")]
    pub low_memory_percent: f64,
    #[serde(default = "BatchingConfig::default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "BatchingConfig::default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "BatchingConfig::default_max_concurrent_operations")]
    pub max_concurrent_operations: usize,
    #[serde(default = "BatchingConfig::default_processing_timeout_ms")]
    pub processing_timeout_ms: u64,
}

impl BatchingConfig {
    fn default_default_batch_size() -> usize {
        100
    }
    fn default_min_batch_size() -> usize {
        10
    }
    fn default_max_batch_size() -> usize {
        1000
    }
    fn default_memory_threshold_percent() -> f64 {
        80.0
    }
    fn default_low_memory_percent() -> f64 {
        50.0
    }
    fn default_retry_attempts() -> u32 {
        3
    }
    fn default_retry_delay_ms() -> u64 {
        1000
    }
    fn default_max_concurrent_operations() -> usize {
        4
    }
    fn default_processing_timeout_ms() -> u64 {
        300_000
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            default_batch_size: Self::default_default_batch_size(),
            min_batch_size: Self::default_min_batch_size(),
            max_batch_size: Self::default_max_batch_size(),
            memory_threshold_percent: Self::default_memory_threshold_percent(),
            low_memory_percent: Self::default_low_memory_percent(),
            retry_attempts: Self::default_retry_attempts(),
            retry_delay_ms: Self::default_retry_delay_ms(),
            max_concurrent_operations: Self::default_max_concurrent_operations(),
            processing_timeout_ms: Self::default_processing_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "PoolConfig::default_capacity")]
    pub capacity: usize,
    #[serde(default = "PoolConfig::default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "PoolConfig::default_idle_ttl_ms")]
    pub idle_ttl_ms: u64,
}

impl PoolConfig {
    fn default_capacity() -> usize {
        10
    }
    fn default_acquire_timeout_ms() -> u64 {
        5_000
    }
    fn default_idle_ttl_ms() -> u64 {
        300_000
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_millis(self.idle_ttl_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: Self::default_capacity(),
            acquire_timeout_ms: Self::default_acquire_timeout_ms(),
            idle_ttl_ms: Self::default_idle_ttl_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "MetricsConfig::default_enabled")]
    pub enabled: bool,
    /// Cleanup tick; retention is one hundred intervals.
    #[serde(default = "MetricsConfig::default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "MetricsConfig::default_history_cap")]
    pub history_cap: usize,
    #[serde(default = "MetricsConfig::default_high_latency_ms")]
    pub high_latency_ms: f64,
    #[serde(default = "MetricsConfig::default_low_throughput_ops")]
    pub low_throughput_ops: f64,
    #[serde(default = "MetricsConfig::default_high_error_rate")]
    pub high_error_rate: f64,
    #[serde(default = "MetricsConfig::default_high_memory_percent")]
    pub high_memory_percent: f64,
    #[serde(default = "MetricsConfig::default_critical_memory_percent")]
    pub critical_memory_percent: f64,
}

impl MetricsConfig {
    fn default_enabled() -> bool {
        true
    }
    fn default_interval_ms() -> u64 {
        60_000
    }
    fn default_history_cap() -> usize {
        10_000
    }
    fn default_high_latency_ms() -> f64 {
        5_000.0
    }
    fn default_low_throughput_ops() -> f64 {
        10.0
    }
    fn default_high_error_rate() -> f64 {
        0.1
    }
    fn default_high_memory_percent() -> f64 {
        80.0
    }
    fn default_critical_memory_percent() -> f64 {
        95.0
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn retention_window(&self) -> Duration {
        Duration::from_millis(self.interval_ms.saturating_mul(100))
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            interval_ms: Self::default_interval_ms(),
            history_cap: Self::default_history_cap(),
            high_latency_ms: Self::default_high_latency_ms(),
            low_throughput_ops: Self::default_low_throughput_ops(),
            high_error_rate: Self::default_high_error_rate(),
            high_memory_percent: Self::default_high_memory_percent(),
            critical_memory_percent: Self::default_critical_memory_percent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default = "GraphConfig::default_space")]
    pub space: String,
}

impl GraphConfig {
    fn default_space() -> String {
        "codeindex".to_string()
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            space: Self::default_space(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    #[serde(default = "VectorConfig::default_collection")]
    pub collection: String,
    #[serde(default = "VectorConfig::default_dimension")]
    pub dimension: usize,
}

impl VectorConfig {
    fn default_collection() -> String {
        "code_chunks".to_string()
    }
    fn default_dimension() -> usize {
        384
    }
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            collection: Self::default_collection(),
            dimension: Self::default_dimension(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "Settings::default_env")]
    pub env: String,
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            env: Self::default_env(),
            batching: BatchingConfig::default(),
            pool: PoolConfig::default(),
            metrics: MetricsConfig::default(),
            graph: GraphConfig::default(),
            vector: VectorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Settings {
    fn default_env() -> String {
        env::var("APP_ENV")
            .ok()
            .or_else(|| env::var("RUST_ENV").ok())
            .unwrap_or_else(|| "development".to_string())
    }

    /// Layered load: default.toml, {env}.toml, local.toml, then
    /// CODEINDEX__* environment variables.
    pub fn load_from_sources(config_dir: &Path, env_name: &str) -> Result<Self> {
        let settings: Settings = cfg::Config::builder()
            .add_source(cfg::File::from(config_dir.join("default.toml")).required(false))
            .add_source(
                cfg::File::from(config_dir.join(format!("{}.toml", env_name))).required(false),
            )
            .add_source(cfg::File::from(config_dir.join("local.toml")).required(false))
            .add_source(cfg::Environment::with_prefix("CODEINDEX").separator("__"))
            .build()
            .context("building configuration")?
            .try_deserialize()
            .context("deserializing configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.batching.min_batch_size >= 1,
            "batching.min_batch_size must be >= 1"
        );
        anyhow::ensure!(
            self.batching.min_batch_size <= self.batching.max_batch_size,
            "batching.min_batch_size must not exceed batching.max_batch_size"
        );
        anyhow::ensure!(
            self.batching.default_batch_size >= self.batching.min_batch_size
                && self.batching.default_batch_size <= self.batching.max_batch_size,
            "batching.default_batch_size must be within [min, max]"
        );
        anyhow::ensure!(
            (0.0..=100.0).contains(&self.batching.memory_threshold_percent),
            "batching.memory_threshold_percent must be 0..=100"
        );
        anyhow::ensure!(
            self.batching.retry_attempts >= 1,
            "batching.retry_attempts must be >= 1"
        );
        anyhow::ensure!(
            self.batching.max_concurrent_operations >= 1,
            "batching.max_concurrent_operations must be >= 1"
        );
        anyhow::ensure!(self.pool.capacity >= 1, "pool.capacity must be >= 1");
        anyhow::ensure!(
            self.metrics.history_cap >= 1,
            "metrics.history_cap must be >= 1"
        );
        anyhow::ensure!(
            self.metrics.high_memory_percent <= self.metrics.critical_memory_percent,
            "metrics.high_memory_percent must not exceed metrics.critical_memory_percent"
        );
        anyhow::ensure!(
            self.vector.dimension > 0 && self.vector.dimension <= 8192,
            "vector.dimension must be 1..=8192"
        );
        anyhow::ensure!(!self.graph.space.trim().is_empty(), "graph.space cannot be empty");
        anyhow::ensure!(
            !self.vector.collection.trim().is_empty(),
            "vector.collection cannot be empty"
        );
        Ok(())
    }
}
