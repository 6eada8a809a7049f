//! Recognized configuration options.
//!
//! Defaults are compiled-in constants; a `Config` value is produced by
//! layering a JSON file and then CLI flags on top of `Config::default()`.

use serde::{Deserialize, Serialize};

pub const DEFAULT_LEASE_TTL_MS: u64 = 15_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_PARTITION_THRESHOLD_MS: u64 = 10_000;
pub const DEFAULT_SANDBOX_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_SANDBOX_MEMORY_CEILING_MB: u64 = 256;
pub const DEFAULT_FUEL_CEILING: u64 = 10_000_000;
pub const DEFAULT_DEDUP_WINDOW_MS: u64 = 60_000;
pub const DEFAULT_VALIDATION_CACHE_TTL_MS: u64 = 30_000;
pub const DEFAULT_BYZANTINE_DOWNWEIGHT_FACTOR: f64 = 0.5;
pub const DEFAULT_MAX_CONCURRENT_STEPS: u32 = 64;

/// Composite scoring weights.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub cpu: f64,
    pub mem: f64,
    pub net: f64,
    pub lat: f64,
    pub err: f64,
    pub cap: f64,
    pub queue: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            cpu: 1.0,
            mem: 1.0,
            net: 0.5,
            lat: 1.0,
            err: 1.5,
            cap: 1.0,
            queue: 0.25,
        }
    }
}

/// Autoscale thresholds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AutoscaleThresholds {
    pub up: f64,
    pub down: f64,
}

impl Default for AutoscaleThresholds {
    fn default() -> Self {
        Self { up: 0.2, down: 0.05 }
    }
}

/// Full node configuration, including the ambient logging knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_id: String,
    pub listen_addr: String,
    pub peer_bootstrap_list: Vec<String>,
    pub max_concurrent_steps: u32,
    pub lease_ttl_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub partition_threshold_ms: u64,
    pub sandbox_default_timeout_ms: u64,
    pub sandbox_memory_ceiling_mb: u64,
    pub fuel_ceiling: u64,
    pub scoring_weights: ScoringWeights,
    pub autoscale_thresholds: AutoscaleThresholds,
    pub dedup_window_ms: u64,
    pub validation_cache_ttl_ms: u64,
    pub byzantine_downweight_factor: f64,
    pub log_level: String,
    pub log_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: "node-0".to_string(),
            listen_addr: "0.0.0.0:9271".to_string(),
            peer_bootstrap_list: Vec::new(),
            max_concurrent_steps: DEFAULT_MAX_CONCURRENT_STEPS,
            lease_ttl_ms: DEFAULT_LEASE_TTL_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            partition_threshold_ms: DEFAULT_PARTITION_THRESHOLD_MS,
            sandbox_default_timeout_ms: DEFAULT_SANDBOX_TIMEOUT_MS,
            sandbox_memory_ceiling_mb: DEFAULT_SANDBOX_MEMORY_CEILING_MB,
            fuel_ceiling: DEFAULT_FUEL_CEILING,
            scoring_weights: ScoringWeights::default(),
            autoscale_thresholds: AutoscaleThresholds::default(),
            dedup_window_ms: DEFAULT_DEDUP_WINDOW_MS,
            validation_cache_ttl_ms: DEFAULT_VALIDATION_CACHE_TTL_MS,
            byzantine_downweight_factor: DEFAULT_BYZANTINE_DOWNWEIGHT_FACTOR,
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Config {
    /// Loads a JSON config file's contents, falling back to defaults for
    /// missing fields. Compiled defaults, then file, then CLI flags applied
    /// by the caller on top of this.
    pub fn from_json_str(s: &str) -> Result<Self, config_error::ConfigError> {
        config_error::parse(s)
    }
}

pub mod config_error {
    use super::Config;
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum ConfigError {
        #[error("invalid config: {0}")]
        Invalid(String),
    }

    pub fn parse(s: &str) -> Result<Config, ConfigError> {
        serde_json::from_str(s).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}
