//! Configuration management for Lynx services.
//!
//! Configuration lives in a single JSON file at `~/.lynx/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (LYNX_* prefix)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `LYNX_HOST` → network.host
//! - `LYNX_PORT` → network.port
//! - `LYNX_LOG_LEVEL` → observability.log_level
//! - `LYNX_LOG_FORMAT` → observability.log_format
//! - `LYNX_DB_PATH` → storage.db_path
//! - `LYNX_CIRCUIT_THRESHOLD` → circuit.failure_threshold
//! - `LYNX_CIRCUIT_COOLDOWN_SECS` → circuit.cooldown_secs
//! - `LYNX_BAOSTOCK_ADDR` → providers.baostock_addr

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Error;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".lynx"),
        |dirs| dirs.home_dir().join(".lynx"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Network Configuration
// ============================================================================

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Bind host. Default is local only.
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Allowed CORS origins. Empty means any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    4450
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Storage Configuration
// ============================================================================

/// Persistent store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Rows per committed transaction during bulk snapshot write-back
    #[serde(default = "default_write_back_chunk")]
    pub write_back_chunk: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            write_back_chunk: default_write_back_chunk(),
        }
    }
}

fn default_db_path() -> PathBuf {
    config_dir().join("data").join("lynx.db")
}

fn default_write_back_chunk() -> usize {
    100
}

// ============================================================================
// Cache Configuration
// ============================================================================

/// TTLs for the in-process cache tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_quote_ttl")]
    pub quote_ttl_secs: u64,

    #[serde(default = "default_history_ttl")]
    pub history_ttl_secs: u64,

    #[serde(default = "default_universe_ttl")]
    pub universe_ttl_secs: u64,

    /// EPS TTM and other slow-moving figures
    #[serde(default = "default_fundamentals_ttl")]
    pub fundamentals_ttl_secs: u64,

    /// Freshness window of the whole-market snapshot
    #[serde(default = "default_snapshot_ttl")]
    pub snapshot_ttl_secs: u64,

    /// Maximum age of a persisted quote row still served from the store
    #[serde(default = "default_persisted_max_age")]
    pub persisted_max_age_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            quote_ttl_secs: default_quote_ttl(),
            history_ttl_secs: default_history_ttl(),
            universe_ttl_secs: default_universe_ttl(),
            fundamentals_ttl_secs: default_fundamentals_ttl(),
            snapshot_ttl_secs: default_snapshot_ttl(),
            persisted_max_age_secs: default_persisted_max_age(),
        }
    }
}

fn default_quote_ttl() -> u64 {
    300
}

fn default_history_ttl() -> u64 {
    300
}

fn default_universe_ttl() -> u64 {
    3600
}

fn default_fundamentals_ttl() -> u64 {
    6 * 3600
}

fn default_snapshot_ttl() -> u64 {
    300
}

fn default_persisted_max_age() -> u64 {
    1800
}

// ============================================================================
// Provider Configuration
// ============================================================================

/// Upstream market-data provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Real-time quote API base (snapshot and instrument list)
    #[serde(default = "default_eastmoney_base")]
    pub eastmoney_base: String,

    /// Historical kline API base
    #[serde(default = "default_eastmoney_hist_base")]
    pub eastmoney_hist_base: String,

    /// Session provider address (host:port)
    #[serde(default = "default_baostock_addr")]
    pub baostock_addr: String,

    /// Per-request timeout, kept below `screening.item_timeout_secs`
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum in-flight requests to the snapshot provider
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Minimum spacing between requests, keyed by host suffix
    #[serde(default = "default_host_intervals")]
    pub host_intervals_ms: HashMap<String, u64>,

    /// Spacing for hosts without an explicit entry
    #[serde(default = "default_interval_ms")]
    pub default_interval_ms: u64,

    /// Upper bound of the random delay added after each wait
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            eastmoney_base: default_eastmoney_base(),
            eastmoney_hist_base: default_eastmoney_hist_base(),
            baostock_addr: default_baostock_addr(),
            request_timeout_secs: default_request_timeout(),
            concurrency: default_concurrency(),
            host_intervals_ms: default_host_intervals(),
            default_interval_ms: default_interval_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

fn default_eastmoney_base() -> String {
    "https://push2.eastmoney.com".into()
}

fn default_eastmoney_hist_base() -> String {
    "https://push2his.eastmoney.com".into()
}

fn default_baostock_addr() -> String {
    "www.baostock.com:10030".into()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_concurrency() -> usize {
    10
}

fn default_host_intervals() -> HashMap<String, u64> {
    HashMap::from([
        ("eastmoney.com".to_string(), 1000),
        ("sina.com.cn".to_string(), 800),
        ("baostock.com".to_string(), 0),
    ])
}

fn default_interval_ms() -> u64 {
    500
}

fn default_jitter_ms() -> u64 {
    50
}

// ============================================================================
// Circuit Breaker Configuration
// ============================================================================

/// Provider circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive tripping failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open circuit skips its provider
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    2
}

fn default_cooldown_secs() -> u64 {
    600
}

// ============================================================================
// Screening Configuration
// ============================================================================

/// Batch screening pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningConfig {
    /// Instruments per progress batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Delay between consecutive fetches inside a batch
    #[serde(default = "default_item_delay_ms")]
    pub item_delay_ms: u64,

    /// Hard limit for fetching one instrument
    #[serde(default = "default_item_timeout")]
    pub item_timeout_secs: u64,

    /// Tasks kept in the registry before the oldest is evicted
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            item_delay_ms: default_item_delay_ms(),
            item_timeout_secs: default_item_timeout(),
            max_tasks: default_max_tasks(),
        }
    }
}

fn default_batch_size() -> usize {
    50
}

fn default_item_delay_ms() -> u64 {
    300
}

fn default_item_timeout() -> u64 {
    15
}

fn default_max_tasks() -> usize {
    100
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub providers: ProvidersConfig,

    #[serde(default)]
    pub circuit: CircuitConfig,

    #[serde(default)]
    pub screening: ScreeningConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("LYNX_HOST") {
            self.network.host = host;
        }
        if let Some(port) = env_parse("LYNX_PORT") {
            self.network.port = port;
        }
        if let Ok(level) = std::env::var("LYNX_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Ok(format) = std::env::var("LYNX_LOG_FORMAT") {
            self.observability.log_format = format;
        }
        if let Ok(path) = std::env::var("LYNX_DB_PATH") {
            self.storage.db_path = PathBuf::from(path);
        }
        if let Some(threshold) = env_parse("LYNX_CIRCUIT_THRESHOLD") {
            self.circuit.failure_threshold = threshold;
        }
        if let Some(secs) = env_parse("LYNX_CIRCUIT_COOLDOWN_SECS") {
            self.circuit.cooldown_secs = secs;
        }
        if let Ok(addr) = std::env::var("LYNX_BAOSTOCK_ADDR") {
            self.providers.baostock_addr = addr;
        }
    }

    /// Check values that would make the service unusable.
    pub fn validate(&self) -> crate::Result<()> {
        let mut problems = Vec::new();

        if self.network.port == 0 {
            problems.push("network.port must be between 1 and 65535");
        }
        if self.screening.batch_size == 0 {
            problems.push("screening.batch_size must be positive");
        }
        if self.screening.max_tasks == 0 {
            problems.push("screening.max_tasks must be positive");
        }
        if self.storage.write_back_chunk == 0 {
            problems.push("storage.write_back_chunk must be positive");
        }
        if self.providers.concurrency == 0 {
            problems.push("providers.concurrency must be positive");
        }
        if self.circuit.failure_threshold == 0 {
            problems.push("circuit.failure_threshold must be positive");
        }
        if self.providers.request_timeout_secs >= self.screening.item_timeout_secs {
            problems.push(
                "providers.request_timeout_secs must be below screening.item_timeout_secs",
            );
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }

    /// Socket address string for the HTTP listener.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.network.host, self.network.port)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.network.port, 4450);
        assert_eq!(config.circuit.failure_threshold, 2);
        assert_eq!(config.circuit.cooldown_secs, 600);
        assert_eq!(config.screening.batch_size, 50);
        assert_eq!(config.screening.item_delay_ms, 300);
        assert_eq!(config.screening.item_timeout_secs, 15);
        assert_eq!(config.screening.max_tasks, 100);
        assert_eq!(config.providers.concurrency, 10);
        assert_eq!(config.providers.request_timeout_secs, 10);
        assert_eq!(config.providers.host_intervals_ms.get("eastmoney.com"), Some(&1000));
        assert_eq!(config.bind_address(), "127.0.0.1:4450");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"network": {{"port": 9000}}, "circuit": {{"cooldown_secs": 60}}, "observability": {{"level": "debug"}}}}"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.network.port, 9000);
        assert_eq!(config.network.host, "127.0.0.1");
        assert_eq!(config.circuit.cooldown_secs, 60);
        assert_eq!(config.circuit.failure_threshold, 2);
        assert_eq!(config.observability.log_level, "debug");
    }

    #[test]
    fn test_load_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(Config::load_from(file.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("LYNX_CIRCUIT_THRESHOLD", "5");
        std::env::set_var("LYNX_BAOSTOCK_ADDR", "127.0.0.1:10030");
        let mut config = Config::default();
        config.apply_env_overrides();
        std::env::remove_var("LYNX_CIRCUIT_THRESHOLD");
        std::env::remove_var("LYNX_BAOSTOCK_ADDR");

        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.providers.baostock_addr, "127.0.0.1:10030");
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = Config::default();
        config.screening.batch_size = 0;
        config.storage.write_back_chunk = 0;
        let err = config.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("batch_size"));
        assert!(msg.contains("write_back_chunk"));
    }

    #[test]
    fn test_validate_rejects_request_timeout_past_item_budget() {
        let mut config = Config::default();
        config.providers.request_timeout_secs = 30;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("request_timeout_secs"));

        config.providers.request_timeout_secs = 14;
        assert!(config.validate().is_ok());
    }
}
