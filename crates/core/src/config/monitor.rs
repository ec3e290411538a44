//! Configuration management with profile support.

use monitor_ingest::CollectorConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Profile name (for logging/identification)
    #[serde(default = "default_profile_name")]
    pub profile: String,

    /// Polling and evaluation
    #[serde(default)]
    pub engine: EngineConfig,

    /// Max-pain estimation
    #[serde(default)]
    pub maxpain: MaxPainConfig,

    /// Liquidation stream ingestion
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Built-in metric sources
    #[serde(default)]
    pub sources: SourcesConfig,
}

fn default_profile_name() -> String {
    "default".to_string()
}

/// Evaluation engine timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Poll cadence (seconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Upper bound on a single source fetch (seconds)
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Snapshots retained per source
    #[serde(default = "default_history_len")]
    pub history_len: usize,

    /// Fixed UTC offset (hours) in which digest hours are interpreted
    #[serde(default = "default_digest_offset")]
    pub digest_utc_offset_hours: i32,
}

fn default_poll_interval() -> u64 {
    60
}
fn default_fetch_timeout() -> u64 {
    30
}
fn default_history_len() -> usize {
    60
}
fn default_digest_offset() -> i32 {
    8
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            fetch_timeout_secs: default_fetch_timeout(),
            history_len: default_history_len(),
            digest_utc_offset_hours: default_digest_offset(),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Max-pain aggregation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaxPainConfig {
    /// Base assets published by the max-pain source
    #[serde(default = "default_maxpain_symbols")]
    pub symbols: Vec<String>,

    /// Proximity (%) used when a subscription leaves it unset
    #[serde(default = "default_proximity")]
    pub default_proximity_pct: f64,

    /// Bin width as a percentage of price when no fixed width is configured
    #[serde(default = "default_fallback_bin_pct")]
    pub fallback_bin_pct: f64,

    /// Fixed bin widths per symbol (quote currency units)
    #[serde(default = "default_bin_widths")]
    pub bin_widths: HashMap<String, f64>,
}

fn default_maxpain_symbols() -> Vec<String> {
    vec!["BTC".to_string(), "ETH".to_string()]
}
fn default_proximity() -> f64 {
    1.0
}
fn default_fallback_bin_pct() -> f64 {
    0.5
}
fn default_bin_widths() -> HashMap<String, f64> {
    HashMap::from([("BTC".to_string(), 100.0), ("ETH".to_string(), 5.0)])
}

impl Default for MaxPainConfig {
    fn default() -> Self {
        Self {
            symbols: default_maxpain_symbols(),
            default_proximity_pct: default_proximity(),
            fallback_bin_pct: default_fallback_bin_pct(),
            bin_widths: default_bin_widths(),
        }
    }
}

/// Liquidation ingestion parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_ws_base")]
    pub ws_base: String,

    #[serde(default = "default_rest_base")]
    pub rest_base: String,

    /// Tracked pairs (lowercase stream names)
    #[serde(default = "default_ingest_symbols")]
    pub symbols: Vec<String>,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Retention horizon for stored events (days)
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,

    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_secs: u64,

    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_secs: u64,

    /// Fetch recent liquidations over REST on startup
    #[serde(default = "default_backfill")]
    pub backfill: bool,

    #[serde(default = "default_backfill_limit")]
    pub backfill_limit: u32,
}

fn default_ws_base() -> String {
    "wss://fstream.binance.com/ws".to_string()
}
fn default_rest_base() -> String {
    "https://fapi.binance.com".to_string()
}
fn default_ingest_symbols() -> Vec<String> {
    vec!["btcusdt".to_string(), "ethusdt".to_string()]
}
fn default_flush_interval() -> u64 {
    5
}
fn default_cleanup_interval() -> u64 {
    3600
}
fn default_retention_days() -> u64 {
    30
}
fn default_reconnect_base() -> u64 {
    2
}
fn default_reconnect_max() -> u64 {
    60
}
fn default_backfill() -> bool {
    true
}
fn default_backfill_limit() -> u32 {
    100
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            ws_base: default_ws_base(),
            rest_base: default_rest_base(),
            symbols: default_ingest_symbols(),
            flush_interval_secs: default_flush_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
            retention_days: default_retention_days(),
            reconnect_base_secs: default_reconnect_base(),
            reconnect_max_secs: default_reconnect_max(),
            backfill: default_backfill(),
            backfill_limit: default_backfill_limit(),
        }
    }
}

impl IngestConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 3600)
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            ws_base: self.ws_base.clone(),
            rest_base: self.rest_base.clone(),
            symbols: self.symbols.clone(),
            flush_interval: Duration::from_secs(self.flush_interval_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            retention: self.retention(),
            reconnect_base: Duration::from_secs(self.reconnect_base_secs),
            reconnect_max: Duration::from_secs(self.reconnect_max_secs),
            backfill: self.backfill,
            backfill_limit: self.backfill_limit,
        }
    }
}

/// Built-in source selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Spot symbols polled from Binance; empty disables the source
    #[serde(default = "default_binance_symbols")]
    pub binance_symbols: Vec<String>,

    #[serde(default = "default_fear_greed")]
    pub fear_greed: bool,

    #[serde(default = "default_maxpain_source")]
    pub maxpain: bool,
}

fn default_binance_symbols() -> Vec<String> {
    vec!["BTC".to_string(), "ETH".to_string()]
}
fn default_fear_greed() -> bool {
    true
}
fn default_maxpain_source() -> bool {
    true
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            binance_symbols: default_binance_symbols(),
            fear_greed: default_fear_greed(),
            maxpain: default_maxpain_source(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            profile: default_profile_name(),
            engine: EngineConfig::default(),
            maxpain: MaxPainConfig::default(),
            ingest: IngestConfig::default(),
            sources: SourcesConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Short cycles and no backfill, for local runs against a scratch database.
    pub fn testing() -> Self {
        Self {
            profile: "testing".to_string(),
            engine: EngineConfig {
                poll_interval_secs: 10,
                fetch_timeout_secs: 5,
                history_len: 30,
                ..Default::default()
            },
            maxpain: MaxPainConfig::default(),
            ingest: IngestConfig {
                flush_interval_secs: 1,
                cleanup_interval_secs: 300,
                retention_days: 2,
                backfill: false,
                ..Default::default()
            },
            sources: SourcesConfig {
                binance_symbols: vec!["BTC".to_string()],
                ..Default::default()
            },
        }
    }

    /// Longer history and more tracked pairs.
    pub fn production() -> Self {
        Self {
            profile: "production".to_string(),
            engine: EngineConfig {
                history_len: 120,
                ..Default::default()
            },
            maxpain: MaxPainConfig {
                symbols: vec!["BTC".to_string(), "ETH".to_string(), "SOL".to_string()],
                ..Default::default()
            },
            ingest: IngestConfig {
                symbols: vec![
                    "btcusdt".to_string(),
                    "ethusdt".to_string(),
                    "solusdt".to_string(),
                ],
                backfill_limit: 1000,
                ..Default::default()
            },
            sources: SourcesConfig::default(),
        }
    }

    /// Profile from MONITOR_PROFILE, or default.
    /// Supported values: testing, production
    pub fn from_env() -> Self {
        let profile = std::env::var("MONITOR_PROFILE").unwrap_or_else(|_| "default".to_string());
        match profile.to_lowercase().as_str() {
            "testing" | "test" => Self::testing(),
            "production" | "prod" => Self::production(),
            _ => Self::default(),
        }
    }

    /// MONITOR_CONFIG file when set, otherwise the MONITOR_PROFILE profile.
    pub fn load() -> anyhow::Result<Self> {
        let config = match std::env::var("MONITOR_CONFIG") {
            Ok(path) if !path.is_empty() => Self::from_file(&path)?,
            _ => Self::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or spin the background loops.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("engine.poll_interval_secs", self.engine.poll_interval_secs),
            ("engine.fetch_timeout_secs", self.engine.fetch_timeout_secs),
            ("engine.history_len", self.engine.history_len as u64),
            ("ingest.flush_interval_secs", self.ingest.flush_interval_secs),
            ("ingest.cleanup_interval_secs", self.ingest.cleanup_interval_secs),
            ("ingest.retention_days", self.ingest.retention_days),
            ("ingest.reconnect_base_secs", self.ingest.reconnect_base_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue(format!("{} must be greater than 0", name)));
            }
        }

        if self.ingest.reconnect_max_secs < self.ingest.reconnect_base_secs {
            return Err(ConfigError::InvalidValue(format!(
                "ingest.reconnect_max_secs ({}) is below reconnect_base_secs ({})",
                self.ingest.reconnect_max_secs, self.ingest.reconnect_base_secs
            )));
        }
        if !(-12..=14).contains(&self.engine.digest_utc_offset_hours) {
            return Err(ConfigError::InvalidValue(format!(
                "engine.digest_utc_offset_hours must be within -12..=14, got {}",
                self.engine.digest_utc_offset_hours
            )));
        }
        if self.maxpain.default_proximity_pct <= 0.0 || self.maxpain.fallback_bin_pct <= 0.0 {
            return Err(ConfigError::InvalidValue(
                "maxpain proximity and fallback bin percentages must be positive".to_string(),
            ));
        }
        if let Some((symbol, width)) = self.maxpain.bin_widths.iter().find(|(_, w)| **w <= 0.0) {
            return Err(ConfigError::InvalidValue(format!(
                "maxpain.bin_widths.{} must be positive, got {}",
                symbol, width
            )));
        }
        Ok(())
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        tracing::info!(profile = %self.profile, "Monitor configuration loaded");
        tracing::info!(
            poll_interval_secs = self.engine.poll_interval_secs,
            fetch_timeout_secs = self.engine.fetch_timeout_secs,
            history_len = self.engine.history_len,
            digest_offset = self.engine.digest_utc_offset_hours,
            "Engine"
        );
        tracing::info!(
            symbols = ?self.maxpain.symbols,
            proximity_pct = self.maxpain.default_proximity_pct,
            fallback_bin_pct = self.maxpain.fallback_bin_pct,
            "Max-pain"
        );
        tracing::info!(
            symbols = ?self.ingest.symbols,
            flush_secs = self.ingest.flush_interval_secs,
            retention_days = self.ingest.retention_days,
            backfill = self.ingest.backfill,
            "Ingest"
        );
    }
}
