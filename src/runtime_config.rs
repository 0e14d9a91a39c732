// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the TickForge engine. Every tunable lives
// here. Persistence uses an atomic tmp + rename pattern to prevent corruption
// on crash. All fields carry `#[serde(default)]` so adding new fields never
// breaks loading an older config file.
//
// Credentials and the feed URL can be overridden from the environment
// (TICKFORGE_FEED_URL, TICKFORGE_BEARER_TOKEN, TICKFORGE_CLIENT_ID,
// TICKFORGE_FEED_TOKEN, TICKFORGE_SUBSCRIPTIONS, TICKFORGE_BIND_ADDR,
// TICKFORGE_API_TOKEN) so that secrets stay out of the JSON file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::CoreError;
use crate::types::{SubscriptionKey, Timeframe, VolumeMode, AGGREGATED_TIMEFRAMES};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_feed_url() -> String {
    "wss://feed.example.net/quotes".to_string()
}

fn default_source_tag() -> String {
    "primary-feed".to_string()
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_heartbeat_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_auth_timeout_secs() -> u64 {
    10
}

fn default_reconnect_base_delay_ms() -> u64 {
    500
}

fn default_reconnect_max_attempts() -> u32 {
    10
}

fn default_tick_batch_size() -> usize {
    500
}

fn default_tick_batch_timeout_ms() -> u64 {
    1_000
}

fn default_tick_max_age_hours() -> u64 {
    24
}

fn default_delayed_threshold_secs() -> u64 {
    5
}

fn default_clock_skew_secs() -> u64 {
    3
}

fn default_corrupted_jump_pct() -> u32 {
    10
}

fn default_candle_flush_batch_size() -> usize {
    200
}

fn default_candle_flush_interval_secs() -> u64 {
    5
}

fn default_stale_multiplier() -> u32 {
    2
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_low_volume_tick_count() -> u64 {
    5
}

fn default_suspicious_range_pct() -> u32 {
    10
}

fn default_timeframes() -> Vec<Timeframe> {
    AGGREGATED_TIMEFRAMES.to_vec()
}

fn default_sma_period() -> usize {
    20
}

fn default_ema_period() -> usize {
    20
}

fn default_rsi_period() -> usize {
    14
}

fn default_macd_fast() -> usize {
    12
}

fn default_macd_slow() -> usize {
    26
}

fn default_macd_signal() -> usize {
    9
}

fn default_partitions() -> usize {
    8
}

fn default_worker_count() -> usize {
    4
}

fn default_cache_ttl_secs() -> u64 {
    5
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_subscriptions() -> Vec<SubscriptionKey> {
    ["RELIANCE", "TCS", "INFY", "HDFCBANK", "SBIN"]
        .into_iter()
        .map(|s| SubscriptionKey::new(s, "NSE"))
        .collect()
}

// =============================================================================
// Sections
// =============================================================================

/// Upstream feed connection and reliability settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSettings {
    #[serde(default = "default_feed_url")]
    pub url: String,

    /// Auth triple sent in the auth frame. Usually injected from the
    /// environment rather than the JSON file.
    #[serde(default)]
    pub bearer_token: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub feed_token: String,

    /// Source tag stamped on every tick produced by this connection.
    #[serde(default = "default_source_tag")]
    pub source_tag: String,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Declared dead when no inbound traffic arrives for this long.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,

    /// Reconnect delay = base · 2^attempt.
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Terminal failure after this many consecutive failed attempts.
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            url: default_feed_url(),
            bearer_token: String::new(),
            client_id: String::new(),
            feed_token: String::new(),
            source_tag: default_source_tag(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            auth_timeout_secs: default_auth_timeout_secs(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
        }
    }
}

/// Tick validation, classification, and persistence batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "default_tick_batch_size")]
    pub tick_batch_size: usize,

    #[serde(default = "default_tick_batch_timeout_ms")]
    pub tick_batch_timeout_ms: u64,

    /// Ticks older than this are purged from the store by the retention task.
    #[serde(default = "default_tick_max_age_hours")]
    pub tick_max_age_hours: u64,

    /// A tick is Delayed when it arrives more than this many seconds after
    /// its own timestamp.
    #[serde(default = "default_delayed_threshold_secs")]
    pub delayed_threshold_secs: u64,

    /// Tolerated forward clock skew on tick timestamps.
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: u64,

    /// A tick is Corrupted when its price jumps more than this percentage
    /// from the previous tick.
    #[serde(default = "default_corrupted_jump_pct")]
    pub corrupted_jump_pct: u32,

    #[serde(default)]
    pub default_exchange: DefaultExchange,
}

/// Exchange filled in when the feed omits one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DefaultExchange(pub String);

impl Default for DefaultExchange {
    fn default() -> Self {
        Self("NSE".to_string())
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            tick_batch_size: default_tick_batch_size(),
            tick_batch_timeout_ms: default_tick_batch_timeout_ms(),
            tick_max_age_hours: default_tick_max_age_hours(),
            delayed_threshold_secs: default_delayed_threshold_secs(),
            clock_skew_secs: default_clock_skew_secs(),
            corrupted_jump_pct: default_corrupted_jump_pct(),
            default_exchange: DefaultExchange::default(),
        }
    }
}

/// Candle aggregation, completion, and persistence batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleSettings {
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<Timeframe>,

    #[serde(default)]
    pub volume_mode: VolumeMode,

    #[serde(default = "default_candle_flush_batch_size")]
    pub flush_batch_size: usize,

    #[serde(default = "default_candle_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// A forming candle older than `stale_multiplier · duration` is force-
    /// completed by the sweep.
    #[serde(default = "default_stale_multiplier")]
    pub stale_multiplier: u32,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Completed candles with fewer ticks than this are marked LowVolume.
    #[serde(default = "default_low_volume_tick_count")]
    pub low_volume_tick_count: u64,

    /// Completed candles whose (H−L)/midprice exceeds this percentage are
    /// marked Suspicious.
    #[serde(default = "default_suspicious_range_pct")]
    pub suspicious_range_pct: u32,
}

impl Default for CandleSettings {
    fn default() -> Self {
        Self {
            timeframes: default_timeframes(),
            volume_mode: VolumeMode::default(),
            flush_batch_size: default_candle_flush_batch_size(),
            flush_interval_secs: default_candle_flush_interval_secs(),
            stale_multiplier: default_stale_multiplier(),
            sweep_interval_secs: default_sweep_interval_secs(),
            low_volume_tick_count: default_low_volume_tick_count(),
            suspicious_range_pct: default_suspicious_range_pct(),
        }
    }
}

/// Streaming indicator look-back periods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSettings {
    #[serde(default = "default_sma_period")]
    pub sma_period: usize,

    #[serde(default = "default_ema_period")]
    pub ema_period: usize,

    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,

    #[serde(default = "default_macd_fast")]
    pub macd_fast: usize,

    #[serde(default = "default_macd_slow")]
    pub macd_slow: usize,

    #[serde(default = "default_macd_signal")]
    pub macd_signal: usize,
}

impl Default for IndicatorSettings {
    fn default() -> Self {
        Self {
            sma_period: default_sma_period(),
            ema_period: default_ema_period(),
            rsi_period: default_rsi_period(),
            macd_fast: default_macd_fast(),
            macd_slow: default_macd_slow(),
            macd_signal: default_macd_signal(),
        }
    }
}

/// Bus topic partitioning. Partition counts must be at least the worker
/// count so producers stay independent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    #[serde(default = "default_partitions")]
    pub tick_partitions: usize,

    #[serde(default = "default_partitions")]
    pub candle_partitions: usize,

    #[serde(default = "default_partitions")]
    pub indicator_partitions: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            tick_partitions: default_partitions(),
            candle_partitions: default_partitions(),
            indicator_partitions: default_partitions(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the TickForge engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub feed: FeedSettings,

    #[serde(default)]
    pub pipeline: PipelineSettings,

    #[serde(default)]
    pub candles: CandleSettings,

    #[serde(default)]
    pub indicators: IndicatorSettings,

    #[serde(default)]
    pub bus: BusSettings,

    /// Per-symbol worker shards. Each symbol is bound to exactly one worker.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Query facade cache TTL.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// REST API bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Bearer token guarding the query endpoints. Usually injected via
    /// TICKFORGE_API_TOKEN; an empty token disables the query surface.
    #[serde(default)]
    pub api_token: String,

    /// Subscriptions established at startup.
    #[serde(default = "default_subscriptions")]
    pub subscriptions: Vec<SubscriptionKey>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            feed: FeedSettings::default(),
            pipeline: PipelineSettings::default(),
            candles: CandleSettings::default(),
            indicators: IndicatorSettings::default(),
            bus: BusSettings::default(),
            worker_count: default_worker_count(),
            cache_ttl_secs: default_cache_ttl_secs(),
            bind_addr: default_bind_addr(),
            api_token: String::new(),
            subscriptions: default_subscriptions(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            subscriptions = config.subscriptions.len(),
            workers = config.worker_count,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply environment overrides for the feed endpoint, credentials,
    /// subscription list, and bind address.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("TICKFORGE_FEED_URL") {
            self.feed.url = url;
        }
        if let Ok(token) = std::env::var("TICKFORGE_BEARER_TOKEN") {
            self.feed.bearer_token = token;
        }
        if let Ok(id) = std::env::var("TICKFORGE_CLIENT_ID") {
            self.feed.client_id = id;
        }
        if let Ok(token) = std::env::var("TICKFORGE_FEED_TOKEN") {
            self.feed.feed_token = token;
        }
        if let Ok(addr) = std::env::var("TICKFORGE_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Ok(token) = std::env::var("TICKFORGE_API_TOKEN") {
            self.api_token = token;
        }
        if let Ok(subs) = std::env::var("TICKFORGE_SUBSCRIPTIONS") {
            let parsed: Vec<SubscriptionKey> = subs
                .split(',')
                .filter_map(|s| SubscriptionKey::parse(s.trim()))
                .collect();
            if !parsed.is_empty() {
                self.subscriptions = parsed;
            }
        }
    }

    /// Fail-fast validation, run once at startup.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.feed.url.is_empty() {
            return Err(CoreError::InvalidConfiguration("feed.url is empty".into()));
        }
        if self.worker_count == 0 {
            return Err(CoreError::InvalidConfiguration("worker_count must be > 0".into()));
        }
        if self.pipeline.tick_batch_size == 0 {
            return Err(CoreError::InvalidConfiguration(
                "pipeline.tick_batch_size must be > 0".into(),
            ));
        }
        if self.candles.timeframes.is_empty() {
            return Err(CoreError::InvalidConfiguration(
                "candles.timeframes is empty".into(),
            ));
        }
        if self.candles.stale_multiplier == 0 {
            return Err(CoreError::InvalidConfiguration(
                "candles.stale_multiplier must be > 0".into(),
            ));
        }
        for tf in &self.candles.timeframes {
            if !AGGREGATED_TIMEFRAMES.contains(tf) {
                return Err(CoreError::InvalidConfiguration(format!(
                    "timeframe {tf} is not aggregated from ticks"
                )));
            }
        }
        for (name, period) in [
            ("sma_period", self.indicators.sma_period),
            ("ema_period", self.indicators.ema_period),
            ("rsi_period", self.indicators.rsi_period),
            ("macd_fast", self.indicators.macd_fast),
            ("macd_slow", self.indicators.macd_slow),
            ("macd_signal", self.indicators.macd_signal),
        ] {
            if period == 0 {
                return Err(CoreError::InvalidConfiguration(format!(
                    "indicators.{name} must be > 0"
                )));
            }
        }
        let min_partitions = self
            .bus
            .tick_partitions
            .min(self.bus.candle_partitions)
            .min(self.bus.indicator_partitions);
        if min_partitions < self.worker_count {
            return Err(CoreError::InvalidConfiguration(format!(
                "bus partition counts must be >= worker_count ({})",
                self.worker_count
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.worker_count, 4);
        assert_eq!(cfg.feed.heartbeat_interval_secs, 10);
        assert_eq!(cfg.feed.reconnect_max_attempts, 10);
        assert_eq!(cfg.pipeline.tick_batch_size, 500);
        assert_eq!(cfg.pipeline.delayed_threshold_secs, 5);
        assert_eq!(cfg.candles.stale_multiplier, 2);
        assert_eq!(cfg.candles.timeframes.len(), 5);
        assert_eq!(cfg.indicators.rsi_period, 14);
        assert_eq!(cfg.indicators.macd_fast, 12);
        assert_eq!(cfg.indicators.macd_slow, 26);
        assert_eq!(cfg.indicators.macd_signal, 9);
        assert_eq!(cfg.subscriptions.len(), 5);
        assert_eq!(cfg.subscriptions[0].exchange, "NSE");
        assert!(cfg.api_token.is_empty());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.worker_count, 4);
        assert_eq!(cfg.candles.volume_mode, VolumeMode::DayCumulative);
        assert_eq!(cfg.bus.tick_partitions, 8);
        assert_eq!(cfg.pipeline.default_exchange.0, "NSE");
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "worker_count": 2,
            "feed": { "url": "wss://example.org/feed" },
            "candles": { "timeframes": ["1m", "5m"], "volume_mode": "PerTickDelta" }
        }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.worker_count, 2);
        assert_eq!(cfg.feed.url, "wss://example.org/feed");
        assert_eq!(cfg.feed.heartbeat_timeout_secs, 30);
        assert_eq!(
            cfg.candles.timeframes,
            vec![Timeframe::M1, Timeframe::M5]
        );
        assert_eq!(cfg.candles.volume_mode, VolumeMode::PerTickDelta);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.worker_count, cfg2.worker_count);
        assert_eq!(cfg.subscriptions, cfg2.subscriptions);
        assert_eq!(cfg.candles.timeframes, cfg2.candles.timeframes);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = RuntimeConfig::default();
        cfg.worker_count = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.feed.url.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.candles.timeframes = vec![Timeframe::D1];
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.bus.tick_partitions = 1;
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.indicators.rsi_period = 0;
        assert!(cfg.validate().is_err());
    }
}
