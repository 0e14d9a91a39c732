// =============================================================================
// Shared types used across the TickForge market-data core
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Timeframes
// =============================================================================

/// Candle bucket duration. The aggregator materialises the first five;
/// higher timeframes are produced by downstream aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mo1,
}

/// Timeframes the candle builder aggregates directly from ticks.
pub const AGGREGATED_TIMEFRAMES: [Timeframe; 5] = [
    Timeframe::M1,
    Timeframe::M5,
    Timeframe::M15,
    Timeframe::M30,
    Timeframe::H1,
];

impl Timeframe {
    /// Bucket duration in whole seconds.
    pub fn duration_secs(&self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::M30 => 1_800,
            Self::H1 => 3_600,
            Self::H4 => 14_400,
            Self::D1 => 86_400,
            Self::W1 => 604_800,
            Self::Mo1 => 2_592_000,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.duration_secs())
    }

    /// Parse the wire label ("1m", "5m", ...). Returns `None` for unknown
    /// labels.
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "1m" => Some(Self::M1),
            "5m" => Some(Self::M5),
            "15m" => Some(Self::M15),
            "30m" => Some(Self::M30),
            "1h" => Some(Self::H1),
            "4h" => Some(Self::H4),
            "1d" => Some(Self::D1),
            "1w" => Some(Self::W1),
            "1M" => Some(Self::Mo1),
            _ => None,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
            Self::W1 => "1w",
            Self::Mo1 => "1M",
        };
        write!(f, "{label}")
    }
}

// =============================================================================
// Quality classifications
// =============================================================================

/// Quality assigned to each tick by the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickQuality {
    Good,
    Delayed,
    OutOfOrder,
    Duplicate,
    Corrupted,
}

impl std::fmt::Display for TickQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Good => write!(f, "Good"),
            Self::Delayed => write!(f, "Delayed"),
            Self::OutOfOrder => write!(f, "OutOfOrder"),
            Self::Duplicate => write!(f, "Duplicate"),
            Self::Corrupted => write!(f, "Corrupted"),
        }
    }
}

/// Quality derived for a completed candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandleQuality {
    Good,
    /// Forced closed without crossing the bucket boundary.
    Incomplete,
    /// Fewer than the configured minimum number of ticks.
    LowVolume,
    /// At least one whole bucket elapsed since the previous completed candle.
    Gap,
    /// Range exceeded the configured fraction of the midprice.
    Suspicious,
}

impl std::fmt::Display for CandleQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Good => write!(f, "Good"),
            Self::Incomplete => write!(f, "Incomplete"),
            Self::LowVolume => write!(f, "LowVolume"),
            Self::Gap => write!(f, "Gap"),
            Self::Suspicious => write!(f, "Suspicious"),
        }
    }
}

// =============================================================================
// Volume semantics
// =============================================================================

/// How the upstream feed reports volume. Brokers differ: some publish a
/// per-tick traded quantity, others only the cumulative day volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeMode {
    /// Per-tick quantities are summed into the bucket.
    PerTickDelta,
    /// The last cumulative day sample observed inside the bucket is the
    /// bucket volume.
    DayCumulative,
}

impl Default for VolumeMode {
    fn default() -> Self {
        Self::DayCumulative
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

/// A `(symbol, exchange)` subscription key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub symbol: String,
    pub exchange: String,
}

impl SubscriptionKey {
    pub fn new(symbol: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            exchange: exchange.into(),
        }
    }

    /// Parse "SYMBOL@EXCHANGE". Returns `None` when either side is empty.
    pub fn parse(s: &str) -> Option<Self> {
        let (symbol, exchange) = s.split_once('@')?;
        if symbol.is_empty() || exchange.is_empty() {
            return None;
        }
        Some(Self::new(symbol.trim().to_uppercase(), exchange.trim().to_uppercase()))
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.exchange)
    }
}

// =============================================================================
// Ticks
// =============================================================================

/// One price/size update for a symbol from the upstream feed.
///
/// `sequence` is assigned by the tick processor (monotonic per symbol);
/// `feed_sequence` preserves the broker's own numbering when supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub exchange: String,
    pub last_price: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask_size: Option<u64>,
    /// Per-tick traded quantity, when the feed supplies it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_delta: Option<u64>,
    /// Cumulative day volume, when the feed supplies it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_volume: Option<u64>,
    /// Cumulative day traded value, when the feed supplies it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_value: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_open: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_high: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_low: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_close: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_sequence: Option<u64>,
    pub sequence: u64,
    pub quality: TickQuality,
}

impl Tick {
    /// The volume figure used for duplicate detection: cumulative day volume
    /// when present, otherwise the per-tick quantity.
    pub fn volume_sample(&self) -> Option<u64> {
        self.day_volume.or(self.volume_delta)
    }

    /// A valid tick has a non-empty symbol, a strictly positive price, and a
    /// timestamp no further in the future than `clock_skew`.
    pub fn is_valid(&self, now: DateTime<Utc>, clock_skew: Duration) -> bool {
        !self.symbol.trim().is_empty()
            && self.last_price > Decimal::ZERO
            && self.timestamp <= now + clock_skew
    }
}
