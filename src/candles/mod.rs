// =============================================================================
// Candles — forming and completed OHLCV buckets
// =============================================================================
//
// Bucket boundaries align to wall-clock time: for a timeframe of D seconds a
// tick at epoch second t belongs to the bucket starting at ⌊t/D⌋·D. Buckets
// are deterministic and independent of the first tick's offset.

pub mod builder;

pub use builder::CandleBuilder;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::runtime_config::CandleSettings;
use crate::types::{CandleQuality, Tick, TickQuality, Timeframe, VolumeMode};

/// The wall-clock-aligned bucket start for a timestamp.
pub fn bucket_start(ts: DateTime<Utc>, timeframe: Timeframe) -> DateTime<Utc> {
    let d = timeframe.duration_secs();
    let aligned = ts.timestamp().div_euclid(d) * d;
    DateTime::from_timestamp(aligned, 0).expect("aligned timestamp in range")
}

/// Why a forming candle was completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// A tick arrived past the bucket end.
    BoundaryCross,
    /// The staleness sweep closed a bucket that stopped receiving ticks.
    Stale,
    /// Engine shutdown force-completed every forming candle.
    Shutdown,
}

// =============================================================================
// FormingCandle
// =============================================================================

/// A mutable candle whose bucket end has not been crossed yet. Owned
/// exclusively by the candle builder on the symbol's worker.
#[derive(Debug, Clone)]
pub struct FormingCandle {
    pub symbol: String,
    pub exchange: String,
    pub timeframe: Timeframe,
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
    pub value: Decimal,
    pub tick_count: u64,
    pub trade_count: u64,
    pub last_update: DateTime<Utc>,
}

impl FormingCandle {
    /// Open a bucket from its first admitted tick. O is fixed here and never
    /// overwritten.
    pub fn open_from(tick: &Tick, timeframe: Timeframe, mode: VolumeMode) -> Self {
        let start = bucket_start(tick.timestamp, timeframe);
        let end = start + timeframe.duration();
        let price = tick.last_price;

        let mut candle = Self {
            symbol: tick.symbol.clone(),
            exchange: tick.exchange.clone(),
            timeframe,
            bucket_start: start,
            bucket_end: end,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0,
            value: Decimal::ZERO,
            tick_count: 0,
            trade_count: 0,
            last_update: tick.timestamp,
        };
        candle.accumulate(tick, mode);
        candle.tick_count = 1;
        candle
    }

    /// Admit a tick into this bucket. Returns false (no update) when the
    /// tick belongs to a different series or lies past the bucket end.
    pub fn admit(&mut self, tick: &Tick, mode: VolumeMode) -> bool {
        if tick.symbol != self.symbol
            || tick.exchange != self.exchange
            || tick.timestamp > self.bucket_end
        {
            return false;
        }

        let price = tick.last_price;
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.accumulate(tick, mode);
        self.tick_count += 1;
        self.last_update = tick.timestamp;
        true
    }

    /// Volume/value accumulation per the configured source semantics.
    fn accumulate(&mut self, tick: &Tick, mode: VolumeMode) {
        match mode {
            VolumeMode::PerTickDelta => {
                // Duplicate-classified ticks must not double-count volume.
                if tick.quality == TickQuality::Duplicate {
                    return;
                }
                let qty = tick.volume_delta.unwrap_or(0);
                if qty > 0 {
                    self.volume += qty;
                    self.value += tick.last_price * Decimal::from(qty);
                    self.trade_count += 1;
                }
            }
            VolumeMode::DayCumulative => {
                // The bucket volume is the last cumulative day sample seen
                // inside the bucket; re-delivery of the same sample is
                // naturally idempotent.
                if let Some(cumulative) = tick.day_volume {
                    if cumulative > self.volume {
                        self.trade_count += 1;
                    }
                    self.volume = cumulative;
                }
                if let Some(value) = tick.day_value {
                    self.value = value;
                }
            }
        }
    }

    /// Volume-weighted average price over the accumulated volume. None when
    /// no volume was traded.
    pub fn vwap(&self) -> Option<Decimal> {
        if self.volume == 0 {
            return None;
        }
        self.value
            .checked_div(Decimal::from(self.volume))
            .map(|v| v.round_dp(8))
    }

    /// Seal the bucket into an immutable completed candle.
    pub fn into_completed(
        self,
        reason: CompletionReason,
        prev_bucket_start: Option<DateTime<Utc>>,
        settings: &CandleSettings,
    ) -> CompletedCandle {
        let vwap = self.vwap();
        let quality = self.derive_quality(reason, prev_bucket_start, settings);
        CompletedCandle {
            symbol: self.symbol,
            exchange: self.exchange,
            timeframe: self.timeframe,
            bucket_start: self.bucket_start,
            bucket_end: self.bucket_end,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            value: self.value,
            vwap,
            tick_count: self.tick_count,
            trade_count: self.trade_count,
            last_update: self.last_update,
            quality,
        }
    }

    fn derive_quality(
        &self,
        reason: CompletionReason,
        prev_bucket_start: Option<DateTime<Utc>>,
        settings: &CandleSettings,
    ) -> CandleQuality {
        match reason {
            // Closed without crossing the boundary.
            CompletionReason::Shutdown => return CandleQuality::Incomplete,
            CompletionReason::Stale if self.tick_count == 0 => return CandleQuality::Incomplete,
            _ => {}
        }

        if let Some(prev) = prev_bucket_start {
            let elapsed = (self.bucket_start - prev).num_seconds();
            if elapsed > self.timeframe.duration_secs() {
                return CandleQuality::Gap;
            }
        }

        if self.tick_count < settings.low_volume_tick_count {
            return CandleQuality::LowVolume;
        }

        let mid = (self.high + self.low) / Decimal::TWO;
        if let Some(ratio) = (self.high - self.low).checked_div(mid) {
            let threshold = Decimal::from(settings.suspicious_range_pct) / Decimal::ONE_HUNDRED;
            if ratio > threshold {
                return CandleQuality::Suspicious;
            }
        }

        CandleQuality::Good
    }
}

// =============================================================================
// CompletedCandle
// =============================================================================

/// An immutable, completed OHLCV bucket, handed off by value to the bus and
/// to persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedCandle {
    pub symbol: String,
    pub exchange: String,
    pub timeframe: Timeframe,
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
    pub value: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vwap: Option<Decimal>,
    pub tick_count: u64,
    pub trade_count: u64,
    pub last_update: DateTime<Utc>,
    pub quality: CandleQuality,
}
