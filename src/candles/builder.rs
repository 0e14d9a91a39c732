// =============================================================================
// Candle Builder — per-symbol, multi-timeframe aggregation
// =============================================================================
//
// Owned by exactly one worker shard; every accepted tick for a symbol routed
// here updates the forming candle of each configured timeframe. A tick past
// a bucket end completes that bucket and seeds the next one. The staleness
// sweep completes buckets that stopped receiving ticks, and shutdown force-
// completes everything before the final flush.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::candles::{CompletedCandle, CompletionReason, FormingCandle};
use crate::runtime_config::CandleSettings;
use crate::types::{Tick, Timeframe};

pub struct CandleBuilder {
    settings: CandleSettings,
    /// symbol → timeframe → forming candle.
    forming: HashMap<String, HashMap<Timeframe, FormingCandle>>,
    /// Bucket start of the last completed candle per series, for gap
    /// detection.
    last_completed: HashMap<(String, Timeframe), DateTime<Utc>>,
    /// Completed candles awaiting bulk persistence.
    batch: Vec<CompletedCandle>,
    last_flush: Instant,
}

impl CandleBuilder {
    pub fn new(settings: CandleSettings) -> Self {
        Self {
            settings,
            forming: HashMap::new(),
            last_completed: HashMap::new(),
            batch: Vec::new(),
            last_flush: Instant::now(),
        }
    }

    /// Route one accepted tick into every configured timeframe. Returns the
    /// candles completed by this tick (boundary crossings), in timeframe
    /// order.
    pub fn on_tick(&mut self, tick: &Tick) -> Vec<CompletedCandle> {
        let timeframes = self.settings.timeframes.clone();
        let mode = self.settings.volume_mode;
        let mut completed = Vec::new();

        for tf in timeframes {
            let existing = self
                .forming
                .entry(tick.symbol.clone())
                .or_default()
                .remove(&tf);

            let next = match existing {
                None => FormingCandle::open_from(tick, tf, mode),
                Some(mut candle) if tick.timestamp <= candle.bucket_end => {
                    candle.admit(tick, mode);
                    candle
                }
                Some(candle) => {
                    // Boundary crossed: seal the old bucket, open the new
                    // one seeded with the crossing tick.
                    completed.push(self.finish(candle, CompletionReason::BoundaryCross));
                    FormingCandle::open_from(tick, tf, mode)
                }
            };

            self.forming
                .entry(tick.symbol.clone())
                .or_default()
                .insert(tf, next);
        }

        completed
    }

    /// Force-complete every forming candle older than
    /// `stale_multiplier · duration`. Guarantees progress when a symbol
    /// stops ticking near a bucket boundary.
    pub fn sweep_stale(&mut self, now: DateTime<Utc>) -> Vec<CompletedCandle> {
        let multiplier = i64::from(self.settings.stale_multiplier);
        let mut stale: Vec<FormingCandle> = Vec::new();

        for by_tf in self.forming.values_mut() {
            let expired: Vec<Timeframe> = by_tf
                .iter()
                .filter(|(tf, candle)| {
                    (now - candle.bucket_start).num_seconds() > tf.duration_secs() * multiplier
                })
                .map(|(tf, _)| *tf)
                .collect();
            for tf in expired {
                if let Some(candle) = by_tf.remove(&tf) {
                    stale.push(candle);
                }
            }
        }
        self.forming.retain(|_, by_tf| !by_tf.is_empty());

        let completed: Vec<CompletedCandle> = stale
            .into_iter()
            .map(|candle| self.finish(candle, CompletionReason::Stale))
            .collect();
        if !completed.is_empty() {
            debug!(count = completed.len(), "staleness sweep completed candles");
        }
        completed
    }

    /// Shutdown: complete every forming candle regardless of age.
    pub fn force_complete_all(&mut self) -> Vec<CompletedCandle> {
        let mut all: Vec<FormingCandle> = Vec::new();
        for (_, by_tf) in self.forming.drain() {
            all.extend(by_tf.into_values());
        }
        all.into_iter()
            .map(|candle| self.finish(candle, CompletionReason::Shutdown))
            .collect()
    }

    fn finish(&mut self, candle: FormingCandle, reason: CompletionReason) -> CompletedCandle {
        let series = (candle.symbol.clone(), candle.timeframe);
        let prev = self.last_completed.get(&series).copied();
        let done = candle.into_completed(reason, prev, &self.settings);
        self.last_completed.insert(series, done.bucket_start);
        self.batch.push(done.clone());
        done
    }

    // ── Persistence batching ────────────────────────────────────────────

    pub fn should_flush(&self, now: Instant) -> bool {
        if self.batch.is_empty() {
            return false;
        }
        self.batch.len() >= self.settings.flush_batch_size
            || now.duration_since(self.last_flush)
                >= Duration::from_secs(self.settings.flush_interval_secs)
    }

    /// Drain the persistence batch.
    pub fn take_batch(&mut self) -> Vec<CompletedCandle> {
        self.last_flush = Instant::now();
        std::mem::take(&mut self.batch)
    }

    /// Put a failed batch back so the next flush retries it.
    pub fn restore_batch(&mut self, mut batch: Vec<CompletedCandle>) {
        batch.extend(self.batch.drain(..));
        self.batch = batch;
    }

    pub fn forming_count(&self) -> usize {
        self.forming.values().map(HashMap::len).sum()
    }

    pub fn pending_batch_len(&self) -> usize {
        self.batch.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CandleQuality, TickQuality, VolumeMode};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn tick_at(secs: i64, price: Decimal, qty: u64) -> Tick {
        Tick {
            symbol: "RELIANCE".into(),
            exchange: "NSE".into(),
            last_price: price,
            bid_price: None,
            bid_size: None,
            ask_price: None,
            ask_size: None,
            volume_delta: Some(qty),
            day_volume: None,
            day_value: None,
            day_open: None,
            day_high: None,
            day_low: None,
            prev_close: None,
            timestamp: DateTime::from_timestamp(secs, 0).unwrap(),
            source: "test".into(),
            feed_sequence: None,
            sequence: 0,
            quality: TickQuality::Good,
        }
    }

    fn one_minute_settings() -> CandleSettings {
        CandleSettings {
            timeframes: vec![Timeframe::M1],
            volume_mode: VolumeMode::PerTickDelta,
            ..CandleSettings::default()
        }
    }

    #[test]
    fn one_minute_candle_formation() {
        let mut builder = CandleBuilder::new(one_minute_settings());

        // Four ticks inside [0, 60), then a boundary-crossing tick at 61 s.
        assert!(builder.on_tick(&tick_at(0, dec!(100), 10)).is_empty());
        assert!(builder.on_tick(&tick_at(15, dec!(102), 5)).is_empty());
        assert!(builder.on_tick(&tick_at(45, dec!(99), 7)).is_empty());
        assert!(builder.on_tick(&tick_at(59, dec!(101), 3)).is_empty());

        let completed = builder.on_tick(&tick_at(61, dec!(103), 2));
        assert_eq!(completed.len(), 1);
        let candle = &completed[0];
        assert_eq!(candle.open, dec!(100));
        assert_eq!(candle.high, dec!(102));
        assert_eq!(candle.low, dec!(99));
        assert_eq!(candle.close, dec!(101));
        assert_eq!(candle.volume, 25);
        assert_eq!(candle.tick_count, 4);
        assert_eq!(candle.bucket_start.timestamp(), 0);
        assert_eq!(candle.bucket_end.timestamp(), 60);
        // Four ticks is under the low-volume threshold.
        assert_eq!(candle.quality, CandleQuality::LowVolume);

        // The crossing tick seeds the new bucket, so a follow-up tick keeps
        // the new open.
        builder.on_tick(&tick_at(62, dec!(104), 1));
        let forming = builder.forming["RELIANCE"][&Timeframe::M1].clone();
        assert_eq!(forming.open, dec!(103));
        assert_eq!(forming.bucket_start.timestamp(), 60);
    }

    #[test]
    fn ticks_in_same_floor_share_a_bucket() {
        let mut builder = CandleBuilder::new(one_minute_settings());
        builder.on_tick(&tick_at(62, dec!(100), 1));
        builder.on_tick(&tick_at(119, dec!(101), 1));
        assert_eq!(builder.forming_count(), 1);
        let forming = builder.forming["RELIANCE"][&Timeframe::M1].clone();
        assert_eq!(forming.bucket_start.timestamp(), 60);
        assert_eq!(forming.tick_count, 2);

        // Next floor starts a new bucket.
        let completed = builder.on_tick(&tick_at(121, dec!(102), 1));
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].bucket_start.timestamp(), 60);
    }

    #[test]
    fn every_configured_timeframe_is_updated() {
        let settings = CandleSettings {
            volume_mode: VolumeMode::PerTickDelta,
            ..CandleSettings::default()
        };
        let tf_count = settings.timeframes.len();
        let mut builder = CandleBuilder::new(settings);

        builder.on_tick(&tick_at(0, dec!(100), 1));
        assert_eq!(builder.forming_count(), tf_count);

        // 61 s crosses only the 1m boundary.
        let completed = builder.on_tick(&tick_at(61, dec!(101), 1));
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].timeframe, Timeframe::M1);

        // 301 s crosses 1m and 5m.
        let completed = builder.on_tick(&tick_at(301, dec!(102), 1));
        let tfs: Vec<Timeframe> = completed.iter().map(|c| c.timeframe).collect();
        assert!(tfs.contains(&Timeframe::M1));
        assert!(tfs.contains(&Timeframe::M5));
        assert_eq!(completed.len(), 2);
    }

    #[test]
    fn stale_sweep_completes_old_buckets() {
        let mut builder = CandleBuilder::new(one_minute_settings());
        builder.on_tick(&tick_at(0, dec!(100), 10));

        // Not stale yet at 2·D exactly.
        let now = DateTime::from_timestamp(120, 0).unwrap();
        assert!(builder.sweep_stale(now).is_empty());

        let now = DateTime::from_timestamp(121, 0).unwrap();
        let completed = builder.sweep_stale(now);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].close, dec!(100));
        assert_eq!(builder.forming_count(), 0);
    }

    #[test]
    fn shutdown_force_completes_as_incomplete() {
        let mut builder = CandleBuilder::new(one_minute_settings());
        builder.on_tick(&tick_at(0, dec!(100), 10));
        builder.on_tick(&tick_at(5, dec!(101), 10));

        let completed = builder.force_complete_all();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].quality, CandleQuality::Incomplete);
        assert_eq!(builder.forming_count(), 0);
    }

    #[test]
    fn gap_quality_spans_completed_series() {
        let mut builder = CandleBuilder::new(one_minute_settings());

        // Complete [0, 60) normally.
        for i in 0..6 {
            builder.on_tick(&tick_at(i * 10, dec!(100), 1));
        }
        let first = builder.on_tick(&tick_at(61, dec!(100), 1));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].quality, CandleQuality::Good);

        // Silence until 200 s: the tick at 200 completes the [60, 120)
        // bucket (adjacent, no gap) and opens [180, 240).
        let second = builder.on_tick(&tick_at(200, dec!(100), 1));
        assert_eq!(second.len(), 1);
        assert_ne!(second[0].quality, CandleQuality::Gap);

        // Completing [180, 240) skips [120, 180) entirely → Gap.
        for i in 1..6 {
            builder.on_tick(&tick_at(200 + i, dec!(100), 1));
        }
        let third = builder.on_tick(&tick_at(241, dec!(100), 1));
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].bucket_start.timestamp(), 180);
        assert_eq!(third[0].quality, CandleQuality::Gap);
    }

    #[test]
    fn batch_flush_thresholds() {
        let settings = CandleSettings {
            timeframes: vec![Timeframe::M1],
            volume_mode: VolumeMode::PerTickDelta,
            flush_batch_size: 2,
            flush_interval_secs: 3_600,
            ..CandleSettings::default()
        };
        let mut builder = CandleBuilder::new(settings);
        let now = Instant::now();

        assert!(!builder.should_flush(now));
        builder.on_tick(&tick_at(0, dec!(100), 1));
        builder.on_tick(&tick_at(61, dec!(100), 1));
        assert_eq!(builder.pending_batch_len(), 1);
        assert!(!builder.should_flush(now));

        builder.on_tick(&tick_at(121, dec!(100), 1));
        assert_eq!(builder.pending_batch_len(), 2);
        assert!(builder.should_flush(Instant::now()));

        let batch = builder.take_batch();
        assert_eq!(batch.len(), 2);
        assert_eq!(builder.pending_batch_len(), 0);

        // A failed flush restores the batch for retry, preserving order.
        builder.restore_batch(batch);
        assert_eq!(builder.pending_batch_len(), 2);
        assert_eq!(builder.take_batch()[0].bucket_start.timestamp(), 0);
    }
}
