// =============================================================================
// Tick Processor — validate, normalise, classify, sequence, batch
// =============================================================================
//
// Produces the clean tick stream the rest of the pipeline consumes. Owned by
// exactly one worker shard per symbol: the per-symbol last-tick cache and
// sequence counters are plain maps with no locking.
//
// Per tick: validate → normalise → classify quality against the previous
// tick → assign a monotonic per-symbol sequence number → append to the
// persistence batch. Rejected ticks are counted by the caller and never
// retried.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::trace;

use crate::errors::CoreError;
use crate::runtime_config::PipelineSettings;
use crate::types::{Tick, TickQuality};

pub struct TickProcessor {
    settings: PipelineSettings,
    /// Per-symbol last accepted tick (never regresses in time).
    last_ticks: HashMap<String, Tick>,
    /// Per-symbol monotonic sequence counters.
    sequences: HashMap<String, u64>,
    /// Ticks awaiting bulk persistence.
    batch: Vec<Tick>,
    last_flush: Instant,
}

impl TickProcessor {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            settings,
            last_ticks: HashMap::new(),
            sequences: HashMap::new(),
            batch: Vec::new(),
            last_flush: Instant::now(),
        }
    }

    /// Run one raw tick through the pipeline. On success the returned tick
    /// is normalised, quality-classified, sequenced, and already appended to
    /// the persistence batch.
    pub fn process(&mut self, mut tick: Tick, now: DateTime<Utc>) -> Result<Tick, CoreError> {
        // ── 1. Normalise ────────────────────────────────────────────────
        tick.symbol = tick.symbol.trim().to_uppercase();
        tick.exchange = tick.exchange.trim().to_uppercase();
        if tick.exchange.is_empty() {
            tick.exchange = self.settings.default_exchange.0.clone();
        }
        tick.last_price = tick.last_price.round_dp(4);

        // ── 2. Validate ─────────────────────────────────────────────────
        let skew = chrono::Duration::seconds(self.settings.clock_skew_secs as i64);
        if !tick.is_valid(now, skew) {
            return Err(CoreError::ValidationRejected(format!(
                "symbol='{}' price={} ts={}",
                tick.symbol, tick.last_price, tick.timestamp
            )));
        }

        // ── 3. Classify quality ─────────────────────────────────────────
        tick.quality = self.classify(&tick, now);

        // ── 4. Assign per-symbol sequence ───────────────────────────────
        let seq = self.sequences.entry(tick.symbol.clone()).or_insert(0);
        *seq += 1;
        tick.sequence = *seq;

        trace!(
            symbol = %tick.symbol,
            price = %tick.last_price,
            seq = tick.sequence,
            quality = %tick.quality,
            "tick processed"
        );

        // ── 5. Cache + batch ────────────────────────────────────────────
        // The last-tick cache never regresses: stragglers are classified
        // against the newest accepted tick, not against each other.
        let replace = self
            .last_ticks
            .get(&tick.symbol)
            .map_or(true, |last| tick.timestamp >= last.timestamp);
        if replace {
            self.last_ticks.insert(tick.symbol.clone(), tick.clone());
        }

        self.batch.push(tick.clone());
        Ok(tick)
    }

    fn classify(&self, tick: &Tick, now: DateTime<Utc>) -> TickQuality {
        let delayed_after = chrono::Duration::seconds(self.settings.delayed_threshold_secs as i64);

        let Some(last) = self.last_ticks.get(&tick.symbol) else {
            // First tick of a symbol can still be stale on arrival.
            if now - tick.timestamp > delayed_after {
                return TickQuality::Delayed;
            }
            return TickQuality::Good;
        };

        if tick.timestamp == last.timestamp
            && tick.last_price == last.last_price
            && tick.volume_sample() == last.volume_sample()
        {
            return TickQuality::Duplicate;
        }

        if tick.timestamp < last.timestamp {
            return TickQuality::OutOfOrder;
        }

        if self.is_price_jump(tick.last_price, last.last_price) {
            return TickQuality::Corrupted;
        }

        if now - tick.timestamp > delayed_after {
            return TickQuality::Delayed;
        }

        TickQuality::Good
    }

    fn is_price_jump(&self, price: Decimal, last_price: Decimal) -> bool {
        let Some(ratio) = (price - last_price).abs().checked_div(last_price.abs()) else {
            return false;
        };
        ratio > Decimal::from(self.settings.corrupted_jump_pct) / Decimal::ONE_HUNDRED
    }

    /// Last accepted tick for a symbol.
    pub fn last_tick(&self, symbol: &str) -> Option<&Tick> {
        self.last_ticks.get(symbol)
    }

    // ── Persistence batching ────────────────────────────────────────────

    pub fn should_flush(&self, now: Instant) -> bool {
        if self.batch.is_empty() {
            return false;
        }
        self.batch.len() >= self.settings.tick_batch_size
            || now.duration_since(self.last_flush)
                >= Duration::from_millis(self.settings.tick_batch_timeout_ms)
    }

    /// Drain the persistence batch.
    pub fn take_batch(&mut self) -> Vec<Tick> {
        self.last_flush = Instant::now();
        std::mem::take(&mut self.batch)
    }

    /// Put a failed batch back so the next flush retries it.
    pub fn restore_batch(&mut self, mut batch: Vec<Tick>) {
        batch.extend(self.batch.drain(..));
        self.batch = batch;
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
    use rust_decimal_macros::dec;

    fn raw_tick(symbol: &str, secs_ago: i64, price: Decimal) -> Tick {
        Tick {
            symbol: symbol.into(),
            exchange: "NSE".into(),
            last_price: price,
            bid_price: None,
            bid_size: None,
            ask_price: None,
            ask_size: None,
            volume_delta: Some(1),
            day_volume: None,
            day_value: None,
            day_open: None,
            day_high: None,
            day_low: None,
            prev_close: None,
            timestamp: Utc::now() - chrono::Duration::seconds(secs_ago),
            source: "test".into(),
            feed_sequence: None,
            sequence: 0,
            quality: TickQuality::Good,
        }
    }

    fn processor() -> TickProcessor {
        TickProcessor::new(PipelineSettings::default())
    }

    #[test]
    fn rejects_invalid_ticks() {
        let mut proc = processor();
        let now = Utc::now();

        let mut blank = raw_tick("  ", 0, dec!(100));
        blank.symbol = "   ".into();
        assert!(proc.process(blank, now).is_err());

        let zero = raw_tick("RELIANCE", 0, dec!(0));
        assert!(proc.process(zero, now).is_err());

        let mut future = raw_tick("RELIANCE", 0, dec!(100));
        future.timestamp = now + chrono::Duration::seconds(60);
        assert!(proc.process(future, now).is_err());
    }

    #[test]
    fn normalises_symbol_exchange_and_scale() {
        let mut proc = processor();
        let mut tick = raw_tick(" reliance ", 0, dec!(100.123456));
        tick.exchange = String::new();

        let out = proc.process(tick, Utc::now()).unwrap();
        assert_eq!(out.symbol, "RELIANCE");
        assert_eq!(out.exchange, "NSE");
        assert_eq!(out.last_price, dec!(100.1235));
    }

    #[test]
    fn sequences_are_monotonic_per_symbol() {
        let mut proc = processor();
        let now = Utc::now();

        let a1 = proc.process(raw_tick("A", 3, dec!(10)), now).unwrap();
        let b1 = proc.process(raw_tick("B", 3, dec!(10)), now).unwrap();
        let a2 = proc.process(raw_tick("A", 2, dec!(10.1)), now).unwrap();
        let a3 = proc.process(raw_tick("A", 1, dec!(10.2)), now).unwrap();

        assert_eq!((a1.sequence, a2.sequence, a3.sequence), (1, 2, 3));
        assert_eq!(b1.sequence, 1);
    }

    #[test]
    fn classifies_good_then_delayed() {
        let mut proc = processor();
        let now = Utc::now();

        let fresh = proc.process(raw_tick("A", 0, dec!(10)), now).unwrap();
        assert_eq!(fresh.quality, TickQuality::Good);

        let late = proc.process(raw_tick("A", 6, dec!(10.01)), now).unwrap();
        // 6 s old but older than the cached tick → out-of-order wins.
        assert_eq!(late.quality, TickQuality::OutOfOrder);

        let mut proc = processor();
        let late = proc.process(raw_tick("B", 6, dec!(10)), now).unwrap();
        assert_eq!(late.quality, TickQuality::Delayed);
    }

    #[test]
    fn classifies_duplicates() {
        let mut proc = processor();
        let now = Utc::now();

        let first = proc.process(raw_tick("A", 1, dec!(10)), now).unwrap();
        let mut same = raw_tick("A", 0, dec!(10));
        same.timestamp = first.timestamp;
        let dup = proc.process(same, now).unwrap();
        assert_eq!(dup.quality, TickQuality::Duplicate);
        // Duplicates still get their own sequence number.
        assert_eq!(dup.sequence, 2);
    }

    #[test]
    fn classifies_out_of_order() {
        let mut proc = processor();
        let now = Utc::now();

        proc.process(raw_tick("A", 1, dec!(10)), now).unwrap();
        let straggler = proc.process(raw_tick("A", 3, dec!(10.05)), now).unwrap();
        assert_eq!(straggler.quality, TickQuality::OutOfOrder);

        // The cache did not regress, so an in-order tick stays clean.
        let next = proc.process(raw_tick("A", 0, dec!(10.1)), now).unwrap();
        assert_eq!(next.quality, TickQuality::Good);
    }

    #[test]
    fn classifies_corrupted_price_jump() {
        let mut proc = processor();
        let now = Utc::now();

        proc.process(raw_tick("A", 2, dec!(100)), now).unwrap();
        let spike = proc.process(raw_tick("A", 1, dec!(111)), now).unwrap();
        assert_eq!(spike.quality, TickQuality::Corrupted);

        let mut proc = processor();
        proc.process(raw_tick("A", 2, dec!(100)), now).unwrap();
        let within = proc.process(raw_tick("A", 1, dec!(109)), now).unwrap();
        assert_eq!(within.quality, TickQuality::Good);
    }

    #[test]
    fn batch_flush_thresholds() {
        let settings = PipelineSettings {
            tick_batch_size: 3,
            tick_batch_timeout_ms: 3_600_000,
            ..PipelineSettings::default()
        };
        let mut proc = TickProcessor::new(settings);
        let now = Utc::now();

        proc.process(raw_tick("A", 2, dec!(10)), now).unwrap();
        proc.process(raw_tick("A", 1, dec!(10.1)), now).unwrap();
        assert!(!proc.should_flush(Instant::now()));

        proc.process(raw_tick("A", 0, dec!(10.2)), now).unwrap();
        assert!(proc.should_flush(Instant::now()));

        let batch = proc.take_batch();
        assert_eq!(batch.len(), 3);
        assert!(!proc.should_flush(Instant::now()));

        // A failed store write puts the batch back, preserving order ahead
        // of newer ticks.
        proc.process(raw_tick("A", 0, dec!(10.3)), now).unwrap();
        proc.restore_batch(batch);
        assert_eq!(proc.pending_batch_len(), 4);
        assert_eq!(proc.take_batch()[0].last_price, dec!(10));
    }

    #[test]
    fn empty_batch_never_flushes() {
        let proc = processor();
        assert!(!proc.should_flush(Instant::now()));
    }
}
