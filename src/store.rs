// =============================================================================
// Time-Series Store — append-only repository interfaces
// =============================================================================
//
// The production store is an external time-series database; this module
// defines the repository traits the core writes through and a memory-backed
// reference implementation used by tests and local runs. Writers are
// append-only: nothing on the hot path updates a stored row.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::candles::CompletedCandle;
use crate::errors::CoreError;
use crate::indicators::IndicatorSnapshot;
use crate::types::{Tick, Timeframe};

/// min/max/avg/sum/count over a `(symbol, [t0, t1])` window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowAggregate {
    pub min: Decimal,
    pub max: Decimal,
    pub avg: Decimal,
    pub sum: Decimal,
    pub count: u64,
}

fn aggregate_prices(prices: impl Iterator<Item = Decimal>) -> Option<WindowAggregate> {
    let mut min = Decimal::MAX;
    let mut max = Decimal::MIN;
    let mut sum = Decimal::ZERO;
    let mut count = 0u64;

    for price in prices {
        if price < min {
            min = price;
        }
        if price > max {
            max = price;
        }
        sum += price;
        count += 1;
    }

    if count == 0 {
        return None;
    }
    let avg = sum
        .checked_div(Decimal::from(count))
        .unwrap_or(Decimal::ZERO)
        .round_dp(8);
    Some(WindowAggregate { min, max, avg, sum, count })
}

// =============================================================================
// Repository traits
// =============================================================================

#[async_trait]
pub trait TickRepository: Send + Sync {
    async fn append(&self, tick: Tick) -> Result<(), CoreError>;
    async fn bulk_append(&self, ticks: Vec<Tick>) -> Result<(), CoreError>;
    async fn latest(&self, symbol: &str) -> Result<Option<Tick>, CoreError>;
    /// Ticks in `[from, to]`, ascending; `limit` keeps the most recent.
    async fn range(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Tick>, CoreError>;
    /// Returns the number of rows deleted.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError>;
    /// Aggregate over last prices in the window.
    async fn aggregate(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<WindowAggregate>, CoreError>;
}

#[async_trait]
pub trait CandleRepository: Send + Sync {
    async fn bulk_append(&self, candles: Vec<CompletedCandle>) -> Result<(), CoreError>;
    async fn latest(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<CompletedCandle>, CoreError>;
    /// The most recent `n` candles, ascending by bucket start.
    async fn latest_n(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        n: usize,
    ) -> Result<Vec<CompletedCandle>, CoreError>;
    async fn range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CompletedCandle>, CoreError>;
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError>;
    /// Aggregate over closes in the window.
    async fn aggregate(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<WindowAggregate>, CoreError>;
}

#[async_trait]
pub trait IndicatorRepository: Send + Sync {
    async fn append(&self, snapshot: IndicatorSnapshot) -> Result<(), CoreError>;
    async fn latest(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<IndicatorSnapshot>, CoreError>;
}

// =============================================================================
// MemoryStore
// =============================================================================

/// In-memory reference implementation of all three repositories. Rows are
/// keyed by `(timestamp, sequence)` for ticks and bucket start for candles,
/// mirroring the addressing of the production store.
#[derive(Default)]
pub struct MemoryStore {
    ticks: RwLock<HashMap<String, BTreeMap<(i64, u64), Tick>>>,
    candles: RwLock<HashMap<(String, Timeframe), BTreeMap<i64, CompletedCandle>>>,
    indicators: RwLock<HashMap<(String, Timeframe), IndicatorSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TickRepository for MemoryStore {
    async fn append(&self, tick: Tick) -> Result<(), CoreError> {
        let key = (tick.timestamp.timestamp_micros(), tick.sequence);
        self.ticks
            .write()
            .entry(tick.symbol.clone())
            .or_default()
            .insert(key, tick);
        Ok(())
    }

    async fn bulk_append(&self, ticks: Vec<Tick>) -> Result<(), CoreError> {
        let mut map = self.ticks.write();
        for tick in ticks {
            let key = (tick.timestamp.timestamp_micros(), tick.sequence);
            map.entry(tick.symbol.clone()).or_default().insert(key, tick);
        }
        Ok(())
    }

    async fn latest(&self, symbol: &str) -> Result<Option<Tick>, CoreError> {
        Ok(self
            .ticks
            .read()
            .get(symbol)
            .and_then(|rows| rows.values().next_back().cloned()))
    }

    async fn range(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Tick>, CoreError> {
        let map = self.ticks.read();
        let Some(rows) = map.get(symbol) else {
            return Ok(Vec::new());
        };
        let lo = (from.timestamp_micros(), 0);
        let hi = (to.timestamp_micros(), u64::MAX);
        let selected: Vec<Tick> = rows.range(lo..=hi).map(|(_, t)| t.clone()).collect();
        Ok(match limit {
            Some(n) if selected.len() > n => selected[selected.len() - n..].to_vec(),
            _ => selected,
        })
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError> {
        let mut deleted = 0u64;
        let mut map = self.ticks.write();
        let boundary = (cutoff.timestamp_micros(), 0);
        for rows in map.values_mut() {
            let keep = rows.split_off(&boundary);
            deleted += rows.len() as u64;
            *rows = keep;
        }
        map.retain(|_, rows| !rows.is_empty());
        Ok(deleted)
    }

    async fn aggregate(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<WindowAggregate>, CoreError> {
        let map = self.ticks.read();
        let Some(rows) = map.get(symbol) else {
            return Ok(None);
        };
        let lo = (from.timestamp_micros(), 0);
        let hi = (to.timestamp_micros(), u64::MAX);
        Ok(aggregate_prices(
            rows.range(lo..=hi).map(|(_, t)| t.last_price),
        ))
    }
}

#[async_trait]
impl CandleRepository for MemoryStore {
    async fn bulk_append(&self, candles: Vec<CompletedCandle>) -> Result<(), CoreError> {
        let mut map = self.candles.write();
        for candle in candles {
            map.entry((candle.symbol.clone(), candle.timeframe))
                .or_default()
                .insert(candle.bucket_start.timestamp_micros(), candle);
        }
        Ok(())
    }

    async fn latest(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<CompletedCandle>, CoreError> {
        Ok(self
            .candles
            .read()
            .get(&(symbol.to_string(), timeframe))
            .and_then(|rows| rows.values().next_back().cloned()))
    }

    async fn latest_n(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        n: usize,
    ) -> Result<Vec<CompletedCandle>, CoreError> {
        let map = self.candles.read();
        let Some(rows) = map.get(&(symbol.to_string(), timeframe)) else {
            return Ok(Vec::new());
        };
        let mut recent: Vec<CompletedCandle> = rows.values().rev().take(n).cloned().collect();
        recent.reverse();
        Ok(recent)
    }

    async fn range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CompletedCandle>, CoreError> {
        let map = self.candles.read();
        let Some(rows) = map.get(&(symbol.to_string(), timeframe)) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .range(from.timestamp_micros()..=to.timestamp_micros())
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError> {
        let mut deleted = 0u64;
        let mut map = self.candles.write();
        for rows in map.values_mut() {
            let keep = rows.split_off(&cutoff.timestamp_micros());
            deleted += rows.len() as u64;
            *rows = keep;
        }
        map.retain(|_, rows| !rows.is_empty());
        Ok(deleted)
    }

    async fn aggregate(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<WindowAggregate>, CoreError> {
        let map = self.candles.read();
        let Some(rows) = map.get(&(symbol.to_string(), timeframe)) else {
            return Ok(None);
        };
        Ok(aggregate_prices(
            rows.range(from.timestamp_micros()..=to.timestamp_micros())
                .map(|(_, c)| c.close),
        ))
    }
}

#[async_trait]
impl IndicatorRepository for MemoryStore {
    async fn append(&self, snapshot: IndicatorSnapshot) -> Result<(), CoreError> {
        self.indicators
            .write()
            .insert((snapshot.symbol.clone(), snapshot.timeframe), snapshot);
        Ok(())
    }

    async fn latest(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<IndicatorSnapshot>, CoreError> {
        Ok(self
            .indicators
            .read()
            .get(&(symbol.to_string(), timeframe))
            .cloned())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TickQuality;
    use rust_decimal_macros::dec;

    fn tick_at(secs: i64, price: Decimal, seq: u64) -> Tick {
        Tick {
            symbol: "RELIANCE".into(),
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
            timestamp: DateTime::from_timestamp(secs, 0).unwrap(),
            source: "test".into(),
            feed_sequence: None,
            sequence: seq,
            quality: TickQuality::Good,
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn tick_append_and_latest() {
        let store = MemoryStore::new();
        TickRepository::append(&store, tick_at(10, dec!(100), 1)).await.unwrap();
        TickRepository::append(&store, tick_at(20, dec!(101), 2)).await.unwrap();

        let latest = TickRepository::latest(&store, "RELIANCE").await.unwrap().unwrap();
        assert_eq!(latest.last_price, dec!(101));
        assert!(TickRepository::latest(&store, "TCS").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tick_range_with_limit_keeps_most_recent() {
        let store = MemoryStore::new();
        for i in 0..10 {
            TickRepository::append(&store, tick_at(i, dec!(100) + Decimal::from(i), i as u64))
                .await
                .unwrap();
        }

        let all = TickRepository::range(&store, "RELIANCE", ts(0), ts(9), None)
            .await
            .unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(all[0].last_price, dec!(100));

        let limited = TickRepository::range(&store, "RELIANCE", ts(0), ts(9), Some(3))
            .await
            .unwrap();
        assert_eq!(limited.len(), 3);
        assert_eq!(limited[0].last_price, dec!(107));
        assert_eq!(limited[2].last_price, dec!(109));
    }

    #[tokio::test]
    async fn tick_retention_deletes_old_rows() {
        let store = MemoryStore::new();
        for i in 0..10 {
            TickRepository::append(&store, tick_at(i, dec!(100), i as u64))
                .await
                .unwrap();
        }
        let deleted = TickRepository::delete_older_than(&store, ts(5)).await.unwrap();
        assert_eq!(deleted, 5);
        let rest = TickRepository::range(&store, "RELIANCE", ts(0), ts(100), None)
            .await
            .unwrap();
        assert_eq!(rest.len(), 5);
        assert_eq!(rest[0].timestamp.timestamp(), 5);
    }

    #[tokio::test]
    async fn tick_aggregate_window() {
        let store = MemoryStore::new();
        TickRepository::append(&store, tick_at(1, dec!(10), 1)).await.unwrap();
        TickRepository::append(&store, tick_at(2, dec!(20), 2)).await.unwrap();
        TickRepository::append(&store, tick_at(3, dec!(30), 3)).await.unwrap();

        let agg = TickRepository::aggregate(&store, "RELIANCE", ts(1), ts(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(agg.min, dec!(10));
        assert_eq!(agg.max, dec!(20));
        assert_eq!(agg.sum, dec!(30));
        assert_eq!(agg.avg, dec!(15));
        assert_eq!(agg.count, 2);

        assert!(TickRepository::aggregate(&store, "RELIANCE", ts(50), ts(60))
            .await
            .unwrap()
            .is_none());
    }

    fn candle_at(start_secs: i64, close: Decimal) -> CompletedCandle {
        CompletedCandle {
            symbol: "RELIANCE".into(),
            exchange: "NSE".into(),
            timeframe: Timeframe::M1,
            bucket_start: ts(start_secs),
            bucket_end: ts(start_secs + 60),
            open: close,
            high: close,
            low: close,
            close,
            volume: 10,
            value: close * dec!(10),
            vwap: Some(close),
            tick_count: 6,
            trade_count: 6,
            last_update: ts(start_secs + 59),
            quality: crate::types::CandleQuality::Good,
        }
    }

    #[tokio::test]
    async fn candle_bulk_append_and_reads() {
        let store = MemoryStore::new();
        CandleRepository::bulk_append(
            &store,
            vec![candle_at(0, dec!(100)), candle_at(60, dec!(101)), candle_at(120, dec!(102))],
        )
        .await
        .unwrap();

        let latest = CandleRepository::latest(&store, "RELIANCE", Timeframe::M1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.close, dec!(102));

        let last_two = store.latest_n("RELIANCE", Timeframe::M1, 2).await.unwrap();
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].close, dec!(101));
        assert_eq!(last_two[1].close, dec!(102));

        let range = CandleRepository::range(&store, "RELIANCE", Timeframe::M1, ts(0), ts(60))
            .await
            .unwrap();
        assert_eq!(range.len(), 2);

        assert!(CandleRepository::latest(&store, "RELIANCE", Timeframe::M5)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn candle_aggregate_over_closes() {
        let store = MemoryStore::new();
        CandleRepository::bulk_append(&store, vec![candle_at(0, dec!(100)), candle_at(60, dec!(110))])
            .await
            .unwrap();
        let agg = CandleRepository::aggregate(&store, "RELIANCE", Timeframe::M1, ts(0), ts(120))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(agg.min, dec!(100));
        assert_eq!(agg.max, dec!(110));
        assert_eq!(agg.avg, dec!(105));
        assert_eq!(agg.count, 2);
    }
}
