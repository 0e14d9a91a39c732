// =============================================================================
// Query Facade — read-side with write-through TTL caches
// =============================================================================
//
// Serves "latest tick", "latest candle", "latest N candles", and "latest
// indicators" from in-memory caches populated by the workers as events are
// emitted; cache misses (and range queries) fall through to the time-series
// store. Cache entries are replaced on every new emission for their key, so
// readers never see a value older than both the TTL and the latest emission.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::candles::CompletedCandle;
use crate::errors::CoreError;
use crate::indicators::IndicatorSnapshot;
use crate::store::{CandleRepository, IndicatorRepository, TickRepository, WindowAggregate};
use crate::types::{Tick, Timeframe};

/// Recent completed candles retained per series for the latest-N fast path.
const RECENT_CANDLES_PER_SERIES: usize = 100;

struct CacheEntry<T> {
    value: T,
    inserted: Instant,
}

impl<T: Clone> CacheEntry<T> {
    fn new(value: T) -> Self {
        Self { value, inserted: Instant::now() }
    }

    fn fresh(&self, ttl: Duration) -> Option<T> {
        (self.inserted.elapsed() <= ttl).then(|| self.value.clone())
    }
}

// =============================================================================
// QueryCache
// =============================================================================

/// Write-through cache fed by the worker shards.
pub struct QueryCache {
    ttl: Duration,
    ticks: RwLock<HashMap<String, CacheEntry<Tick>>>,
    candles: RwLock<HashMap<(String, Timeframe), CacheEntry<CompletedCandle>>>,
    recent_candles: RwLock<HashMap<(String, Timeframe), VecDeque<CompletedCandle>>>,
    indicators: RwLock<HashMap<(String, Timeframe), CacheEntry<IndicatorSnapshot>>>,
}

impl QueryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            ticks: RwLock::new(HashMap::new()),
            candles: RwLock::new(HashMap::new()),
            recent_candles: RwLock::new(HashMap::new()),
            indicators: RwLock::new(HashMap::new()),
        }
    }

    // ── Write-through (called from the owning worker) ───────────────────

    pub fn put_tick(&self, tick: &Tick) {
        self.ticks
            .write()
            .insert(tick.symbol.clone(), CacheEntry::new(tick.clone()));
    }

    pub fn put_candle(&self, candle: &CompletedCandle) {
        let key = (candle.symbol.clone(), candle.timeframe);
        self.candles
            .write()
            .insert(key.clone(), CacheEntry::new(candle.clone()));

        let mut recent = self.recent_candles.write();
        let ring = recent.entry(key).or_default();
        ring.push_back(candle.clone());
        while ring.len() > RECENT_CANDLES_PER_SERIES {
            ring.pop_front();
        }
    }

    pub fn put_indicators(&self, snapshot: &IndicatorSnapshot) {
        let key = (snapshot.symbol.clone(), snapshot.timeframe);
        self.indicators
            .write()
            .insert(key, CacheEntry::new(snapshot.clone()));
    }

    // ── Reads ───────────────────────────────────────────────────────────

    fn tick(&self, symbol: &str) -> Option<Tick> {
        self.ticks.read().get(symbol)?.fresh(self.ttl)
    }

    fn candle(&self, symbol: &str, timeframe: Timeframe) -> Option<CompletedCandle> {
        self.candles
            .read()
            .get(&(symbol.to_string(), timeframe))?
            .fresh(self.ttl)
    }

    fn recent(&self, symbol: &str, timeframe: Timeframe, n: usize) -> Option<Vec<CompletedCandle>> {
        let map = self.recent_candles.read();
        let ring = map.get(&(symbol.to_string(), timeframe))?;
        if ring.len() < n {
            return None;
        }
        Some(ring.iter().skip(ring.len() - n).cloned().collect())
    }

    fn indicators(&self, symbol: &str, timeframe: Timeframe) -> Option<IndicatorSnapshot> {
        self.indicators
            .read()
            .get(&(symbol.to_string(), timeframe))?
            .fresh(self.ttl)
    }
}

// =============================================================================
// QueryFacade
// =============================================================================

pub struct QueryFacade {
    cache: Arc<QueryCache>,
    ticks: Arc<dyn TickRepository>,
    candles: Arc<dyn CandleRepository>,
    indicators: Arc<dyn IndicatorRepository>,
}

impl QueryFacade {
    pub fn new(
        cache: Arc<QueryCache>,
        ticks: Arc<dyn TickRepository>,
        candles: Arc<dyn CandleRepository>,
        indicators: Arc<dyn IndicatorRepository>,
    ) -> Self {
        Self { cache, ticks, candles, indicators }
    }

    /// Latest tick for a symbol, optionally constrained to one exchange.
    pub async fn latest_tick(
        &self,
        symbol: &str,
        exchange: Option<&str>,
    ) -> Result<Option<Tick>, CoreError> {
        let matches = |tick: &Tick| exchange.map_or(true, |ex| tick.exchange == ex);

        if let Some(tick) = self.cache.tick(symbol) {
            if matches(&tick) {
                return Ok(Some(tick));
            }
        }
        let stored = self.ticks.latest(symbol).await?;
        Ok(stored.filter(|t| matches(t)))
    }

    pub async fn tick_range(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Tick>, CoreError> {
        self.ticks.range(symbol, from, to, limit).await
    }

    pub async fn tick_aggregate(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<WindowAggregate>, CoreError> {
        self.ticks.aggregate(symbol, from, to).await
    }

    pub async fn latest_candle(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<CompletedCandle>, CoreError> {
        if let Some(candle) = self.cache.candle(symbol, timeframe) {
            return Ok(Some(candle));
        }
        self.candles.latest(symbol, timeframe).await
    }

    /// The most recent `n` completed candles, ascending by bucket start.
    pub async fn latest_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        n: usize,
    ) -> Result<Vec<CompletedCandle>, CoreError> {
        if let Some(recent) = self.cache.recent(symbol, timeframe, n) {
            return Ok(recent);
        }
        self.candles.latest_n(symbol, timeframe, n).await
    }

    pub async fn candle_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CompletedCandle>, CoreError> {
        self.candles.range(symbol, timeframe, from, to).await
    }

    pub async fn candle_aggregate(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<WindowAggregate>, CoreError> {
        self.candles.aggregate(symbol, timeframe, from, to).await
    }

    pub async fn latest_indicators(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<IndicatorSnapshot>, CoreError> {
        if let Some(snapshot) = self.cache.indicators(symbol, timeframe) {
            return Ok(Some(snapshot));
        }
        self.indicators.latest(symbol, timeframe).await
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{CandleQuality, TickQuality};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn tick_at(secs: i64, price: Decimal) -> Tick {
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
            sequence: secs as u64,
            quality: TickQuality::Good,
        }
    }

    fn candle_at(start_secs: i64, close: Decimal) -> CompletedCandle {
        let start = DateTime::from_timestamp(start_secs, 0).unwrap();
        CompletedCandle {
            symbol: "RELIANCE".into(),
            exchange: "NSE".into(),
            timeframe: Timeframe::M1,
            bucket_start: start,
            bucket_end: start + Timeframe::M1.duration(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 10,
            value: close * dec!(10),
            vwap: Some(close),
            tick_count: 6,
            trade_count: 6,
            last_update: start,
            quality: CandleQuality::Good,
        }
    }

    fn facade(ttl: Duration) -> (QueryFacade, Arc<QueryCache>, Arc<MemoryStore>) {
        let cache = Arc::new(QueryCache::new(ttl));
        let store = Arc::new(MemoryStore::new());
        let facade = QueryFacade::new(
            cache.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
        );
        (facade, cache, store)
    }

    #[tokio::test]
    async fn latest_tick_prefers_fresh_cache() {
        let (facade, cache, store) = facade(Duration::from_secs(60));

        // The store holds an older tick; the cache holds the newest.
        TickRepository::append(&*store, tick_at(10, dec!(100))).await.unwrap();
        cache.put_tick(&tick_at(20, dec!(101)));

        let tick = facade.latest_tick("RELIANCE", None).await.unwrap().unwrap();
        assert_eq!(tick.last_price, dec!(101));
    }

    #[tokio::test]
    async fn latest_tick_falls_through_on_expiry() {
        let (facade, cache, store) = facade(Duration::from_millis(0));

        TickRepository::append(&*store, tick_at(10, dec!(100))).await.unwrap();
        cache.put_tick(&tick_at(20, dec!(101)));
        tokio::time::sleep(Duration::from_millis(5)).await;

        // TTL of zero: the cache entry is already stale.
        let tick = facade.latest_tick("RELIANCE", None).await.unwrap().unwrap();
        assert_eq!(tick.last_price, dec!(100));
    }

    #[tokio::test]
    async fn latest_tick_respects_exchange_filter() {
        let (facade, cache, _store) = facade(Duration::from_secs(60));
        cache.put_tick(&tick_at(20, dec!(101)));

        let hit = facade.latest_tick("RELIANCE", Some("NSE")).await.unwrap();
        assert!(hit.is_some());
        let miss = facade.latest_tick("RELIANCE", Some("BSE")).await.unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn latest_candles_uses_ring_then_store() {
        let (facade, cache, store) = facade(Duration::from_secs(60));

        cache.put_candle(&candle_at(0, dec!(100)));
        cache.put_candle(&candle_at(60, dec!(101)));

        let two = facade
            .latest_candles("RELIANCE", Timeframe::M1, 2)
            .await
            .unwrap();
        assert_eq!(two.len(), 2);
        assert_eq!(two[1].close, dec!(101));

        // Asking for more than the ring holds falls through to the store.
        CandleRepository::bulk_append(
            &*store,
            vec![candle_at(0, dec!(100)), candle_at(60, dec!(101)), candle_at(120, dec!(102))],
        )
        .await
        .unwrap();
        let three = facade
            .latest_candles("RELIANCE", Timeframe::M1, 3)
            .await
            .unwrap();
        assert_eq!(three.len(), 3);
        assert_eq!(three[2].close, dec!(102));
    }

    #[tokio::test]
    async fn latest_indicators_cache_and_store() {
        let (facade, cache, store) = facade(Duration::from_secs(60));
        assert!(facade
            .latest_indicators("RELIANCE", Timeframe::M1)
            .await
            .unwrap()
            .is_none());

        let snapshot = IndicatorSnapshot {
            symbol: "RELIANCE".into(),
            timeframe: Timeframe::M1,
            timestamp: Utc::now(),
            sma: Some(dec!(100)),
            ema: Some(dec!(100)),
            rsi: None,
            macd_line: None,
            macd_signal: None,
            macd_histogram: None,
        };
        IndicatorRepository::append(&*store, snapshot.clone()).await.unwrap();

        let from_store = facade
            .latest_indicators("RELIANCE", Timeframe::M1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from_store.sma, Some(dec!(100)));

        cache.put_indicators(&snapshot);
        assert!(facade
            .latest_indicators("RELIANCE", Timeframe::M1)
            .await
            .unwrap()
            .is_some());
    }
}
