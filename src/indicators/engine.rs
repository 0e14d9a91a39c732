// =============================================================================
// Indicator Engine — per-(symbol, timeframe) streaming state
// =============================================================================
//
// Consumes completed candles and produces one indicator snapshot per candle.
// State is owned by the symbol's worker shard; updates are synchronous and
// never suspend.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::candles::CompletedCandle;
use crate::indicators::{Ema, Macd, Rsi, Sma};
use crate::runtime_config::IndicatorSettings;
use crate::types::Timeframe;

/// One indicator evaluation, published per completed candle. Absent values
/// mean the indicator is not yet warm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sma: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ema: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsi: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd_line: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd_signal: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd_histogram: Option<Decimal>,
}

/// The streaming indicator set for one candle series.
#[derive(Debug, Clone)]
struct SeriesState {
    sma: Sma,
    ema: Ema,
    rsi: Rsi,
    macd: Macd,
}

impl SeriesState {
    fn new(settings: &IndicatorSettings) -> Self {
        Self {
            sma: Sma::new(settings.sma_period),
            ema: Ema::new(settings.ema_period),
            rsi: Rsi::new(settings.rsi_period),
            macd: Macd::new(settings.macd_fast, settings.macd_slow, settings.macd_signal),
        }
    }
}

pub struct IndicatorEngine {
    settings: IndicatorSettings,
    series: HashMap<(String, Timeframe), SeriesState>,
    evaluations: u64,
}

impl IndicatorEngine {
    pub fn new(settings: IndicatorSettings) -> Self {
        Self {
            settings,
            series: HashMap::new(),
            evaluations: 0,
        }
    }

    /// Feed one completed candle and produce the snapshot for its series.
    pub fn on_candle(&mut self, candle: &CompletedCandle) -> IndicatorSnapshot {
        let key = (candle.symbol.clone(), candle.timeframe);
        let state = self
            .series
            .entry(key)
            .or_insert_with(|| SeriesState::new(&self.settings));

        let close = candle.close;
        let sma = state.sma.update(close);
        let ema = state.ema.update(close);
        let rsi = state.rsi.update(close);
        let macd = state.macd.update(close);
        self.evaluations += 1;

        IndicatorSnapshot {
            symbol: candle.symbol.clone(),
            timeframe: candle.timeframe,
            timestamp: candle.bucket_end,
            sma,
            ema,
            rsi,
            macd_line: macd.as_ref().map(|m| m.line),
            macd_signal: macd.as_ref().map(|m| m.signal),
            macd_histogram: macd.as_ref().map(|m| m.histogram),
        }
    }

    /// Zero the streaming state for every timeframe of one symbol.
    /// Used at end-of-day or on operator command.
    pub fn reset_symbol(&mut self, symbol: &str) {
        let before = self.series.len();
        self.series.retain(|(sym, _), _| sym != symbol);
        debug!(symbol, removed = before - self.series.len(), "indicator state reset");
    }

    /// Zero all streaming state.
    pub fn reset_all(&mut self) {
        self.series.clear();
        debug!("all indicator state reset");
    }

    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CandleQuality;
    use rust_decimal_macros::dec;

    fn settings() -> IndicatorSettings {
        IndicatorSettings {
            sma_period: 3,
            ema_period: 3,
            rsi_period: 3,
            macd_fast: 3,
            macd_slow: 6,
            macd_signal: 3,
        }
    }

    fn candle(symbol: &str, timeframe: Timeframe, start_secs: i64, close: Decimal) -> CompletedCandle {
        let start = DateTime::from_timestamp(start_secs, 0).unwrap();
        CompletedCandle {
            symbol: symbol.into(),
            exchange: "NSE".into(),
            timeframe,
            bucket_start: start,
            bucket_end: start + timeframe.duration(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 100,
            value: close * dec!(100),
            vwap: Some(close),
            tick_count: 10,
            trade_count: 10,
            last_update: start,
            quality: CandleQuality::Good,
        }
    }

    #[test]
    fn one_snapshot_per_candle_with_warm_up() {
        let mut engine = IndicatorEngine::new(settings());

        let first = engine.on_candle(&candle("RELIANCE", Timeframe::M1, 0, dec!(10)));
        assert_eq!(first.sma, None);
        assert_eq!(first.ema, Some(dec!(10)));
        assert_eq!(first.rsi, None);
        assert_eq!(first.macd_line, Some(dec!(0)));

        engine.on_candle(&candle("RELIANCE", Timeframe::M1, 60, dec!(20)));
        let third = engine.on_candle(&candle("RELIANCE", Timeframe::M1, 120, dec!(30)));
        assert_eq!(third.sma, Some(dec!(20)));
        assert_eq!(third.ema, Some(dec!(22.5)));
        // Three rising closes: only two differences so far, still warming.
        assert_eq!(third.rsi, None);

        let fourth = engine.on_candle(&candle("RELIANCE", Timeframe::M1, 180, dec!(40)));
        assert_eq!(fourth.rsi, Some(dec!(100)));
        assert_eq!(engine.evaluations(), 4);
    }

    #[test]
    fn series_are_independent() {
        let mut engine = IndicatorEngine::new(settings());

        for i in 0..5 {
            engine.on_candle(&candle("RELIANCE", Timeframe::M1, i * 60, dec!(100)));
        }
        // A different timeframe of the same symbol starts cold.
        let snap = engine.on_candle(&candle("RELIANCE", Timeframe::M5, 0, dec!(100)));
        assert_eq!(snap.sma, None);

        // A different symbol starts cold too.
        let snap = engine.on_candle(&candle("TCS", Timeframe::M1, 0, dec!(100)));
        assert_eq!(snap.sma, None);
        assert_eq!(engine.series_count(), 3);
    }

    #[test]
    fn snapshot_timestamp_is_bucket_end() {
        let mut engine = IndicatorEngine::new(settings());
        let snap = engine.on_candle(&candle("SBIN", Timeframe::M5, 300, dec!(50)));
        assert_eq!(snap.timestamp.timestamp(), 600);
    }

    #[test]
    fn reset_symbol_clears_only_that_symbol() {
        let mut engine = IndicatorEngine::new(settings());
        for i in 0..3 {
            engine.on_candle(&candle("RELIANCE", Timeframe::M1, i * 60, dec!(10)));
            engine.on_candle(&candle("TCS", Timeframe::M1, i * 60, dec!(10)));
        }
        engine.reset_symbol("RELIANCE");
        assert_eq!(engine.series_count(), 1);

        // RELIANCE warms up from scratch.
        let snap = engine.on_candle(&candle("RELIANCE", Timeframe::M1, 300, dec!(10)));
        assert_eq!(snap.sma, None);

        engine.reset_all();
        assert_eq!(engine.series_count(), 0);
    }
}
