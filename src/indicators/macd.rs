// =============================================================================
// Moving Average Convergence Divergence (MACD) — streaming
// =============================================================================
//
// Two EMAs of the close plus an EMA of their difference:
//
//   MACD line = EMA_fast(close) − EMA_slow(close)
//   Signal    = EMA_signal(MACD line)
//   Histogram = MACD line − Signal
//
// All three EMAs seed from their first input, so the whole indicator is warm
// after a single sample.

use rust_decimal::Decimal;

use crate::indicators::{Ema, OUTPUT_SCALE};

#[derive(Debug, Clone, PartialEq)]
pub struct MacdOutput {
    pub line: Decimal,
    pub signal: Decimal,
    pub histogram: Decimal,
}

#[derive(Debug, Clone)]
pub struct Macd {
    fast: Ema,
    slow: Ema,
    signal: Ema,
}

impl Macd {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Self {
        Self {
            fast: Ema::new(fast),
            slow: Ema::new(slow),
            signal: Ema::new(signal),
        }
    }

    /// Push one close and return the updated line/signal/histogram.
    pub fn update(&mut self, close: Decimal) -> Option<MacdOutput> {
        self.fast.update(close);
        self.slow.update(close);
        let line = self.fast.value()? - self.slow.value()?;

        self.signal.update(line);
        let signal = self.signal.value()?;

        Some(MacdOutput {
            line: line.round_dp(OUTPUT_SCALE),
            signal: signal.round_dp(OUTPUT_SCALE),
            histogram: (line - signal).round_dp(OUTPUT_SCALE),
        })
    }

    pub fn value(&self) -> Option<MacdOutput> {
        let line = self.fast.value()? - self.slow.value()?;
        let signal = self.signal.value()?;
        Some(MacdOutput {
            line: line.round_dp(OUTPUT_SCALE),
            signal: signal.round_dp(OUTPUT_SCALE),
            histogram: (line - signal).round_dp(OUTPUT_SCALE),
        })
    }

    pub fn is_warm(&self) -> bool {
        self.fast.is_warm() && self.slow.is_warm() && self.signal.is_warm()
    }

    pub fn reset(&mut self) {
        self.fast.reset();
        self.slow.reset();
        self.signal.reset();
    }
}
