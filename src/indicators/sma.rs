// =============================================================================
// Simple Moving Average (SMA) — streaming
// =============================================================================
//
// Ring buffer of the last `period` inputs plus a running sum, updated in
// O(1): sum ← sum + new − evicted. Warm once `period` inputs have been
// observed.

use std::collections::VecDeque;

use rust_decimal::Decimal;

use crate::indicators::OUTPUT_SCALE;

#[derive(Debug, Clone)]
pub struct Sma {
    period: usize,
    window: VecDeque<Decimal>,
    sum: Decimal,
}

impl Sma {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            window: VecDeque::with_capacity(period.max(1) + 1),
            sum: Decimal::ZERO,
        }
    }

    /// Push one input and return the updated value (None while warming up).
    pub fn update(&mut self, price: Decimal) -> Option<Decimal> {
        self.window.push_back(price);
        self.sum += price;
        if self.window.len() > self.period {
            if let Some(evicted) = self.window.pop_front() {
                self.sum -= evicted;
            }
        }
        self.value()
    }

    pub fn value(&self) -> Option<Decimal> {
        if self.window.len() < self.period {
            return None;
        }
        self.sum
            .checked_div(Decimal::from(self.period as u64))
            .map(|v| v.round_dp(OUTPUT_SCALE))
    }

    pub fn is_warm(&self) -> bool {
        self.window.len() >= self.period
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.sum = Decimal::ZERO;
    }
}
