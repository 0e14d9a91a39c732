// =============================================================================
// Relative Strength Index (RSI) — streaming, Wilder's smoothing
// =============================================================================
//
// The first `period` price differences accumulate into simple averages of
// gains and losses; from then on Wilder's smoothing applies:
//
//   avg ← (avg · (period − 1) + new) / period
//   RS  = avg_gain / avg_loss
//   RSI = 100 − 100 / (1 + RS)
//
// Defined edge cases: avg_loss = 0 with gains ⇒ 100, avg_gain = 0 with
// losses ⇒ 0, both zero ⇒ no value. Division by zero is never raised.

use rust_decimal::Decimal;

use crate::indicators::OUTPUT_SCALE;

#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
    prev_close: Option<Decimal>,
    // Warm-up accumulators for the first `period` differences.
    seed_gain_sum: Decimal,
    seed_loss_sum: Decimal,
    seed_count: usize,
    // Wilder-smoothed averages once seeded.
    averages: Option<(Decimal, Decimal)>,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev_close: None,
            seed_gain_sum: Decimal::ZERO,
            seed_loss_sum: Decimal::ZERO,
            seed_count: 0,
            averages: None,
        }
    }

    /// Push one close and return the updated value (None while warming up).
    pub fn update(&mut self, close: Decimal) -> Option<Decimal> {
        let Some(prev) = self.prev_close.replace(close) else {
            return None;
        };

        let delta = close - prev;
        let gain = if delta > Decimal::ZERO { delta } else { Decimal::ZERO };
        let loss = if delta < Decimal::ZERO { -delta } else { Decimal::ZERO };
        let period = Decimal::from(self.period as u64);

        match self.averages {
            None => {
                self.seed_gain_sum += gain;
                self.seed_loss_sum += loss;
                self.seed_count += 1;
                if self.seed_count == self.period {
                    let avg_gain = self.seed_gain_sum.checked_div(period)?;
                    let avg_loss = self.seed_loss_sum.checked_div(period)?;
                    self.averages = Some((avg_gain, avg_loss));
                }
            }
            Some((avg_gain, avg_loss)) => {
                let n_minus_one = period - Decimal::ONE;
                let avg_gain = (avg_gain * n_minus_one + gain).checked_div(period)?;
                let avg_loss = (avg_loss * n_minus_one + loss).checked_div(period)?;
                self.averages = Some((avg_gain, avg_loss));
            }
        }

        self.value()
    }

    pub fn value(&self) -> Option<Decimal> {
        let (avg_gain, avg_loss) = self.averages?;

        let rsi = if avg_loss.is_zero() && avg_gain.is_zero() {
            return None;
        } else if avg_loss.is_zero() {
            Decimal::ONE_HUNDRED
        } else if avg_gain.is_zero() {
            Decimal::ZERO
        } else {
            let rs = avg_gain.checked_div(avg_loss)?;
            Decimal::ONE_HUNDRED
                - Decimal::ONE_HUNDRED.checked_div(Decimal::ONE + rs)?
        };

        Some(rsi.round_dp(OUTPUT_SCALE))
    }

    pub fn is_warm(&self) -> bool {
        self.averages.is_some()
    }

    pub fn reset(&mut self) {
        self.prev_close = None;
        self.seed_gain_sum = Decimal::ZERO;
        self.seed_loss_sum = Decimal::ZERO;
        self.seed_count = 0;
        self.averages = None;
    }
}
