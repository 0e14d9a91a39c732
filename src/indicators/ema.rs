// =============================================================================
// Exponential Moving Average (EMA) — streaming
// =============================================================================
//
// Multiplier α = 2 / (period + 1). Seeded from the first observed input, so
// the EMA is warm after a single sample. This diverges from SMA-seeded
// references: early values differ until the seed decays.
//
//   EMA_t = price_t · α + EMA_{t-1} · (1 − α)

use rust_decimal::Decimal;

use crate::indicators::OUTPUT_SCALE;

#[derive(Debug, Clone)]
pub struct Ema {
    alpha: Decimal,
    value: Option<Decimal>,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        let period = period.max(1) as u64;
        Self {
            alpha: Decimal::TWO / Decimal::from(period + 1),
            value: None,
        }
    }

    /// Push one input and return the updated value. Warm from the first
    /// sample onward.
    pub fn update(&mut self, price: Decimal) -> Option<Decimal> {
        let next = match self.value {
            None => price,
            Some(prev) => price * self.alpha + prev * (Decimal::ONE - self.alpha),
        };
        self.value = Some(next);
        self.value_rounded()
    }

    /// Current value rounded for emission; full precision is kept
    /// internally.
    pub fn value_rounded(&self) -> Option<Decimal> {
        self.value.map(|v| v.round_dp(OUTPUT_SCALE))
    }

    /// Current value at full internal precision.
    pub fn value(&self) -> Option<Decimal> {
        self.value
    }

    pub fn is_warm(&self) -> bool {
        self.value.is_some()
    }

    pub fn reset(&mut self) {
        self.value = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn ema3_known_values() {
        // α = 2/4 = 0.5: 10 → 15 → 22.5
        let mut ema = Ema::new(3);
        assert_eq!(ema.update(dec!(10)), Some(dec!(10)));
        assert_eq!(ema.update(dec!(20)), Some(dec!(15)));
        assert_eq!(ema.update(dec!(30)), Some(dec!(22.5)));
    }

    #[test]
    fn seeded_from_first_sample() {
        let mut ema = Ema::new(20);
        assert!(!ema.is_warm());
        assert_eq!(ema.update(dec!(42)), Some(dec!(42)));
        assert!(ema.is_warm());
    }

    #[test]
    fn converges_to_constant_input() {
        let mut ema = Ema::new(5);
        ema.update(dec!(0));
        for _ in 0..60 {
            ema.update(dec!(100));
        }
        let value = ema.value_rounded().unwrap();
        assert!((value - dec!(100)).abs() < dec!(0.0000001), "got {value}");
    }

    #[test]
    fn reset_clears_seed() {
        let mut ema = Ema::new(3);
        ema.update(dec!(10));
        ema.reset();
        assert!(!ema.is_warm());
        assert_eq!(ema.update(dec!(50)), Some(dec!(50)));
    }
}
