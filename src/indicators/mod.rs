// =============================================================================
// Streaming Technical Indicators
// =============================================================================
//
// Incremental, O(1)-per-update implementations of the indicators maintained
// per (symbol, timeframe). Every indicator exposes its value as `Option` so
// callers are forced to handle the warm-up period and numerical edge cases.
// All arithmetic is fixed-point decimal; outputs are rounded half-to-even
// before emission.

pub mod ema;
pub mod engine;
pub mod macd;
pub mod rsi;
pub mod sma;

pub use ema::Ema;
pub use engine::{IndicatorEngine, IndicatorSnapshot};
pub use macd::{Macd, MacdOutput};
pub use rsi::Rsi;
pub use sma::Sma;

/// Internal precision of emitted indicator values (decimal places).
pub const OUTPUT_SCALE: u32 = 8;
