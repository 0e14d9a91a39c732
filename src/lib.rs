// =============================================================================
// TickForge — real-time market-data core
// =============================================================================
//
// Pipeline: feed client → tick processor → candle builder → indicator
// engine, sharded per symbol across single-writer workers, with an
// in-process partitioned bus between stages and a cached query facade on
// the read side.

pub mod api;
pub mod app_state;
pub mod broker;
pub mod bus;
pub mod candles;
pub mod errors;
pub mod feed;
pub mod indicators;
pub mod pipeline;
pub mod query;
pub mod runtime_config;
pub mod store;
pub mod types;
pub mod workers;
