pub mod tick_processor;

pub use tick_processor::TickProcessor;
