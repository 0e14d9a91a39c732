pub mod client;
pub mod protocol;

pub use client::{ConnectionState, FeedClient};
pub use protocol::{FeedTick, Inbound};
