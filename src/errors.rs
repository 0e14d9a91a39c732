// =============================================================================
// Core error kinds
// =============================================================================
//
// Typed errors for everything the engine handles programmatically: feed
// errors drive the connection state machine, store/bus errors are retried at
// batch boundaries, validation errors are counted and dropped. Application
// seams (main, config loading) wrap these with anyhow context.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("feed transport error: {0}")]
    FeedTransport(String),

    #[error("feed authentication failed: {0}")]
    FeedAuth(String),

    #[error("feed protocol violation: {0}")]
    FeedProtocol(String),

    #[error("subscription rejected for {key}: {reason}")]
    SubscriptionRejected { key: String, reason: String },

    #[error("tick rejected: {0}")]
    ValidationRejected(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl CoreError {
    /// Stable machine-readable kind, reported through the health endpoint as
    /// `last_error_kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FeedTransport(_) => "FeedTransport",
            Self::FeedAuth(_) => "FeedAuth",
            Self::FeedProtocol(_) => "FeedProtocol",
            Self::SubscriptionRejected { .. } => "SubscriptionRejected",
            Self::ValidationRejected(_) => "ValidationRejected",
            Self::StoreUnavailable(_) => "StoreUnavailable",
            Self::BusUnavailable(_) => "BusUnavailable",
            Self::InvalidConfiguration(_) => "InvalidConfiguration",
            Self::Cancelled => "Cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(CoreError::FeedTransport("x".into()).kind(), "FeedTransport");
        assert_eq!(CoreError::FeedAuth("x".into()).kind(), "FeedAuth");
        assert_eq!(CoreError::Cancelled.kind(), "Cancelled");
        assert_eq!(
            CoreError::SubscriptionRejected {
                key: "A@NSE".into(),
                reason: "limit".into()
            }
            .kind(),
            "SubscriptionRejected"
        );
    }

    #[test]
    fn display_includes_detail() {
        let err = CoreError::StoreUnavailable("connection refused".into());
        assert!(err.to_string().contains("connection refused"));
    }
}
