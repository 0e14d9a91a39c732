// =============================================================================
// Central Application State — TickForge engine
// =============================================================================
//
// Ties the subsystems together and carries the health counters surfaced by
// the API. Counters are lock-free atomics bumped from the worker hot path;
// everything else is cold state behind short-lived locks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;

use crate::errors::CoreError;
use crate::feed::FeedClient;
use crate::runtime_config::RuntimeConfig;

/// Central state shared across all tasks via `Arc<AppState>`.
pub struct AppState {
    pub config: RuntimeConfig,
    pub feed: Arc<FeedClient>,

    // ── Health counters ─────────────────────────────────────────────────
    pub ticks_processed: AtomicU64,
    pub ticks_rejected: AtomicU64,
    pub candles_built: AtomicU64,
    pub candles_stored: AtomicU64,
    pub ticks_stored: AtomicU64,
    pub indicator_evaluations: AtomicU64,

    /// Kind of the most recent infrastructure error, for the health surface.
    last_error_kind: RwLock<Option<&'static str>>,

    /// Engine start instant, for uptime reporting.
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: RuntimeConfig) -> Self {
        let feed = Arc::new(FeedClient::new(config.feed.clone()));
        Self {
            config,
            feed,
            ticks_processed: AtomicU64::new(0),
            ticks_rejected: AtomicU64::new(0),
            candles_built: AtomicU64::new(0),
            candles_stored: AtomicU64::new(0),
            ticks_stored: AtomicU64::new(0),
            indicator_evaluations: AtomicU64::new(0),
            last_error_kind: RwLock::new(None),
            started_at: Instant::now(),
        }
    }

    /// Remember the kind of an infrastructure error for the health surface.
    pub fn record_error(&self, error: &CoreError) {
        *self.last_error_kind.write() = Some(error.kind());
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            connected: self.feed.is_connected(),
            connection_state: self.feed.state().to_string(),
            subscribed_count: self.feed.subscription_count(),
            ticks_processed: self.ticks_processed.load(Ordering::Relaxed),
            ticks_rejected: self.ticks_rejected.load(Ordering::Relaxed),
            candles_built: self.candles_built.load(Ordering::Relaxed),
            candles_stored: self.candles_stored.load(Ordering::Relaxed),
            ticks_stored: self.ticks_stored.load(Ordering::Relaxed),
            indicator_evaluations: self.indicator_evaluations.load(Ordering::Relaxed),
            feed_parse_failures: self.feed.parse_failures(),
            last_error_kind: (*self.last_error_kind.read()).map(str::to_string),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

/// Payload of `GET /api/v1/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub connected: bool,
    pub connection_state: String,
    pub subscribed_count: usize,
    pub ticks_processed: u64,
    pub ticks_rejected: u64,
    pub candles_built: u64,
    pub candles_stored: u64,
    pub ticks_stored: u64,
    pub indicator_evaluations: u64,
    pub feed_parse_failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_kind: Option<String>,
    pub uptime_secs: u64,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_flow_into_health_snapshot() {
        let state = AppState::new(RuntimeConfig::default());
        state.ticks_processed.fetch_add(7, Ordering::Relaxed);
        state.ticks_rejected.fetch_add(2, Ordering::Relaxed);
        state.candles_built.fetch_add(1, Ordering::Relaxed);

        let health = state.health_snapshot();
        assert!(!health.connected);
        assert_eq!(health.connection_state, "Disconnected");
        assert_eq!(health.ticks_processed, 7);
        assert_eq!(health.ticks_rejected, 2);
        assert_eq!(health.candles_built, 1);
        assert_eq!(health.last_error_kind, None);
    }

    #[test]
    fn last_error_kind_is_reported() {
        let state = AppState::new(RuntimeConfig::default());
        state.record_error(&CoreError::StoreUnavailable("down".into()));
        assert_eq!(
            state.health_snapshot().last_error_kind.as_deref(),
            Some("StoreUnavailable")
        );
    }
}
