// =============================================================================
// TickForge — Main Entry Point
// =============================================================================
//
// Market-data core: feed client → tick processor → candle builder →
// indicator engine, sharded per symbol across workers, with a query facade
// and REST surface on the read side. Components are composed leaves-first
// and communicate through channels and bus topics only.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use tickforge::api::{self, ApiContext};
use tickforge::app_state::AppState;
use tickforge::bus::Bus;
use tickforge::query::{QueryCache, QueryFacade};
use tickforge::runtime_config::RuntimeConfig;
use tickforge::store::{MemoryStore, TickRepository};
use tickforge::workers::WorkerPool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        TickForge Market Data Core — Starting Up          ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("TICKFORGE_CONFIG").unwrap_or_else(|_| "tickforge.json".into());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();
    // Configuration errors fail fast, before anything is spawned.
    config.validate().context("configuration rejected")?;

    info!(
        feed_url = %config.feed.url,
        workers = config.worker_count,
        timeframes = ?config.candles.timeframes,
        subscriptions = config.subscriptions.len(),
        "configuration loaded"
    );

    // ── 2. Shared state & infrastructure ─────────────────────────────────
    let state = Arc::new(AppState::new(config));
    let bus = Arc::new(Bus::new(&state.config.bus));
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(QueryCache::new(Duration::from_secs(
        state.config.cache_ttl_secs,
    )));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── 3. Worker shards ─────────────────────────────────────────────────
    let pool = WorkerPool::spawn(
        state.clone(),
        bus.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        cache.clone(),
        shutdown_rx.clone(),
    );

    // ── 4. Feed client ───────────────────────────────────────────────────
    for key in &state.config.subscriptions {
        state.feed.subscribe(key.clone());
    }
    let mut ticks = state
        .feed
        .ticks()
        .context("feed tick stream already taken")?;

    let feed = state.feed.clone();
    tokio::spawn(async move {
        if let Err(e) = feed.connect().await {
            error!(error = %e, "feed connection failed terminally");
        }
    });

    // ── 5. Tick router: feed stream → worker shards ──────────────────────
    let router_handle = tokio::spawn(async move {
        while let Some(tick) = ticks.recv().await {
            pool.dispatch(tick).await;
        }
        info!("feed tick stream closed — draining workers");
        pool.join().await;
    });

    // ── 6. Tick retention ────────────────────────────────────────────────
    let retention_state = state.clone();
    let retention_store = store.clone();
    let mut retention_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let max_age = chrono::Duration::hours(
                        retention_state.config.pipeline.tick_max_age_hours as i64,
                    );
                    let cutoff = chrono::Utc::now() - max_age;
                    match TickRepository::delete_older_than(&*retention_store, cutoff).await {
                        Ok(0) => {}
                        Ok(deleted) => debug!(deleted, "tick retention pass"),
                        Err(e) => {
                            retention_state.record_error(&e);
                            warn!(error = %e, "tick retention failed");
                        }
                    }
                }
                _ = retention_shutdown.changed() => break,
            }
        }
    });

    // ── 7. REST API server ───────────────────────────────────────────────
    let facade = Arc::new(QueryFacade::new(
        cache.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
    ));
    let ctx = Arc::new(ApiContext {
        state: state.clone(),
        facade,
    });
    let bind_addr = state.config.bind_addr.clone();
    tokio::spawn(async move {
        let app = api::router(ctx);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    state.feed.shutdown();
    let _ = shutdown_tx.send(true);

    // The tick stream closes once the feed supervisor stops; the router
    // then drains the workers (force-completing candles, flushing batches).
    if let Err(e) = router_handle.await {
        error!(error = %e, "worker drain failed");
    }

    info!("TickForge shut down complete");
    Ok(())
}
