// =============================================================================
// Worker Shards — single-writer per-symbol pipeline execution
// =============================================================================
//
// Each symbol is bound to exactly one worker by hashed symbol mod worker
// count. The worker task exclusively owns the per-symbol tick cache, forming
// candles, and indicator state for its symbols, so the hot path mutates
// without locks. Cross-worker visibility happens only through the bus.
//
// A worker services its tick queue plus three timers (tick-batch flush,
// candle-batch flush, staleness sweep) and drains cooperatively on shutdown:
// in-flight ticks are processed, forming candles force-completed, and both
// persistence batches flushed before the task exits.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::app_state::AppState;
use crate::bus::{partition_for, Bus};
use crate::candles::{CandleBuilder, CompletedCandle};
use crate::indicators::IndicatorEngine;
use crate::pipeline::TickProcessor;
use crate::query::QueryCache;
use crate::store::{CandleRepository, IndicatorRepository, TickRepository};
use crate::types::Tick;

/// Per-worker queue depth; dispatch backpressures the feed router beyond it.
const WORKER_QUEUE_CAPACITY: usize = 4_096;

// =============================================================================
// WorkerPool
// =============================================================================

pub struct WorkerPool {
    senders: Vec<mpsc::Sender<Tick>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.worker_count` workers, each owning its shard of the
    /// symbol space.
    pub fn spawn(
        state: Arc<AppState>,
        bus: Arc<Bus>,
        tick_store: Arc<dyn TickRepository>,
        candle_store: Arc<dyn CandleRepository>,
        indicator_store: Arc<dyn IndicatorRepository>,
        cache: Arc<QueryCache>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let count = state.config.worker_count;
        let mut senders = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);

        for id in 0..count {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE_CAPACITY);
            let worker = Worker {
                id,
                state: state.clone(),
                bus: bus.clone(),
                tick_store: tick_store.clone(),
                candle_store: candle_store.clone(),
                indicator_store: indicator_store.clone(),
                cache: cache.clone(),
                processor: TickProcessor::new(state.config.pipeline.clone()),
                builder: CandleBuilder::new(state.config.candles.clone()),
                indicators: IndicatorEngine::new(state.config.indicators.clone()),
            };
            handles.push(tokio::spawn(worker.run(rx, shutdown.clone())));
            senders.push(tx);
        }

        info!(workers = count, "worker pool started");
        Self { senders, handles }
    }

    /// Route a raw tick to its owning worker. Per-symbol FIFO: the same
    /// symbol always lands on the same queue.
    pub async fn dispatch(&self, tick: Tick) {
        let idx = partition_for(&tick.symbol, self.senders.len());
        if self.senders[idx].send(tick).await.is_err() {
            warn!(worker = idx, "worker queue closed — tick dropped");
        }
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    /// Close the queues and wait for every worker to drain and exit.
    pub async fn join(mut self) {
        self.senders.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        info!("worker pool stopped");
    }
}

// =============================================================================
// Worker
// =============================================================================

struct Worker {
    id: usize,
    state: Arc<AppState>,
    bus: Arc<Bus>,
    tick_store: Arc<dyn TickRepository>,
    candle_store: Arc<dyn CandleRepository>,
    indicator_store: Arc<dyn IndicatorRepository>,
    cache: Arc<QueryCache>,
    processor: TickProcessor,
    builder: CandleBuilder,
    indicators: IndicatorEngine,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<Tick>, mut shutdown: watch::Receiver<bool>) {
        // interval_at: the first firing comes one full period in, not
        // immediately at task start.
        let tick_flush_period =
            Duration::from_millis(self.state.config.pipeline.tick_batch_timeout_ms);
        let candle_flush_period = Duration::from_secs(self.state.config.candles.flush_interval_secs);
        let sweep_period = Duration::from_secs(self.state.config.candles.sweep_interval_secs);
        let now = tokio::time::Instant::now();
        let mut tick_flush = interval_at(now + tick_flush_period, tick_flush_period);
        let mut candle_flush = interval_at(now + candle_flush_period, candle_flush_period);
        let mut sweep = interval_at(now + sweep_period, sweep_period);
        tick_flush.set_missed_tick_behavior(MissedTickBehavior::Skip);
        candle_flush.set_missed_tick_behavior(MissedTickBehavior::Skip);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!(worker = self.id, "worker started");

        loop {
            tokio::select! {
                maybe_tick = rx.recv() => match maybe_tick {
                    Some(tick) => self.handle_tick(tick).await,
                    None => break,
                },

                _ = tick_flush.tick() => {
                    if self.processor.should_flush(Instant::now()) {
                        self.flush_ticks().await;
                    }
                }

                _ = candle_flush.tick() => {
                    if self.builder.should_flush(Instant::now()) {
                        self.flush_candles().await;
                    }
                }

                _ = sweep.tick() => {
                    for candle in self.builder.sweep_stale(Utc::now()) {
                        self.emit_candle(candle).await;
                    }
                }

                _ = shutdown.changed() => break,
            }
        }

        // ── Drain ───────────────────────────────────────────────────────
        while let Ok(tick) = rx.try_recv() {
            self.handle_tick(tick).await;
        }
        for candle in self.builder.force_complete_all() {
            self.emit_candle(candle).await;
        }
        self.flush_ticks().await;
        self.flush_candles().await;
        info!(worker = self.id, "worker drained and stopped");
    }

    async fn handle_tick(&mut self, raw: Tick) {
        match self.processor.process(raw, Utc::now()) {
            Err(err) => {
                self.state.ticks_rejected.fetch_add(1, Ordering::Relaxed);
                trace!(worker = self.id, error = %err, "tick rejected");
            }
            Ok(tick) => {
                self.state.ticks_processed.fetch_add(1, Ordering::Relaxed);
                self.cache.put_tick(&tick);
                self.bus.ticks.publish(&tick.symbol, tick.clone());

                for candle in self.builder.on_tick(&tick) {
                    self.emit_candle(candle).await;
                }
            }
        }

        if self.processor.should_flush(Instant::now()) {
            self.flush_ticks().await;
        }
        if self.builder.should_flush(Instant::now()) {
            self.flush_candles().await;
        }
    }

    /// Publish a completed candle and cascade it through the indicator
    /// engine, emitting one snapshot per candle.
    async fn emit_candle(&mut self, candle: CompletedCandle) {
        self.state.candles_built.fetch_add(1, Ordering::Relaxed);
        self.cache.put_candle(&candle);
        self.bus.candles.publish(&candle.symbol, candle.clone());

        let snapshot = self.indicators.on_candle(&candle);
        self.state
            .indicator_evaluations
            .fetch_add(1, Ordering::Relaxed);
        self.cache.put_indicators(&snapshot);
        if let Err(err) = self.indicator_store.append(snapshot.clone()).await {
            self.state.record_error(&err);
            warn!(worker = self.id, error = %err, "indicator snapshot not stored");
        }
        let symbol = snapshot.symbol.clone();
        self.bus.indicators.publish(&symbol, snapshot);
    }

    /// Flush the tick batch; on store failure the batch is retained for the
    /// next flush.
    async fn flush_ticks(&mut self) {
        let batch = self.processor.take_batch();
        if batch.is_empty() {
            return;
        }
        let count = batch.len() as u64;
        match self.tick_store.bulk_append(batch.clone()).await {
            Ok(()) => {
                self.state.ticks_stored.fetch_add(count, Ordering::Relaxed);
                trace!(worker = self.id, count, "tick batch stored");
            }
            Err(err) => {
                self.state.record_error(&err);
                warn!(worker = self.id, error = %err, count, "tick batch flush failed — retrying next flush");
                self.processor.restore_batch(batch);
            }
        }
    }

    /// Flush the completed-candle batch; on store failure the batch is
    /// retained for the next flush.
    async fn flush_candles(&mut self) {
        let batch = self.builder.take_batch();
        if batch.is_empty() {
            return;
        }
        let count = batch.len() as u64;
        match self.candle_store.bulk_append(batch.clone()).await {
            Ok(()) => {
                self.state.candles_stored.fetch_add(count, Ordering::Relaxed);
                trace!(worker = self.id, count, "candle batch stored");
            }
            Err(err) => {
                self.state.record_error(&err);
                warn!(worker = self.id, error = %err, count, "candle batch flush failed — retrying next flush");
                self.builder.restore_batch(batch);
            }
        }
    }
}
