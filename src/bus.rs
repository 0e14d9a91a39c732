// =============================================================================
// Message Bus — partitioned, per-key-FIFO topics
// =============================================================================
//
// In-process topic abstraction connecting the pipeline stages to any number
// of downstream consumers (strategy, risk, recorders). A topic has a fixed
// number of partitions; the publisher hashes the key (symbol) to a partition,
// so all events for one symbol land on one partition and a single consumer of
// that partition observes them in publication order. Partition count must be
// at least the worker count to keep producers independent.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tokio::sync::broadcast;
use tracing::debug;

use crate::candles::CompletedCandle;
use crate::indicators::IndicatorSnapshot;
use crate::runtime_config::BusSettings;
use crate::types::Tick;

/// Buffered events per partition before slow consumers start lagging.
const PARTITION_CAPACITY: usize = 4_096;

/// Stable key → partition mapping shared by the bus and the worker router.
pub fn partition_for(key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}

// =============================================================================
// Topic
// =============================================================================

/// One named topic with hash-partitioned fan-out.
pub struct Topic<T> {
    name: &'static str,
    partitions: Vec<broadcast::Sender<T>>,
}

impl<T: Clone> Topic<T> {
    pub fn new(name: &'static str, partition_count: usize) -> Self {
        let partitions = (0..partition_count.max(1))
            .map(|_| broadcast::channel(PARTITION_CAPACITY).0)
            .collect();
        debug!(topic = name, partitions = partition_count, "topic created");
        Self { name, partitions }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Publish keyed by symbol. Returns the number of consumers that
    /// received the event; zero consumers is not an error — events are also
    /// persisted, and consumers attach independently.
    pub fn publish(&self, key: &str, event: T) -> usize {
        let idx = partition_for(key, self.partitions.len());
        self.partitions[idx].send(event).unwrap_or(0)
    }

    /// Subscribe to one partition. Events published after this call are
    /// observed in per-key FIFO order.
    pub fn subscribe(&self, partition: usize) -> broadcast::Receiver<T> {
        self.partitions[partition % self.partitions.len()].subscribe()
    }

    /// One receiver per partition, for consumers that want the whole topic.
    pub fn subscribe_all(&self) -> Vec<broadcast::Receiver<T>> {
        self.partitions.iter().map(|tx| tx.subscribe()).collect()
    }

    /// The partition a key maps to. Consumers use this to subscribe to the
    /// partition carrying a specific symbol.
    pub fn partition_of(&self, key: &str) -> usize {
        partition_for(key, self.partitions.len())
    }
}

// =============================================================================
// Bus
// =============================================================================

/// The three topics produced by the market-data core.
pub struct Bus {
    pub ticks: Topic<Tick>,
    pub candles: Topic<CompletedCandle>,
    pub indicators: Topic<IndicatorSnapshot>,
}

impl Bus {
    pub fn new(settings: &BusSettings) -> Self {
        Self {
            ticks: Topic::new("ticks", settings.tick_partitions),
            candles: Topic::new("candles", settings.candle_partitions),
            indicators: Topic::new("indicators", settings.indicator_partitions),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_same_partition() {
        for partitions in [1, 4, 8, 16] {
            let a = partition_for("RELIANCE", partitions);
            let b = partition_for("RELIANCE", partitions);
            assert_eq!(a, b);
            assert!(a < partitions);
        }
    }

    #[tokio::test]
    async fn per_key_order_is_preserved() {
        let topic: Topic<u64> = Topic::new("test", 4);
        let mut rx = topic.subscribe(topic.partition_of("TCS"));

        for i in 0..100u64 {
            topic.publish("TCS", i);
        }

        for expected in 0..100u64 {
            assert_eq!(rx.recv().await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn publish_without_consumers_is_not_an_error() {
        let topic: Topic<u64> = Topic::new("test", 2);
        assert_eq!(topic.publish("INFY", 1), 0);
    }

    #[tokio::test]
    async fn consumers_on_other_partitions_see_nothing() {
        let topic: Topic<u64> = Topic::new("test", 8);
        let target = topic.partition_of("SBIN");
        let other = (target + 1) % topic.partition_count();
        let mut target_rx = topic.subscribe(target);
        let mut other_rx = topic.subscribe(other);

        topic.publish("SBIN", 7);

        assert_eq!(target_rx.recv().await.unwrap(), 7);
        assert!(matches!(
            other_rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn subscribe_all_covers_every_partition() {
        let topic: Topic<u64> = Topic::new("test", 3);
        let receivers = topic.subscribe_all();
        assert_eq!(receivers.len(), 3);
        assert_eq!(topic.publish("HDFCBANK", 42), 1);
    }
}
