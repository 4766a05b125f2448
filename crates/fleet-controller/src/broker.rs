//! In-process pub/sub for webhook events.
//!
//! A single worker task owns the subscriber list. [`Broker::publish`] and
//! [`Broker::subscribe`] only enqueue a command for that worker, so the
//! webhook handler never waits on a slow consumer. Each subscriber gets a
//! bounded channel; when it is full the event is dropped for that
//! subscriber and counted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

enum Command<T> {
    Publish(T),
    Subscribe(mpsc::Sender<T>),
}

/// Delivery counters, shared between the worker and every broker handle.
#[derive(Debug, Default)]
pub struct BrokerStats {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    subscribers: AtomicU64,
}

/// Point-in-time copy of [`BrokerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub subscribers: u64,
}

impl BrokerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            subscribers: self.subscribers.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a running broker. Cheap to clone.
pub struct Broker<T> {
    tx: mpsc::UnboundedSender<Command<T>>,
    stats: Arc<BrokerStats>,
    capacity: usize,
}

impl<T> Clone for Broker<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            stats: self.stats.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T: Clone + Send + 'static> Broker<T> {
    /// Spawn the dispatch worker. Each subscriber buffers up to `capacity`
    /// events. The worker exits once every handle is dropped.
    pub fn start(capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(BrokerStats::default());
        let handle = tokio::spawn(dispatch(rx, stats.clone()));
        let broker = Self {
            tx,
            stats,
            capacity: capacity.max(1),
        };
        (broker, handle)
    }

    /// Hand an event to the worker. Never blocks.
    pub fn publish(&self, event: T) {
        if self.tx.send(Command::Publish(event)).is_err() {
            debug!("broker worker gone, event discarded");
        }
    }

    /// Register a new subscriber. Events published after this call are
    /// delivered to the returned receiver.
    pub fn subscribe(&self) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(self.capacity);
        if self.tx.send(Command::Subscribe(tx)).is_err() {
            debug!("broker worker gone, subscriber will never receive");
        }
        rx
    }

    pub fn stats(&self) -> &BrokerStats {
        &self.stats
    }
}

async fn dispatch<T: Clone>(mut rx: mpsc::UnboundedReceiver<Command<T>>, stats: Arc<BrokerStats>) {
    let mut subscribers: Vec<mpsc::Sender<T>> = Vec::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Subscribe(tx) => {
                subscribers.push(tx);
            }
            Command::Publish(event) => {
                stats.published.fetch_add(1, Ordering::Relaxed);
                subscribers.retain(|tx| match tx.try_send(event.clone()) {
                    Ok(()) => {
                        stats.delivered.fetch_add(1, Ordering::Relaxed);
                        true
                    }
                    Err(TrySendError::Full(_)) => {
                        stats.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!("subscriber full, event dropped");
                        true
                    }
                    Err(TrySendError::Closed(_)) => false,
                });
            }
        }
        stats
            .subscribers
            .store(subscribers.len() as u64, Ordering::Relaxed);
    }

    debug!("broker worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Wait until the worker has processed everything queued so far.
    async fn settle<T: Clone + Send + 'static>(broker: &Broker<T>, published: u64) {
        for _ in 0..100 {
            if broker.stats().snapshot().published >= published {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("broker did not settle");
    }

    #[tokio::test]
    async fn every_subscriber_gets_every_event() {
        let (broker, _worker) = Broker::<u32>::start(8);
        let mut a = broker.subscribe();
        let mut b = broker.subscribe();

        broker.publish(1);
        broker.publish(2);

        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));

        let stats = broker.stats().snapshot();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.delivered, 4);
        assert_eq!(stats.dropped, 0);
    }

    #[tokio::test]
    async fn full_subscriber_drops_without_blocking() {
        let (broker, _worker) = Broker::<u32>::start(1);
        let mut slow = broker.subscribe();

        for i in 0..5 {
            broker.publish(i);
        }
        settle(&broker, 5).await;

        let stats = broker.stats().snapshot();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.dropped, 4);
        assert_eq!(slow.recv().await, Some(0));
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let (broker, _worker) = Broker::<u32>::start(4);
        let gone = broker.subscribe();
        let mut kept = broker.subscribe();
        drop(gone);

        broker.publish(7);
        assert_eq!(kept.recv().await, Some(7));
        settle(&broker, 1).await;

        let stats = broker.stats().snapshot();
        assert_eq!(stats.subscribers, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.dropped, 0);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_counted() {
        let (broker, _worker) = Broker::<&'static str>::start(4);
        broker.publish("queued");
        settle(&broker, 1).await;
        assert_eq!(broker.stats().snapshot().delivered, 0);
    }

    #[tokio::test]
    async fn worker_stops_when_handles_dropped() {
        let (broker, worker) = Broker::<u32>::start(4);
        drop(broker);
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
    }
}
