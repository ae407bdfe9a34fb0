use chrono::Utc;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::models::{OwnerId, Snapshot};

use super::aggregator::StatusAggregator;
use super::registry::TargetRegistry;

/// Read-only views of an owner's state plus periodic push updates.
///
/// One ticker drives every subscription through a broadcast channel. Each
/// subscriber builds its own snapshot when a tick arrives, so a slow reader
/// only ever lags itself and simply skips the ticks it missed.
#[derive(Clone)]
pub struct SubscriptionHub {
    registry: TargetRegistry,
    aggregator: StatusAggregator,
    ticks: Arc<RwLock<Option<broadcast::Sender<()>>>>,
    cadence: Duration,
}

struct Subscription {
    hub: SubscriptionHub,
    owner_id: OwnerId,
    ticks: Option<broadcast::Receiver<()>>,
    first: bool,
}

impl SubscriptionHub {
    pub fn new(
        registry: TargetRegistry,
        aggregator: StatusAggregator,
        cadence: Duration,
        capacity: usize,
    ) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            registry,
            aggregator,
            ticks: Arc::new(RwLock::new(Some(tx))),
            cadence,
        }
    }

    /// Current targets and status of one owner
    pub async fn snapshot(&self, owner_id: &str) -> Snapshot {
        let targets = self.registry.list(owner_id).await;
        let mut status = self.aggregator.records_for(owner_id).await;
        status.retain(|url, _| targets.iter().any(|t| &t.url == url));

        Snapshot {
            owner_id: owner_id.to_string(),
            generated_at: Utc::now(),
            targets,
            status,
        }
    }

    /// Stream of snapshots: one immediately, then one per ticker cadence.
    ///
    /// Ends when the hub shuts down. After shutdown only the initial
    /// snapshot is produced.
    pub async fn subscribe(&self, owner_id: &str) -> BoxStream<'static, Snapshot> {
        let ticks = self.ticks.read().await.as_ref().map(broadcast::Sender::subscribe);
        debug!("New subscription for {}", owner_id);

        let subscription = Subscription {
            hub: self.clone(),
            owner_id: owner_id.to_string(),
            ticks,
            first: true,
        };

        stream::unfold(subscription, |mut sub| async move {
            if sub.first {
                sub.first = false;
                let snapshot = sub.hub.snapshot(&sub.owner_id).await;
                return Some((snapshot, sub));
            }

            let receiver = sub.ticks.as_mut()?;
            loop {
                match receiver.recv().await {
                    Ok(()) => {
                        let snapshot = sub.hub.snapshot(&sub.owner_id).await;
                        return Some((snapshot, sub));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Subscriber for {} skipped {} ticks", sub.owner_id, skipped);
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    /// Wake every subscriber once
    pub async fn notify(&self) -> usize {
        match self.ticks.read().await.as_ref() {
            Some(tx) => tx.send(()).unwrap_or(0),
            None => 0,
        }
    }

    #[cfg(test)]
    pub(crate) async fn subscriber_count(&self) -> usize {
        self.ticks
            .read()
            .await
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// End every open stream
    pub async fn shutdown(&self) {
        if self.ticks.write().await.take().is_some() {
            info!("Subscriptions closed");
        }
    }

    /// Shared ticker loop; closes all streams once shutdown is signalled
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; subscribers already got that snapshot
        ticker.tick().await;

        info!("Subscription ticker started with {:?} cadence", self.cadence);

        if !*shutdown.borrow() {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.notify().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }

        self.shutdown().await;
    }
}

/// Pump a snapshot stream into a channel until either side goes away.
///
/// Returns how many snapshots were delivered. A closed receiver is a normal
/// disconnect and ends forwarding quietly.
pub async fn forward<S>(mut snapshots: S, sender: mpsc::Sender<Snapshot>) -> usize
where
    S: Stream<Item = Snapshot> + Unpin,
{
    let mut delivered = 0;
    while let Some(snapshot) = snapshots.next().await {
        if sender.send(snapshot).await.is_err() {
            debug!("Subscriber disconnected after {} snapshots", delivered);
            break;
        }
        delivered += 1;
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CheckOutcome, DEFAULT_HISTORY_LIMIT};

    fn hub() -> (TargetRegistry, StatusAggregator, SubscriptionHub) {
        let registry = TargetRegistry::new(30);
        let aggregator = StatusAggregator::new(DEFAULT_HISTORY_LIMIT);
        let hub = SubscriptionHub::new(
            registry.clone(),
            aggregator.clone(),
            Duration::from_secs(5),
            16,
        );
        (registry, aggregator, hub)
    }

    #[tokio::test]
    async fn test_snapshot_is_owner_scoped() {
        let (registry, aggregator, hub) = hub();
        let a = registry.add("alice", "A", "http://a.test", 30).await.unwrap();
        registry.add("alice", "B", "http://b.test", 30).await.unwrap();
        let c = registry.add("bob", "C", "http://c.test", 30).await.unwrap();
        aggregator.track(&a).await;
        aggregator.track(&c).await;
        aggregator.record(&a, CheckOutcome::up(10.0)).await;
        aggregator.record(&c, CheckOutcome::up(10.0)).await;

        let snapshot = hub.snapshot("alice").await;
        assert_eq!(snapshot.owner_id, "alice");
        assert_eq!(snapshot.targets.len(), 2);
        // Never-checked targets have no status entry yet
        assert_eq!(snapshot.status.len(), 1);
        assert!(snapshot.status.contains_key("http://a.test"));

        let empty = hub.snapshot("carol").await;
        assert!(empty.targets.is_empty() && empty.status.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_hides_removed_targets() {
        let (registry, aggregator, hub) = hub();
        let a = registry.add("alice", "A", "http://a.test", 30).await.unwrap();
        aggregator.track(&a).await;
        aggregator.record(&a, CheckOutcome::up(10.0)).await;

        registry.remove("alice", "http://a.test").await.unwrap();
        let snapshot = hub.snapshot("alice").await;
        assert!(snapshot.targets.is_empty());
        assert!(snapshot.status.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_follows_ticker() {
        let (registry, aggregator, hub) = hub();
        let a = registry.add("alice", "A", "http://a.test", 30).await.unwrap();
        aggregator.track(&a).await;

        let (tx, rx) = watch::channel(false);
        let ticker = hub.clone();
        let ticker_handle = tokio::spawn(async move { ticker.run(rx).await });

        let mut stream = hub.subscribe("alice").await;
        let first = stream.next().await.unwrap();
        assert!(first.status.is_empty());

        aggregator.record(&a, CheckOutcome::up(42.0)).await;
        let second = stream.next().await.unwrap();
        assert_eq!(second.status["http://a.test"].last_response_time, 42.0);
        assert!(second.generated_at >= first.generated_at);

        tx.send(true).unwrap();
        ticker_handle.await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_ends_streams() {
        let (_, _, hub) = hub();
        let mut one = hub.subscribe("alice").await;
        let mut two = hub.subscribe("bob").await;
        assert_eq!(hub.subscriber_count().await, 2);

        assert!(one.next().await.is_some());
        assert!(two.next().await.is_some());

        hub.shutdown().await;
        assert!(one.next().await.is_none());
        assert!(two.next().await.is_none());

        let mut late = hub.subscribe("alice").await;
        assert!(late.next().await.is_some());
        assert!(late.next().await.is_none());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_ticks() {
        let registry = TargetRegistry::new(30);
        let aggregator = StatusAggregator::new(DEFAULT_HISTORY_LIMIT);
        let hub = SubscriptionHub::new(registry, aggregator, Duration::from_secs(5), 2);

        let mut stream = hub.subscribe("alice").await;
        stream.next().await.unwrap();
        for _ in 0..10 {
            hub.notify().await;
        }

        // Still delivers after losing ticks
        assert!(stream.next().await.is_some());
        hub.shutdown().await;
        let remaining = stream.collect::<Vec<_>>().await;
        assert!(remaining.len() <= 2);
    }

    #[tokio::test]
    async fn test_forward_stops_on_disconnect() {
        let (_, _, hub) = hub();
        let stream = hub.subscribe("alice").await;
        let (tx, mut rx) = mpsc::channel(1);

        let pump = tokio::spawn(forward(stream, tx));
        assert!(rx.recv().await.is_some());
        drop(rx);

        hub.notify().await;
        assert_eq!(pump.await.unwrap(), 1);
    }
}
