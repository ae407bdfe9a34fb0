use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::errors::StorageError;
use crate::metrics::MetricsCollector;
use crate::models::OwnerId;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::storage::Storage;

use super::aggregator::StatusAggregator;
use super::registry::TargetRegistry;

/// Writes owner state from the registry and aggregator to storage.
///
/// Registry mutations call [`Persister::persist_owner`] before returning.
/// Status updates only mark the owner dirty; the flush loop writes them out
/// in batches so storage stays off the probe path.
#[derive(Clone)]
pub struct Persister {
    registry: TargetRegistry,
    aggregator: StatusAggregator,
    storage: Arc<dyn Storage>,
    metrics: Arc<MetricsCollector>,
    dirty: Arc<Mutex<HashSet<OwnerId>>>,
    retry: RetryConfig,
}

impl Persister {
    pub fn new(
        registry: TargetRegistry,
        aggregator: StatusAggregator,
        storage: Arc<dyn Storage>,
        metrics: Arc<MetricsCollector>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            registry,
            aggregator,
            storage,
            metrics,
            dirty: Arc::new(Mutex::new(HashSet::new())),
            retry,
        }
    }

    /// Populate the registry and aggregator from storage
    pub async fn restore(&self) -> Result<usize, StorageError> {
        let documents = self.storage.load_all().await?;
        let mut restored = 0;

        for (owner_id, document) in documents {
            self.registry.load(&owner_id, document.targets).await;
            for target in self.registry.list(&owner_id).await {
                let record = document.status.get(&target.url).cloned();
                self.aggregator.load(&target, record).await;
                restored += 1;
            }
        }

        info!("Restored {} targets from storage", restored);
        Ok(restored)
    }

    /// Save one owner now. Failures are logged, counted and left dirty for
    /// the next flush; in-memory state is never rolled back.
    pub async fn persist_owner(&self, owner_id: &str) -> bool {
        let targets = self.registry.list(owner_id).await;
        let status = self.aggregator.records_for(owner_id).await;
        let storage: &dyn Storage = self.storage.as_ref();

        let result = retry_with_backoff(
            &format!("Saving state for {}", owner_id),
            move || storage.save(owner_id, targets.clone(), status.clone()),
            self.retry.clone(),
        )
        .await;

        match result {
            Ok(()) => {
                debug!("Persisted state for {}", owner_id);
                true
            }
            Err(e) => {
                error!("Error saving state for {}: {}", owner_id, e);
                self.metrics.record_persistence_failure().await;
                self.dirty.lock().await.insert(owner_id.to_string());
                false
            }
        }
    }

    pub async fn mark_dirty(&self, owner_id: &str) {
        self.dirty.lock().await.insert(owner_id.to_string());
    }

    #[cfg(test)]
    pub(crate) async fn dirty_owners(&self) -> Vec<OwnerId> {
        self.dirty.lock().await.iter().cloned().collect()
    }

    /// Persist every dirty owner, returning how many saves succeeded
    pub async fn flush(&self) -> usize {
        let owners: Vec<OwnerId> = self.dirty.lock().await.drain().collect();
        let mut saved = 0;
        for owner_id in owners {
            if self.persist_owner(&owner_id).await {
                saved += 1;
            }
        }
        saved
    }

    /// Background flush loop; returns once shutdown is signalled
    pub async fn run(&self, flush_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Persistence flush loop started with {:?} interval", flush_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let saved = self.flush().await;
                    if saved > 0 {
                        debug!("Flushed {} owners", saved);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Persistence flush loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CheckOutcome, DEFAULT_HISTORY_LIMIT};
    use crate::retry::presets;
    use crate::storage::MemoryStorage;

    fn setup(storage: &MemoryStorage) -> (TargetRegistry, StatusAggregator, Arc<MetricsCollector>, Persister) {
        let registry = TargetRegistry::new(30);
        let aggregator = StatusAggregator::new(DEFAULT_HISTORY_LIMIT);
        let metrics = Arc::new(MetricsCollector::new());
        let persister = Persister::new(
            registry.clone(),
            aggregator.clone(),
            Arc::new(storage.clone()),
            metrics.clone(),
            presets::none(),
        );
        (registry, aggregator, metrics, persister)
    }

    #[tokio::test]
    async fn test_persist_and_restore() {
        let storage = MemoryStorage::new();
        let (registry, aggregator, _, persister) = setup(&storage);

        let target = registry.add("alice", "X", "http://x.test", 30).await.unwrap();
        registry.add("alice", "Y", "http://y.test", 30).await.unwrap();
        aggregator.track(&target).await;
        aggregator.record(&target, CheckOutcome::up(12.0)).await;
        assert!(persister.persist_owner("alice").await);

        let stored = storage.owner("alice").await.unwrap();
        assert_eq!(stored.targets.len(), 2);
        assert_eq!(stored.status["http://x.test"].total_checks, 1);

        let (registry2, aggregator2, _, persister2) = setup(&storage);
        assert_eq!(persister2.restore().await.unwrap(), 2);
        assert_eq!(registry2.list("alice").await, registry.list("alice").await);
        assert_eq!(aggregator2.get(&target.key()).await.unwrap().total_checks, 1);

        // Restored targets keep their identity, so checks land on them
        let unchecked = registry2.get("alice", "http://y.test").await.unwrap();
        assert!(aggregator2.get(&unchecked.key()).await.is_none());
        let record = aggregator2.record(&unchecked, CheckOutcome::up(3.0)).await.unwrap();
        assert_eq!(record.total_checks, 1);
    }

    #[tokio::test]
    async fn test_failure_keeps_memory_and_stays_dirty() {
        let storage = MemoryStorage::new();
        let (registry, _, metrics, persister) = setup(&storage);
        registry.add("alice", "X", "http://x.test", 30).await.unwrap();

        storage.set_failing(true);
        assert!(!persister.persist_owner("alice").await);
        assert_eq!(registry.list("alice").await.len(), 1);
        assert_eq!(persister.dirty_owners().await, vec!["alice".to_string()]);
        assert_eq!(metrics.get_stats().await.persistence_failures, 1);

        storage.set_failing(false);
        assert_eq!(persister.flush().await, 1);
        assert!(persister.dirty_owners().await.is_empty());
        assert!(storage.owner("alice").await.is_some());
    }
}
