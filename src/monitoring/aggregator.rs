use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::models::{CheckOutcome, StatusRecord, Target, TargetKey};

/// Status of one tracked target instance; `record` stays empty until the
/// first outcome arrives.
struct Slot {
    target_id: String,
    record: Option<StatusRecord>,
}

type SlotRef = Arc<Mutex<Slot>>;

/// Owner of every [`StatusRecord`].
///
/// Targets must be tracked before outcomes are accepted for them, and each
/// slot remembers which target instance it belongs to. An outcome for a
/// deleted instance, even one whose url was re-added since, is dropped.
/// The outer map is only write-locked to insert or drop a slot, so checks of
/// unrelated targets never wait on each other.
#[derive(Clone)]
pub struct StatusAggregator {
    slots: Arc<RwLock<HashMap<TargetKey, SlotRef>>>,
    history_limit: usize,
}

impl StatusAggregator {
    pub fn new(history_limit: usize) -> Self {
        Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
            history_limit,
        }
    }

    /// Start accepting outcomes for this target instance, discarding any
    /// state left by an earlier instance with the same url
    pub async fn track(&self, target: &Target) {
        let slot = Slot {
            target_id: target.id.clone(),
            record: None,
        };
        self.slots
            .write()
            .await
            .insert(target.key(), Arc::new(Mutex::new(slot)));
    }

    /// Apply an outcome to the target's record, creating it on first use.
    ///
    /// Returns `None` if the target instance is no longer tracked.
    pub async fn record(&self, target: &Target, outcome: CheckOutcome) -> Option<StatusRecord> {
        let key = target.key();
        let slot = self.slots.read().await.get(&key).cloned()?;

        let mut slot = slot.lock().await;
        if slot.target_id != target.id {
            debug!("Dropping outcome for replaced target {}", key);
            return None;
        }

        let record = slot
            .record
            .get_or_insert_with(|| StatusRecord::new(target.name.clone()));
        record.name = target.name.clone();
        record.apply(outcome, self.history_limit);

        debug!(
            "{}: {} checks, {}% up, avg {}ms",
            key, record.total_checks, record.uptime_percent, record.avg_response_time
        );
        Some(record.clone())
    }

    pub async fn get(&self, key: &TargetKey) -> Option<StatusRecord> {
        let slot = self.slots.read().await.get(key).cloned()?;
        let record = slot.lock().await.record.clone();
        record
    }

    /// Current records of one owner keyed by url; unchecked targets are omitted
    pub async fn records_for(&self, owner_id: &str) -> BTreeMap<String, StatusRecord> {
        let slots: Vec<(String, SlotRef)> = self
            .slots
            .read()
            .await
            .iter()
            .filter(|(key, _)| key.owner_id == owner_id)
            .map(|(key, slot)| (key.url.clone(), slot.clone()))
            .collect();

        let mut result = BTreeMap::new();
        for (url, slot) in slots {
            if let Some(record) = slot.lock().await.record.clone() {
                result.insert(url, record);
            }
        }
        result
    }

    /// Stop tracking a target and drop its record
    pub async fn remove(&self, key: &TargetKey) -> Option<StatusRecord> {
        let slot = self.slots.write().await.remove(key)?;
        let record = slot.lock().await.record.take();
        record
    }

    /// Track a target restored from storage together with its saved record
    pub async fn load(&self, target: &Target, record: Option<StatusRecord>) {
        let record = record.map(|mut record| {
            while record.history.len() > self.history_limit {
                record.history.pop_front();
            }
            record
        });
        let slot = Slot {
            target_id: target.id.clone(),
            record,
        };
        self.slots
            .write()
            .await
            .insert(target.key(), Arc::new(Mutex::new(slot)));
    }

    #[cfg(test)]
    pub(crate) async fn tracked(&self) -> usize {
        self.slots.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DEFAULT_HISTORY_LIMIT;

    async fn tracked(aggregator: &StatusAggregator, owner: &str, url: &str) -> Target {
        let target = Target::new(owner, url, url, 30);
        aggregator.track(&target).await;
        target
    }

    #[tokio::test]
    async fn test_record_creates_lazily() {
        let aggregator = StatusAggregator::new(DEFAULT_HISTORY_LIMIT);
        let a = tracked(&aggregator, "alice", "http://x.test").await;
        assert!(aggregator.get(&a.key()).await.is_none());

        let record = aggregator.record(&a, CheckOutcome::up(120.0)).await.unwrap();
        assert_eq!(record.total_checks, 1);
        assert_eq!(record.uptime_percent, 100.0);
        assert_eq!(record.avg_response_time, 120.0);

        let record = aggregator
            .record(&a, CheckOutcome::down("request timed out after 10s"))
            .await
            .unwrap();
        assert_eq!(record.up_count, 1);
        assert_eq!(record.down_count, 1);
        assert_eq!(record.uptime_percent, 50.0);
        assert_eq!(record.avg_response_time, 120.0);
    }

    #[tokio::test]
    async fn test_untracked_target_is_ignored() {
        let aggregator = StatusAggregator::new(DEFAULT_HISTORY_LIMIT);
        let a = Target::new("alice", "A", "http://x.test", 30);

        assert!(aggregator.record(&a, CheckOutcome::up(1.0)).await.is_none());
        assert_eq!(aggregator.tracked().await, 0);
    }

    #[tokio::test]
    async fn test_history_bounded() {
        let aggregator = StatusAggregator::new(DEFAULT_HISTORY_LIMIT);
        let a = tracked(&aggregator, "alice", "http://x.test").await;
        for _ in 0..150 {
            aggregator.record(&a, CheckOutcome::up(50.0)).await;
        }

        let record = aggregator.get(&a.key()).await.unwrap();
        assert_eq!(record.history.len(), 100);
        assert_eq!(record.total_checks, 150);
        assert_eq!(record.avg_response_time, 50.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_records_stay_isolated() {
        let aggregator = StatusAggregator::new(DEFAULT_HISTORY_LIMIT);
        let mut targets = Vec::new();
        for i in 0..8 {
            let owner = if i % 2 == 0 { "alice" } else { "bob" };
            targets.push(tracked(&aggregator, owner, &format!("http://t{}.test", i)).await);
        }

        let mut handles = Vec::new();
        for (i, t) in targets.iter().enumerate() {
            for n in 0..(i + 1) * 25 {
                let aggregator = aggregator.clone();
                let t = t.clone();
                handles.push(tokio::spawn(async move {
                    let outcome = if n % 3 == 0 {
                        CheckOutcome::down("HTTP 500")
                    } else {
                        CheckOutcome::up(10.0)
                    };
                    aggregator.record(&t, outcome).await;
                }));
            }
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for (i, t) in targets.iter().enumerate() {
            let record = aggregator.get(&t.key()).await.unwrap();
            assert_eq!(record.total_checks, ((i + 1) * 25) as u64);
            assert_eq!(record.total_checks, record.up_count + record.down_count);
            assert!(record.history.len() <= 100);
        }
    }

    #[tokio::test]
    async fn test_remove_leaves_nothing_behind() {
        let aggregator = StatusAggregator::new(DEFAULT_HISTORY_LIMIT);
        for i in 0..20 {
            let t = tracked(&aggregator, "alice", &format!("http://t{}.test", i)).await;
            aggregator.record(&t, CheckOutcome::up(5.0)).await;
            assert!(aggregator.remove(&t.key()).await.is_some());

            // A check that was still in flight must not bring the record back
            assert!(aggregator.record(&t, CheckOutcome::up(5.0)).await.is_none());
        }

        assert_eq!(aggregator.tracked().await, 0);
        assert!(aggregator.records_for("alice").await.is_empty());
    }

    #[tokio::test]
    async fn test_outcome_for_replaced_instance_is_dropped() {
        let aggregator = StatusAggregator::new(DEFAULT_HISTORY_LIMIT);
        let old = tracked(&aggregator, "alice", "http://x.test").await;
        aggregator.record(&old, CheckOutcome::up(5.0)).await;
        aggregator.remove(&old.key()).await;

        let new = tracked(&aggregator, "alice", "http://x.test").await;
        assert!(aggregator
            .record(&old, CheckOutcome::down("HTTP 500"))
            .await
            .is_none());
        assert!(aggregator.get(&new.key()).await.is_none());

        let record = aggregator.record(&new, CheckOutcome::up(5.0)).await.unwrap();
        assert_eq!(record.total_checks, 1);
        assert_eq!(record.down_count, 0);
    }

    #[tokio::test]
    async fn test_records_for_owner() {
        let aggregator = StatusAggregator::new(DEFAULT_HISTORY_LIMIT);
        for (owner, url) in [
            ("alice", "http://a.test"),
            ("alice", "http://b.test"),
            ("bob", "http://a.test"),
        ] {
            let t = tracked(&aggregator, owner, url).await;
            aggregator.record(&t, CheckOutcome::up(1.0)).await;
        }
        tracked(&aggregator, "alice", "http://unchecked.test").await;

        let records = aggregator.records_for("alice").await;
        assert_eq!(
            records.keys().cloned().collect::<Vec<_>>(),
            vec!["http://a.test", "http://b.test"]
        );
    }
}
