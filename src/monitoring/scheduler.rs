use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::metrics::MetricsCollector;
use crate::models::{StatusRecord, Target, TargetKey};

use super::aggregator::StatusAggregator;
use super::persistence::Persister;
use super::prober::Prober;
use super::registry::TargetRegistry;

/// Phase of the global scheduling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulerState {
    Idle,
    Dispatching,
    Sleeping,
    Stopped,
}

/// Global polling loop.
///
/// Wakes on a short fixed tick and dispatches every unpaused target whose
/// own interval has elapsed since it was last dispatched. Each probe runs in
/// its own task behind a semaphore; the loop never waits for probes, and a
/// target with a probe still in flight is skipped rather than doubled up.
#[derive(Clone)]
pub struct Scheduler {
    registry: TargetRegistry,
    aggregator: StatusAggregator,
    prober: Arc<dyn Prober>,
    persister: Persister,
    metrics: Arc<MetricsCollector>,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    last_dispatched: Arc<Mutex<HashMap<TargetKey, Instant>>>,
    in_flight: Arc<Mutex<HashMap<TargetKey, JoinHandle<()>>>>,
    state: Arc<RwLock<SchedulerState>>,
}

impl Scheduler {
    pub fn new(
        registry: TargetRegistry,
        aggregator: StatusAggregator,
        prober: Arc<dyn Prober>,
        persister: Persister,
        metrics: Arc<MetricsCollector>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_probes.max(1))),
            registry,
            aggregator,
            prober,
            persister,
            metrics,
            config,
            last_dispatched: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            state: Arc::new(RwLock::new(SchedulerState::Idle)),
        }
    }

    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    async fn set_state(&self, state: SchedulerState) {
        *self.state.write().await = state;
    }

    /// A target is due when it was never dispatched or its interval elapsed
    pub fn is_due(last_dispatched: Option<Instant>, interval_secs: u64, now: Instant) -> bool {
        last_dispatched.map_or(true, |at| {
            now.saturating_duration_since(at) >= Duration::from_secs(interval_secs)
        })
    }

    /// Run one scheduling pass, returning how many probes were dispatched
    pub async fn tick(&self) -> usize {
        self.set_state(SchedulerState::Dispatching).await;
        self.reap_finished().await;

        let now = Instant::now();
        let targets = self.registry.all_targets().await;
        let known: HashSet<TargetKey> = targets.iter().map(Target::key).collect();

        let due: Vec<Target> = {
            let mut last = self.last_dispatched.lock().await;
            last.retain(|key, _| known.contains(key));

            let in_flight = self.in_flight.lock().await;
            let due: Vec<Target> = targets
                .into_iter()
                .filter(|t| !t.paused)
                .filter(|t| {
                    let key = t.key();
                    !in_flight.contains_key(&key)
                        && Self::is_due(last.get(&key).copied(), t.interval, now)
                })
                .collect();

            for target in &due {
                last.insert(target.key(), now);
            }
            due
        };

        let dispatched = due.len();
        for target in due {
            self.dispatch(target).await;
        }

        self.set_state(SchedulerState::Sleeping).await;
        dispatched
    }

    async fn dispatch(&self, target: Target) {
        let key = target.key();
        let worker = self.clone();
        let handle = tokio::spawn(async move {
            worker.run_probe(target).await;
        });
        self.in_flight.lock().await.insert(key, handle);
    }

    async fn run_probe(&self, target: Target) -> Option<StatusRecord> {
        let permit = self.permits.clone().acquire_owned().await.ok()?;
        let outcome = self.prober.probe(&target).await;
        drop(permit);

        self.metrics.record_probe(&target.url, &outcome).await;

        let current = self.registry.get(&target.owner_id, &target.url).await;
        if current.map_or(true, |t| t.id != target.id) {
            debug!("Discarding outcome for removed target {}", target.key());
            return None;
        }

        let record = self.aggregator.record(&target, outcome).await?;
        self.persister.mark_dirty(&target.owner_id).await;
        Some(record)
    }

    /// Probe a target immediately, outside the tick cadence
    pub async fn force_check(&self, target: Target) -> Option<StatusRecord> {
        self.last_dispatched
            .lock()
            .await
            .insert(target.key(), Instant::now());
        self.run_probe(target).await
    }

    /// Drop all scheduling state for a removed target, aborting its probe
    pub async fn forget(&self, key: &TargetKey) {
        self.last_dispatched.lock().await.remove(key);
        if let Some(handle) = self.in_flight.lock().await.remove(key) {
            handle.abort();
            debug!("Aborted in-flight probe for {}", key);
        }
    }

    async fn reap_finished(&self) {
        let finished: Vec<(TargetKey, JoinHandle<()>)> = {
            let mut in_flight = self.in_flight.lock().await;
            let keys: Vec<TargetKey> = in_flight
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| in_flight.remove_entry(&key))
                .collect()
        };

        for (key, handle) in finished {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("Probe task for {} panicked", key);
                }
            }
        }
    }

    /// Await every probe currently in flight
    pub async fn wait_for_in_flight(&self) {
        let handles: Vec<(TargetKey, JoinHandle<()>)> =
            self.in_flight.lock().await.drain().collect();
        for (key, handle) in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("Probe task for {} panicked", key);
                }
            }
        }
    }

    /// Give in-flight probes the grace period, then abort the rest
    pub async fn drain(&self) {
        let mut handles: Vec<(TargetKey, JoinHandle<()>)> =
            self.in_flight.lock().await.drain().collect();
        if handles.is_empty() {
            return;
        }

        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        info!("Waiting up to {:?} for {} in-flight probes", grace, handles.len());

        let all_done = futures::future::join_all(handles.iter_mut().map(|(_, handle)| handle));
        if timeout(grace, all_done).await.is_err() {
            for (key, handle) in &handles {
                if !handle.is_finished() {
                    warn!("Abandoning probe for {} after shutdown grace period", key);
                    handle.abort();
                }
            }
        }
    }

    /// Main loop; returns after shutdown is signalled and probes are drained
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let tick_interval = Duration::from_secs(self.config.tick_interval_secs.max(1));
        let mut ticker = interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("🔄 Scheduler started with {:?} tick", tick_interval);

        if !*shutdown.borrow() {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let started = Instant::now();
                        let dispatched = self.tick().await;
                        self.metrics.record_tick(started.elapsed()).await;
                        if dispatched > 0 {
                            debug!("Dispatched {} probes", dispatched);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }

        info!("Scheduler stopping");
        self.drain().await;
        self.set_state(SchedulerState::Stopped).await;
        info!("Scheduler stopped");
    }
}
