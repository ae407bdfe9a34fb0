use anyhow::{Context, Result};
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::errors::{MonitorError, MonitorResult};
use crate::metrics::{MetricsCollector, MonitorStats};
use crate::models::{OwnerId, Snapshot, StatusRecord, Target};
use crate::monitoring::{
    HttpProber, Persister, Prober, Scheduler, StatusAggregator, SubscriptionHub, TargetRegistry,
};
use crate::retry::presets;
use crate::security::{CredentialStore, Credentials, LocalCredentialStore};
use crate::storage::{JsonFileStorage, Storage};

/// Multi-tenant uptime monitor.
///
/// Wires the registry, aggregator, scheduler, persistence, subscriptions and
/// accounts together. Every owner-scoped call takes a session token and
/// resolves it to an owner before touching any state.
pub struct UptimeMonitor {
    config: Config,
    registry: TargetRegistry,
    aggregator: StatusAggregator,
    scheduler: Scheduler,
    persister: Persister,
    hub: SubscriptionHub,
    credentials: Arc<LocalCredentialStore>,
    metrics: Arc<MetricsCollector>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UptimeMonitor {
    pub fn new(config: Config, storage: Arc<dyn Storage>, prober: Arc<dyn Prober>) -> Self {
        let registry = TargetRegistry::new(config.targets.min_interval_secs);
        let aggregator = StatusAggregator::new(config.targets.history_limit);
        let metrics = Arc::new(MetricsCollector::new());

        let persister = Persister::new(
            registry.clone(),
            aggregator.clone(),
            storage.clone(),
            metrics.clone(),
            presets::fast().with_max_retries(config.storage.save_retries),
        );
        let scheduler = Scheduler::new(
            registry.clone(),
            aggregator.clone(),
            prober,
            persister.clone(),
            metrics.clone(),
            config.scheduler.clone(),
        );
        let hub = SubscriptionHub::new(
            registry.clone(),
            aggregator.clone(),
            config.subscription_cadence(),
            config.subscriptions.channel_capacity,
        );
        let credentials = Arc::new(LocalCredentialStore::new(storage, &config.auth));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            registry,
            aggregator,
            scheduler,
            persister,
            hub,
            credentials,
            metrics,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build a monitor over the JSON datastore and the HTTP prober, restoring saved state
    pub async fn open(config: Config) -> Result<Self> {
        let storage = JsonFileStorage::open(&config.storage.path)
            .await
            .with_context(|| {
                format!("Failed to open datastore: {}", config.storage.path.display())
            })?;
        let prober = HttpProber::new(config.probe_timeout(), &config.prober.user_agent)
            .context("Failed to build HTTP client")?;

        let monitor = Self::new(config, Arc::new(storage), Arc::new(prober));
        monitor.restore().await?;
        Ok(monitor)
    }

    /// Load accounts, targets and status records from storage
    pub async fn restore(&self) -> MonitorResult<usize> {
        self.credentials.load_users().await?;
        Ok(self.persister.restore().await?)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub async fn signup(
        &self,
        username: &str,
        password: &str,
        confirm_password: &str,
    ) -> MonitorResult<OwnerId> {
        Ok(self
            .credentials
            .signup(username, password, confirm_password)
            .await?)
    }

    /// Returns a session token for the other calls
    pub async fn login(&self, username: &str, password: &str) -> MonitorResult<String> {
        Ok(self
            .credentials
            .login(&Credentials::new(username, password))
            .await?)
    }

    pub async fn logout(&self, session_token: &str) -> bool {
        self.credentials.logout(session_token).await
    }

    async fn owner(&self, session_token: &str) -> MonitorResult<OwnerId> {
        self.credentials
            .validate(session_token)
            .await
            .ok_or(MonitorError::Unauthorized)
    }

    /// Register a target and run its first check right away
    pub async fn add_target(
        &self,
        session_token: &str,
        name: &str,
        url: &str,
        interval: u64,
    ) -> MonitorResult<Target> {
        let owner_id = self.owner(session_token).await?;
        let target = self.registry.add(&owner_id, name, url, interval).await?;
        self.aggregator.track(&target).await;
        self.persister.persist_owner(&owner_id).await;

        self.scheduler.force_check(target.clone()).await;
        Ok(target)
    }

    pub async fn list_targets(&self, session_token: &str) -> MonitorResult<Vec<Target>> {
        let owner_id = self.owner(session_token).await?;
        Ok(self.registry.list(&owner_id).await)
    }

    pub async fn snapshot(&self, session_token: &str) -> MonitorResult<Snapshot> {
        let owner_id = self.owner(session_token).await?;
        Ok(self.hub.snapshot(&owner_id).await)
    }

    /// Pause an active target or resume a paused one
    pub async fn toggle_pause(&self, session_token: &str, url: &str) -> MonitorResult<Target> {
        let owner_id = self.owner(session_token).await?;
        let target = self.registry.pause(&owner_id, url).await?;
        self.persister.persist_owner(&owner_id).await;
        Ok(target)
    }

    /// Delete a target together with its status record
    pub async fn remove_target(&self, session_token: &str, url: &str) -> MonitorResult<Target> {
        let owner_id = self.owner(session_token).await?;
        let target = self.registry.remove(&owner_id, url).await?;
        let key = target.key();
        self.aggregator.remove(&key).await;
        self.scheduler.forget(&key).await;
        self.persister.persist_owner(&owner_id).await;
        Ok(target)
    }

    /// Probe one target now, regardless of its interval or pause state
    pub async fn check_now(&self, session_token: &str, url: &str) -> MonitorResult<StatusRecord> {
        let owner_id = self.owner(session_token).await?;
        let not_found = || MonitorError::NotFound {
            url: url.to_string(),
        };

        let target = self.registry.get(&owner_id, url).await.ok_or_else(not_found)?;
        self.scheduler
            .force_check(target)
            .await
            .ok_or_else(not_found)
    }

    pub async fn subscribe(&self, session_token: &str) -> MonitorResult<BoxStream<'static, Snapshot>> {
        let owner_id = self.owner(session_token).await?;
        Ok(self.hub.subscribe(&owner_id).await)
    }

    pub async fn stats(&self) -> MonitorStats {
        self.metrics.get_stats().await
    }

    /// Spawn the scheduler, flush loop, subscription ticker and session sweeper
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            warn!("Monitor already started");
            return;
        }

        let scheduler = self.scheduler.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move { scheduler.run(shutdown).await }));

        let persister = self.persister.clone();
        let flush_interval = self.config.flush_interval();
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            persister.run(flush_interval, shutdown).await
        }));

        let hub = self.hub.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move { hub.run(shutdown).await }));

        let credentials = self.credentials.clone();
        let purge_interval = self.config.session_purge_interval();
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            credentials.run_purge(purge_interval, shutdown).await
        }));

        info!("✅ Uptime monitor started");
    }

    /// Stop background work, drain in-flight probes and flush pending state
    pub async fn shutdown(&self) {
        info!("🛑 Shutting down uptime monitor");
        self.shutdown_tx.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        self.scheduler.drain().await;
        self.hub.shutdown().await;

        let saved = self.persister.flush().await;
        info!("Flushed {} owners on shutdown", saved);
    }
}
