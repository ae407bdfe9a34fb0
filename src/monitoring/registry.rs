use reqwest::Url;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::errors::{MonitorError, MonitorResult};
use crate::models::{OwnerId, Target};

/// In-memory catalog of monitored targets, grouped per owner.
///
/// Each owner's targets are kept in insertion order. The registry only
/// manages lifecycle; persistence is driven by the caller.
#[derive(Clone)]
pub struct TargetRegistry {
    targets: Arc<RwLock<HashMap<OwnerId, Vec<Target>>>>,
    min_interval_secs: u64,
}

impl TargetRegistry {
    pub fn new(min_interval_secs: u64) -> Self {
        Self {
            targets: Arc::new(RwLock::new(HashMap::new())),
            min_interval_secs,
        }
    }

    /// Register a new target after validating its url and interval
    pub async fn add(
        &self,
        owner_id: &str,
        name: &str,
        url: &str,
        interval: u64,
    ) -> MonitorResult<Target> {
        let url = validate_url(url)?;
        if interval < self.min_interval_secs {
            return Err(MonitorError::invalid(format!(
                "interval must be at least {} seconds (got {})",
                self.min_interval_secs, interval
            )));
        }
        let name = match name.trim() {
            "" => url.clone(),
            trimmed => trimmed.to_string(),
        };

        let mut targets = self.targets.write().await;
        let owned = targets.entry(owner_id.to_string()).or_default();
        if owned.iter().any(|t| t.url == url) {
            return Err(MonitorError::DuplicateTarget { url });
        }

        let target = Target::new(owner_id, name, url, interval);
        owned.push(target.clone());

        info!("Added target {} for {} every {}s", target.url, owner_id, interval);
        Ok(target)
    }

    /// Targets of one owner in insertion order
    pub async fn list(&self, owner_id: &str) -> Vec<Target> {
        self.targets
            .read()
            .await
            .get(owner_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn get(&self, owner_id: &str, url: &str) -> Option<Target> {
        self.targets
            .read()
            .await
            .get(owner_id)
            .and_then(|owned| owned.iter().find(|t| t.url == url).cloned())
    }

    /// Flip the paused flag. Calling it twice resumes the target.
    pub async fn pause(&self, owner_id: &str, url: &str) -> MonitorResult<Target> {
        let mut targets = self.targets.write().await;
        let target = targets
            .get_mut(owner_id)
            .and_then(|owned| owned.iter_mut().find(|t| t.url == url))
            .ok_or_else(|| MonitorError::NotFound {
                url: url.to_string(),
            })?;

        target.paused = !target.paused;
        info!(
            "Target {} for {} is now {}",
            url,
            owner_id,
            if target.paused { "paused" } else { "active" }
        );
        Ok(target.clone())
    }

    pub async fn remove(&self, owner_id: &str, url: &str) -> MonitorResult<Target> {
        let mut targets = self.targets.write().await;
        let owned = targets.get_mut(owner_id).ok_or_else(|| MonitorError::NotFound {
            url: url.to_string(),
        })?;
        let index = owned
            .iter()
            .position(|t| t.url == url)
            .ok_or_else(|| MonitorError::NotFound {
                url: url.to_string(),
            })?;

        let removed = owned.remove(index);
        if owned.is_empty() {
            targets.remove(owner_id);
        }

        info!("Removed target {} for {}", url, owner_id);
        Ok(removed)
    }

    /// Every target across all owners
    pub async fn all_targets(&self) -> Vec<Target> {
        self.targets.read().await.values().flatten().cloned().collect()
    }

    /// Install targets loaded from storage, replacing the owner's list
    pub async fn load(&self, owner_id: &str, loaded: Vec<Target>) {
        let mut owned: Vec<Target> = Vec::with_capacity(loaded.len());
        for mut target in loaded {
            if owned.iter().any(|t| t.url == target.url) {
                debug!("Skipping duplicate stored target {} for {}", target.url, owner_id);
                continue;
            }
            target.owner_id = owner_id.to_string();
            owned.push(target);
        }

        let mut targets = self.targets.write().await;
        if owned.is_empty() {
            targets.remove(owner_id);
        } else {
            targets.insert(owner_id.to_string(), owned);
        }
    }
}

/// Accept only absolute http(s) urls with a host
pub fn validate_url(raw: &str) -> MonitorResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(MonitorError::invalid("url is required"));
    }

    let parsed = Url::parse(trimmed)
        .map_err(|e| MonitorError::invalid(format!("malformed url '{}': {}", trimmed, e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(MonitorError::invalid(format!(
                "unsupported url scheme '{}', expected http or https",
                other
            )))
        }
    }

    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(MonitorError::invalid(format!("url '{}' has no host", trimmed)));
    }

    Ok(trimmed.to_string())
}
