//! Durable storage for targets, status records and accounts.
//!
//! The core only talks to the [`Storage`] trait. [`JsonFileStorage`] keeps the
//! whole dataset in one JSON document and rewrites it atomically on every
//! save; [`MemoryStorage`] is used by tests and one-shot tooling.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::StorageError;
use crate::models::{OwnerDocument, OwnerId, StatusRecord, Target, UserRecord};

pub type StorageResult<T> = Result<T, StorageError>;

/// Persistence collaborator consumed by the monitoring core
pub trait Storage: Send + Sync {
    /// Load every owner's targets and status records
    fn load_all(&self) -> BoxFuture<'_, StorageResult<HashMap<OwnerId, OwnerDocument>>>;

    /// Replace one owner's stored state
    fn save<'a>(
        &'a self,
        owner_id: &'a str,
        targets: Vec<Target>,
        status: BTreeMap<String, StatusRecord>,
    ) -> BoxFuture<'a, StorageResult<()>>;

    fn load_users(&self) -> BoxFuture<'_, StorageResult<Vec<UserRecord>>>;

    fn save_users(&self, users: Vec<UserRecord>) -> BoxFuture<'_, StorageResult<()>>;
}

/// On-disk layout of the JSON datastore
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Datastore {
    #[serde(default)]
    owners: BTreeMap<OwnerId, OwnerDocument>,
    #[serde(default)]
    users: BTreeMap<String, UserRecord>,
}

/// Single-file JSON datastore
pub struct JsonFileStorage {
    path: PathBuf,
    state: Mutex<Datastore>,
}

impl JsonFileStorage {
    /// Open the datastore, reading the existing file if there is one
    pub async fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Datastore::default(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No datastore at {}, starting empty", path.display());
                Datastore::default()
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            "Opened datastore {} ({} owners, {} users)",
            path.display(),
            state.owners.len(),
            state.users.len()
        );

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Write the whole document next to the target file, then rename over it
    async fn write_out(&self, state: &Datastore) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(state)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!("Wrote {} bytes to {}", bytes.len(), self.path.display());
        Ok(())
    }
}

impl Storage for JsonFileStorage {
    fn load_all(&self) -> BoxFuture<'_, StorageResult<HashMap<OwnerId, OwnerDocument>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .owners
                .iter()
                .map(|(owner, doc)| (owner.clone(), doc.clone()))
                .collect())
        })
    }

    fn save<'a>(
        &'a self,
        owner_id: &'a str,
        targets: Vec<Target>,
        status: BTreeMap<String, StatusRecord>,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            // Held across the write so concurrent saves land in order.
            let mut state = self.state.lock().await;
            state
                .owners
                .insert(owner_id.to_string(), OwnerDocument { targets, status });
            self.write_out(&state).await
        })
    }

    fn load_users(&self) -> BoxFuture<'_, StorageResult<Vec<UserRecord>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.users.values().cloned().collect())
        })
    }

    fn save_users(&self, users: Vec<UserRecord>) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.users = users
                .into_iter()
                .map(|user| (user.username.clone(), user))
                .collect();
            self.write_out(&state).await
        })
    }
}

/// In-memory storage; can be switched into a failing mode for tests
#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<Datastore>>,
    failing: Arc<AtomicBool>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent save fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn owner(&self, owner_id: &str) -> Option<OwnerDocument> {
        self.state.lock().await.owners.get(owner_id).cloned()
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("memory storage set to fail".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Storage for MemoryStorage {
    fn load_all(&self) -> BoxFuture<'_, StorageResult<HashMap<OwnerId, OwnerDocument>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .owners
                .iter()
                .map(|(owner, doc)| (owner.clone(), doc.clone()))
                .collect())
        })
    }

    fn save<'a>(
        &'a self,
        owner_id: &'a str,
        targets: Vec<Target>,
        status: BTreeMap<String, StatusRecord>,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            self.check_available()?;
            self.state
                .lock()
                .await
                .owners
                .insert(owner_id.to_string(), OwnerDocument { targets, status });
            Ok(())
        })
    }

    fn load_users(&self) -> BoxFuture<'_, StorageResult<Vec<UserRecord>>> {
        Box::pin(async move { Ok(self.state.lock().await.users.values().cloned().collect()) })
    }

    fn save_users(&self, users: Vec<UserRecord>) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.check_available()?;
            self.state.lock().await.users = users
                .into_iter()
                .map(|user| (user.username.clone(), user))
                .collect();
            Ok(())
        })
    }
}
