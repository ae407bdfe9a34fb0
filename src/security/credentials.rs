use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::errors::{AuthError, StorageError};
use crate::models::{OwnerId, UserRecord};
use crate::storage::Storage;

type HmacSha256 = Hmac<Sha256>;

/// Username and password pair presented at login
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Resolves callers to owner ids. The monitoring core never sees passwords.
pub trait CredentialStore: Send + Sync {
    fn authenticate<'a>(
        &'a self,
        credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<OwnerId, AuthError>>;

    /// Owner behind a live session token, if any
    fn validate<'a>(&'a self, session_token: &'a str) -> BoxFuture<'a, Option<OwnerId>>;
}

#[derive(Debug, Clone)]
struct Session {
    owner_id: OwnerId,
    expires_at: DateTime<Utc>,
}

/// Account store backed by [`Storage`] with in-memory sessions.
///
/// Passwords are bcrypt hashed. Session tokens are random uuids handed to the
/// caller once; only their HMAC is kept, so a dump of the session table
/// cannot be replayed.
pub struct LocalCredentialStore {
    users: Arc<RwLock<HashMap<String, UserRecord>>>,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    storage: Arc<dyn Storage>,
    secret: Vec<u8>,
    session_timeout: Duration,
    bcrypt_cost: u32,
}

impl LocalCredentialStore {
    pub fn new(storage: Arc<dyn Storage>, config: &AuthConfig) -> Self {
        let secret = if config.session_secret.is_empty() {
            let mut key = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            key
        } else {
            config.session_secret.as_bytes().to_vec()
        };

        Self {
            users: Arc::new(RwLock::new(HashMap::new())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            storage,
            secret,
            session_timeout: Duration::minutes(config.session_timeout_minutes),
            bcrypt_cost: config.bcrypt_cost,
        }
    }

    /// Read stored accounts into memory
    pub async fn load_users(&self) -> Result<usize, StorageError> {
        let stored = self.storage.load_users().await?;
        let mut users = self.users.write().await;
        for user in stored {
            users.insert(user.username.clone(), user);
        }
        info!("Loaded {} users", users.len());
        Ok(users.len())
    }

    /// Create an account. The owner id is the username.
    pub async fn signup(
        &self,
        username: &str,
        password: &str,
        confirm_password: &str,
    ) -> Result<OwnerId, AuthError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(AuthError::InvalidSignup("username is required".to_string()));
        }
        if password.is_empty() {
            return Err(AuthError::InvalidSignup("password is required".to_string()));
        }
        if password != confirm_password {
            return Err(AuthError::PasswordMismatch);
        }

        let snapshot = {
            let mut users = self.users.write().await;
            if users.contains_key(username) {
                return Err(AuthError::UserExists);
            }

            let password_hash = bcrypt::hash(password, self.bcrypt_cost)?;
            users.insert(
                username.to_string(),
                UserRecord {
                    username: username.to_string(),
                    password_hash,
                    created_at: Utc::now(),
                },
            );
            users.values().cloned().collect::<Vec<_>>()
        };

        // The account stays usable in memory even if it could not be saved
        if let Err(e) = self.storage.save_users(snapshot).await {
            error!("Error saving users after signup of {}: {}", username, e);
        }

        info!("New user signed up: {}", username);
        Ok(username.to_string())
    }

    /// Check credentials and open a session, returning its token
    pub async fn login(&self, credentials: &Credentials) -> Result<String, AuthError> {
        let owner_id = self.check_password(credentials).await?;

        let token = Uuid::new_v4().to_string();
        let session = Session {
            owner_id: owner_id.clone(),
            expires_at: Utc::now() + self.session_timeout,
        };
        self.sessions
            .write()
            .await
            .insert(self.hash_token(&token)?, session);

        info!("User logged in: {}", owner_id);
        Ok(token)
    }

    /// Close a session; returns false if it did not exist
    pub async fn logout(&self, session_token: &str) -> bool {
        let Ok(hashed) = self.hash_token(session_token) else {
            return false;
        };
        match self.sessions.write().await.remove(&hashed) {
            Some(session) => {
                info!("User logged out: {}", session.owner_id);
                true
            }
            None => false,
        }
    }

    /// Drop expired sessions, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| session.expires_at > now);
        let purged = before - sessions.len();
        if purged > 0 {
            debug!("Purged {} expired sessions", purged);
        }
        purged
    }

    /// Sweep expired sessions periodically until shutdown is signalled
    pub async fn run_purge(&self, every: StdDuration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Session purge loop started with {:?} interval", every);

        if !*shutdown.borrow() {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.purge_expired().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }

        info!("Session purge loop stopped");
    }

    #[cfg(test)]
    pub(crate) async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn check_password(&self, credentials: &Credentials) -> Result<OwnerId, AuthError> {
        let users = self.users.read().await;
        let user = users
            .get(credentials.username.trim())
            .ok_or(AuthError::InvalidCredentials)?;

        if bcrypt::verify(&credentials.password, &user.password_hash)? {
            Ok(user.username.clone())
        } else {
            warn!("Failed login for {}", user.username);
            Err(AuthError::InvalidCredentials)
        }
    }

    fn hash_token(&self, token: &str) -> Result<String, AuthError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| AuthError::InvalidCredentials)?;
        mac.update(token.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    async fn lookup(&self, session_token: &str) -> Option<OwnerId> {
        let hashed = self.hash_token(session_token).ok()?;
        let session = self.sessions.read().await.get(&hashed).cloned()?;

        if session.expires_at <= Utc::now() {
            self.sessions.write().await.remove(&hashed);
            debug!("Session for {} expired", session.owner_id);
            return None;
        }
        Some(session.owner_id)
    }
}

impl CredentialStore for LocalCredentialStore {
    fn authenticate<'a>(
        &'a self,
        credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<OwnerId, AuthError>> {
        Box::pin(self.check_password(credentials))
    }

    fn validate<'a>(&'a self, session_token: &'a str) -> BoxFuture<'a, Option<OwnerId>> {
        Box::pin(self.lookup(session_token))
    }
}
