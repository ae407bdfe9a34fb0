use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIN_BCRYPT_COST: u32 = 4;
const MAX_BCRYPT_COST: u32 = 31;

/// Monitor configuration with environment variable support
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub prober: ProberConfig,
    pub targets: TargetConfig,
    pub storage: StorageConfig,
    pub subscriptions: SubscriptionConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub version: String,
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between scheduler ticks
    pub tick_interval_secs: u64,
    /// Upper bound on probes running at once
    pub max_concurrent_probes: usize,
    /// Seconds in-flight probes may keep running after shutdown is requested
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProberConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub min_interval_secs: u64,
    pub history_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
    /// Seconds between background flushes of status records
    pub flush_interval_secs: u64,
    pub save_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub cadence_secs: u64,
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub session_timeout_minutes: i64,
    /// Seconds between sweeps of expired sessions
    pub purge_interval_secs: u64,
    pub bcrypt_cost: u32,
    /// Key used to hash session tokens; a random key is generated when empty
    pub session_secret: String,
}

impl Config {
    /// Load configuration from environment variables with fallback to config file.
    ///
    /// Runs before logging is set up, since the log level comes from here.
    pub fn load() -> Result<Self> {
        if Path::new(".env").exists() {
            dotenv::dotenv().ok();
        }

        let config_path =
            env::var("CONFIG_PATH").unwrap_or_else(|_| "config/uptime_monitor.toml".to_string());

        Self::load_from(&config_path)
    }

    /// Load from an explicit file path, applying env overrides and validation
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            Self::default()
        };

        config.override_from_env();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    fn override_from_env(&mut self) {
        if let Ok(val) = env::var("LOG_LEVEL") {
            self.server.log_level = val;
        }

        if let Some(num) = env_number("SCHEDULER_TICK_SECS") {
            self.scheduler.tick_interval_secs = num;
        }
        if let Some(num) = env_number("MAX_CONCURRENT_PROBES") {
            self.scheduler.max_concurrent_probes = num;
        }
        if let Some(num) = env_number("SHUTDOWN_GRACE_SECS") {
            self.scheduler.shutdown_grace_secs = num;
        }

        if let Some(num) = env_number("PROBE_TIMEOUT_SECS") {
            self.prober.timeout_secs = num;
        }

        if let Some(num) = env_number("MIN_CHECK_INTERVAL_SECS") {
            self.targets.min_interval_secs = num;
        }
        if let Some(num) = env_number("HISTORY_LIMIT") {
            self.targets.history_limit = num;
        }

        if let Ok(val) = env::var("STORAGE_PATH") {
            self.storage.path = PathBuf::from(val);
        }
        if let Some(num) = env_number("STORAGE_FLUSH_SECS") {
            self.storage.flush_interval_secs = num;
        }

        if let Some(num) = env_number("SUBSCRIPTION_CADENCE_SECS") {
            self.subscriptions.cadence_secs = num;
        }

        if let Some(num) = env_number("SESSION_TIMEOUT_MINUTES") {
            self.auth.session_timeout_minutes = num;
        }
        if let Some(num) = env_number("SESSION_PURGE_SECS") {
            self.auth.purge_interval_secs = num;
        }
        if let Some(num) = env_number("BCRYPT_COST") {
            self.auth.bcrypt_cost = num;
        }
        if let Ok(val) = env::var("SESSION_SECRET") {
            self.auth.session_secret = val;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.scheduler.tick_interval_secs == 0 {
            return Err(anyhow::anyhow!("Scheduler tick interval must be greater than 0"));
        }
        if self.scheduler.max_concurrent_probes == 0 {
            return Err(anyhow::anyhow!("max_concurrent_probes must be greater than 0"));
        }
        if self.prober.timeout_secs == 0 {
            return Err(anyhow::anyhow!("Probe timeout must be greater than 0"));
        }
        if self.targets.min_interval_secs == 0 {
            return Err(anyhow::anyhow!("Minimum check interval must be greater than 0"));
        }
        if self.targets.history_limit == 0 {
            return Err(anyhow::anyhow!("History limit must be greater than 0"));
        }
        if self.subscriptions.cadence_secs == 0 || self.subscriptions.channel_capacity == 0 {
            return Err(anyhow::anyhow!(
                "Subscription cadence and channel capacity must be greater than 0"
            ));
        }
        if !(MIN_BCRYPT_COST..=MAX_BCRYPT_COST).contains(&self.auth.bcrypt_cost) {
            return Err(anyhow::anyhow!(
                "bcrypt cost must be between {} and {}",
                MIN_BCRYPT_COST,
                MAX_BCRYPT_COST
            ));
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.prober.timeout_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.storage.flush_interval_secs.max(1))
    }

    pub fn subscription_cadence(&self) -> Duration {
        Duration::from_secs(self.subscriptions.cadence_secs)
    }

    pub fn session_purge_interval(&self) -> Duration {
        Duration::from_secs(self.auth.purge_interval_secs.max(1))
    }

    /// Get a summary of the configuration for logging
    pub fn summary(&self) -> String {
        format!(
            "Config: {} v{}, Tick={}s, Concurrency={}, ProbeTimeout={}s, MinInterval={}s, Storage={}, LogLevel={}",
            self.server.name,
            self.server.version,
            self.scheduler.tick_interval_secs,
            self.scheduler.max_concurrent_probes,
            self.prober.timeout_secs,
            self.targets.min_interval_secs,
            self.storage.path.display(),
            self.server.log_level
        )
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.parse().ok())
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "uptime-monitor".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 5,
            max_concurrent_probes: 64,
            shutdown_grace_secs: 10,
        }
    }
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            user_agent: format!("uptime-monitor/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 30,
            history_limit: crate::models::DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("users.db"),
            flush_interval_secs: 15,
            save_retries: 3,
        }
    }
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            cadence_secs: 5,
            channel_capacity: 16,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_timeout_minutes: 24 * 60,
            purge_interval_secs: 300,
            bcrypt_cost: bcrypt::DEFAULT_COST,
            session_secret: String::new(),
        }
    }
}
