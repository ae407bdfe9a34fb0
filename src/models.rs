use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Identifier of the account that owns a set of targets
pub type OwnerId = String;

/// Default number of outcomes retained per target
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Identity of a monitored target: one url per owner
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetKey {
    pub owner_id: OwnerId,
    pub url: String,
}

impl TargetKey {
    pub fn new(owner_id: impl Into<OwnerId>, url: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            url: url.into(),
        }
    }
}

impl std::fmt::Display for TargetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.owner_id, self.url)
    }
}

/// A monitored url registered by one owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Distinguishes a re-added url from the instance that was deleted
    #[serde(default = "new_target_id")]
    pub id: String,
    pub owner_id: OwnerId,
    pub name: String,
    pub url: String,
    /// Check interval in seconds
    pub interval: u64,
    #[serde(default)]
    pub paused: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn new_target_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Target {
    pub fn new(
        owner_id: impl Into<OwnerId>,
        name: impl Into<String>,
        url: impl Into<String>,
        interval: u64,
    ) -> Self {
        Self {
            id: new_target_id(),
            owner_id: owner_id.into(),
            name: name.into(),
            url: url.into(),
            interval,
            paused: false,
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> TargetKey {
        TargetKey::new(self.owner_id.clone(), self.url.clone())
    }
}

/// Up/down classification of a single probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Up,
    Down,
}

impl ProbeStatus {
    pub fn is_up(self) -> bool {
        self == ProbeStatus::Up
    }
}

impl std::fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeStatus::Up => write!(f, "up"),
            ProbeStatus::Down => write!(f, "down"),
        }
    }
}

/// Result of one probe. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub timestamp: DateTime<Utc>,
    pub status: ProbeStatus,
    /// Round-trip latency in milliseconds; 0 for down outcomes
    pub response_time_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckOutcome {
    pub fn up(response_time_ms: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            status: ProbeStatus::Up,
            response_time_ms: round2(response_time_ms),
            http_status: Some(200),
            error: None,
        }
    }

    pub fn down(error: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            status: ProbeStatus::Down,
            response_time_ms: 0.0,
            http_status: None,
            error: Some(error.into()),
        }
    }

    pub fn with_http_status(mut self, code: u16) -> Self {
        self.http_status = Some(code);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_up(&self) -> bool {
        self.status.is_up()
    }
}

/// Rolling statistics for one target.
///
/// `history` is bounded; the counters are all-time. `uptime_percent` is
/// derived from the counters while `avg_response_time` is derived from the
/// retained history only, so old successes stop contributing to the average
/// once they are evicted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub name: String,
    pub history: VecDeque<CheckOutcome>,
    pub total_checks: u64,
    pub up_count: u64,
    pub down_count: u64,
    pub uptime_percent: f64,
    pub last_status: Option<ProbeStatus>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_response_time: f64,
    pub avg_response_time: f64,
}

impl StatusRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            history: VecDeque::new(),
            total_checks: 0,
            up_count: 0,
            down_count: 0,
            uptime_percent: 0.0,
            last_status: None,
            last_checked: None,
            last_response_time: 0.0,
            avg_response_time: 0.0,
        }
    }

    /// Apply one outcome, evicting history beyond `history_limit`.
    pub fn apply(&mut self, outcome: CheckOutcome, history_limit: usize) {
        self.total_checks += 1;
        match outcome.status {
            ProbeStatus::Up => self.up_count += 1,
            ProbeStatus::Down => self.down_count += 1,
        }

        let is_newest = self
            .history
            .back()
            .map_or(true, |last| outcome.timestamp >= last.timestamp);

        if is_newest {
            self.last_status = Some(outcome.status);
            self.last_checked = Some(outcome.timestamp);
            self.last_response_time = outcome.response_time_ms;
            self.history.push_back(outcome);
        } else {
            // Late arrival from an overlapping probe: keep history ordered
            // and leave the last_* fields on the newer outcome.
            let position = self
                .history
                .iter()
                .position(|entry| entry.timestamp > outcome.timestamp)
                .unwrap_or(self.history.len());
            self.history.insert(position, outcome);
        }

        while self.history.len() > history_limit {
            self.history.pop_front();
        }

        self.recompute();
    }

    fn recompute(&mut self) {
        self.uptime_percent = if self.total_checks == 0 {
            0.0
        } else {
            round2(self.up_count as f64 / self.total_checks as f64 * 100.0)
        };

        let (sum, count) = self
            .history
            .iter()
            .filter(|entry| entry.is_up())
            .fold((0.0, 0u32), |(sum, count), entry| {
                (sum + entry.response_time_ms, count + 1)
            });

        self.avg_response_time = if count == 0 {
            0.0
        } else {
            round2(sum / count as f64)
        };
    }
}

/// Point-in-time view of one owner's targets and their statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub owner_id: OwnerId,
    pub generated_at: DateTime<Utc>,
    pub targets: Vec<Target>,
    /// Status keyed by target url
    pub status: BTreeMap<String, StatusRecord>,
}

/// Persisted state of a single owner
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OwnerDocument {
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub status: BTreeMap<String, StatusRecord>,
}

/// Stored account; the password is kept only as a bcrypt hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    pub password_hash: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
