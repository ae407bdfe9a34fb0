//! Multi-tenant website uptime monitor.
//!
//! Owners register HTTP(S) targets with a check interval. A single scheduling
//! loop probes due targets, folds every outcome into a bounded per-target
//! status record and persists it; owners read snapshots or subscribe to
//! periodic updates.

pub mod config;
pub mod errors;
pub mod metrics;
pub mod models;
pub mod monitoring;
pub mod retry;
pub mod security;
pub mod service;
pub mod storage;

pub use config::Config;
pub use errors::{create_error_response, AuthError, MonitorError, MonitorResult, StorageError};
pub use models::{CheckOutcome, ProbeStatus, Snapshot, StatusRecord, Target, TargetKey};
pub use service::UptimeMonitor;
