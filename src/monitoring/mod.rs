pub mod aggregator;
pub mod persistence;
pub mod prober;
pub mod registry;
pub mod scheduler;
pub mod snapshot;

// Re-export key types for convenience
pub use aggregator::StatusAggregator;
pub use persistence::Persister;
pub use prober::{HttpProber, Prober, DEFAULT_PROBE_TIMEOUT};
pub use registry::{validate_url, TargetRegistry};
pub use scheduler::{Scheduler, SchedulerState};
pub use snapshot::{forward, SubscriptionHub};
