use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

use crate::models::CheckOutcome;

/// Latency samples kept for percentile calculations
const LATENCY_WINDOW: usize = 1000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorStats {
    pub total_probes: u64,
    pub up_probes: u64,
    pub down_probes: u64,
    pub persistence_failures: u64,
    pub ticks: u64,
    pub last_tick_duration_ms: u64,
    pub average_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub uptime_seconds: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total_probes: u64,
    up_probes: u64,
    down_probes: u64,
    persistence_failures: u64,
    ticks: u64,
    last_tick_duration_ms: u64,
}

/// Process-wide counters for probes, ticks and persistence
pub struct MetricsCollector {
    counters: Arc<RwLock<Counters>>,
    latencies: Arc<RwLock<VecDeque<f64>>>,
    start_time: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(RwLock::new(Counters::default())),
            latencies: Arc::new(RwLock::new(VecDeque::with_capacity(LATENCY_WINDOW))),
            start_time: Instant::now(),
        }
    }

    pub async fn record_probe(&self, url: &str, outcome: &CheckOutcome) {
        {
            let mut counters = self.counters.write().await;
            counters.total_probes += 1;
            if outcome.is_up() {
                counters.up_probes += 1;
            } else {
                counters.down_probes += 1;
            }
        }

        if outcome.is_up() {
            let mut latencies = self.latencies.write().await;
            latencies.push_back(outcome.response_time_ms);
            if latencies.len() > LATENCY_WINDOW {
                latencies.pop_front();
            }
        }

        debug!(
            "Probe recorded: {} {} ({}ms)",
            url, outcome.status, outcome.response_time_ms
        );
    }

    pub async fn record_tick(&self, duration: Duration) {
        let mut counters = self.counters.write().await;
        counters.ticks += 1;
        counters.last_tick_duration_ms = duration.as_millis() as u64;
    }

    pub async fn record_persistence_failure(&self) {
        self.counters.write().await.persistence_failures += 1;
    }

    pub async fn get_stats(&self) -> MonitorStats {
        let counters = self.counters.read().await;
        let latencies = self.latencies.read().await;

        let average_latency_ms = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };

        let mut sorted: Vec<f64> = latencies.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let p95_latency_ms = if sorted.is_empty() {
            0.0
        } else {
            let idx = ((sorted.len() as f64 * 0.95) as usize).min(sorted.len() - 1);
            sorted[idx]
        };

        MonitorStats {
            total_probes: counters.total_probes,
            up_probes: counters.up_probes,
            down_probes: counters.down_probes,
            persistence_failures: counters.persistence_failures,
            ticks: counters.ticks,
            last_tick_duration_ms: counters.last_tick_duration_ms,
            average_latency_ms,
            p95_latency_ms,
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
