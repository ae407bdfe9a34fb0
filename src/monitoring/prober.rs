use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::models::{CheckOutcome, Target};

/// Default timeout for a single health check
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Performs one health check against one target.
///
/// Implementations must never fail: every failure mode is folded into a
/// down [`CheckOutcome`]. They must not touch shared monitor state.
pub trait Prober: Send + Sync {
    fn probe<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, CheckOutcome>;
}

/// Prober issuing a plain GET with a fixed timeout
#[derive(Clone)]
pub struct HttpProber {
    client: Client,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(timeout: Duration, user_agent: &str) -> reqwest::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client, timeout })
    }

    async fn check(&self, target: &Target) -> CheckOutcome {
        let start = Instant::now();
        let result = self.client.get(&target.url).timeout(self.timeout).send().await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let outcome = match result {
            // Only an exact 200 counts as up, other 2xx codes are down.
            Ok(response) if response.status() == StatusCode::OK => CheckOutcome::up(elapsed_ms),
            Ok(response) => {
                let status = response.status();
                CheckOutcome::down(format!("HTTP {}", status)).with_http_status(status.as_u16())
            }
            Err(e) => CheckOutcome::down(self.describe_error(&e)),
        };

        if outcome.is_up() {
            debug!("{} is up ({}ms)", target.url, outcome.response_time_ms);
        } else {
            warn!(
                "Error checking {}: {}",
                target.url,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }

        outcome
    }

    fn describe_error(&self, error: &reqwest::Error) -> String {
        if error.is_timeout() {
            format!("request timed out after {}s", self.timeout.as_secs())
        } else if error.is_connect() {
            format!("connection failed: {}", error)
        } else if error.is_redirect() {
            format!("redirect error: {}", error)
        } else {
            error.to_string()
        }
    }
}

impl Prober for HttpProber {
    fn probe<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, CheckOutcome> {
        Box::pin(self.check(target))
    }
}
