use log::{debug, info};
use std::path::Path;
use tokio::net::TcpStream;
use tokio::time::{Duration, Instant};

use crate::capability::LaunchSpec;
use crate::domain::{HealthCheckSpec, HealthStatus, ProbeKind};

/// Upper bound on a single probe; the overall deadline may cut it shorter
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs readiness probes against a started service
#[derive(Debug, Clone)]
pub struct HealthChecker {
    client: reqwest::Client,
}

impl HealthChecker {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    /// One probe attempt
    pub async fn probe(&self, spec: &HealthCheckSpec, cwd: &Path) -> HealthStatus {
        match spec.probe {
            ProbeKind::Http => match self.client.get(&spec.target).send().await {
                Ok(response) if response.status().is_success() => HealthStatus::Healthy,
                Ok(response) => HealthStatus::Unhealthy {
                    reason: format!("{} returned HTTP {}", spec.target, response.status()),
                },
                Err(e) => HealthStatus::Unhealthy {
                    reason: format!("GET {} failed: {e}", spec.target),
                },
            },
            ProbeKind::Tcp => match TcpStream::connect(spec.target.as_str()).await {
                Ok(_) => HealthStatus::Healthy,
                Err(e) => HealthStatus::Unhealthy {
                    reason: format!("connect to {} failed: {e}", spec.target),
                },
            },
            ProbeKind::Command => match LaunchSpec::shell(&spec.target, cwd).run().await {
                Ok(()) => HealthStatus::Healthy,
                Err(e) => HealthStatus::Unhealthy {
                    reason: e.to_string(),
                },
            },
        }
    }

    /// Poll until healthy, the timeout elapses, or attempts run out.
    /// A service without a probe is healthy as soon as it is asked.
    pub async fn wait_until_healthy(
        &self,
        service: &str,
        spec: Option<&HealthCheckSpec>,
        cwd: &Path,
    ) -> HealthStatus {
        let Some(spec) = spec else {
            return HealthStatus::Healthy;
        };

        let deadline = Instant::now() + spec.timeout();
        let max_attempts = spec.max_attempts.max(1);
        let mut last_reason = String::from("no probe completed");

        for attempt in 1..=max_attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining.min(PROBE_TIMEOUT), self.probe(spec, cwd)).await {
                Ok(HealthStatus::Healthy) => {
                    info!("Service '{}' is healthy after {} attempt(s)", service, attempt);
                    return HealthStatus::Healthy;
                }
                Ok(HealthStatus::Unhealthy { reason }) => last_reason = reason,
                Err(_) => last_reason = format!("probe of {} timed out", spec.target),
            }
            debug!(
                "Health probe {}/{} for '{}' failed: {}",
                attempt, max_attempts, service, last_reason
            );

            if attempt < max_attempts {
                let now = Instant::now();
                if now + spec.interval() >= deadline {
                    tokio::time::sleep_until(deadline).await;
                    break;
                }
                tokio::time::sleep(spec.interval()).await;
            }
        }

        HealthStatus::Unhealthy { reason: last_reason }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}
