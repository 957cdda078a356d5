use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::exec_pool::RemoteExecutionPool;
use crate::models::{HealthConfig, HealthStatus};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

/// Map an HTTP status code (`000` when curl could not connect) to a health status.
pub fn classify(http_code: u16) -> HealthStatus {
    match http_code {
        200..=299 => HealthStatus::Healthy,
        429 | 503 => HealthStatus::Degraded,
        _ => HealthStatus::Unhealthy,
    }
}

/// Polls a container's health endpoint from the host it runs on.
pub struct HealthChecker {
    pool: Arc<RemoteExecutionPool>,
    config: HealthConfig,
}

impl HealthChecker {
    pub fn new(pool: Arc<RemoteExecutionPool>, config: HealthConfig) -> Self {
        Self { pool, config }
    }

    fn probe_command(&self, port: u16) -> String {
        format!(
            "curl -s -w '\\n%{{http_code}}' --max-time {} http://127.0.0.1:{port}{}",
            self.config.request_timeout_secs, self.config.path
        )
    }

    /// One probe. Never fails: transport errors are reported as `Unknown`.
    pub async fn probe(&self, host: &str, port: u16) -> HealthStatus {
        let timeout = Duration::from_secs(self.config.request_timeout_secs + 5);
        match self.pool.exec(host, &self.probe_command(port), timeout).await {
            Ok(output) => {
                let code = output
                    .stdout
                    .lines()
                    .last()
                    .and_then(|l| l.trim().parse::<u16>().ok())
                    .unwrap_or(0);
                classify(code)
            }
            Err(e) => {
                tracing::debug!(host, port, error = %e, "health probe failed");
                HealthStatus::Unknown
            }
        }
    }

    /// Poll at a fixed interval until healthy, out of attempts, or past the deadline.
    pub async fn wait_until_healthy(&self, host: &str, port: u16) -> HealthReport {
        let started = Instant::now();
        let deadline = Duration::from_secs(self.config.deadline_secs);
        let interval = Duration::from_millis(self.config.interval_ms);
        let mut attempts = 0;
        let mut status = HealthStatus::Unknown;

        while attempts < self.config.max_attempts.max(1) {
            attempts += 1;
            status = self.probe(host, port).await;
            if status == HealthStatus::Healthy {
                break;
            }
            tracing::debug!(host, port, attempts, %status, "not healthy yet");
            if started.elapsed() + interval >= deadline {
                break;
            }
            tokio::time::sleep(interval).await;
        }

        HealthReport {
            status,
            attempts,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}
