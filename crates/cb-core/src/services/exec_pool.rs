use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Semaphore;

use super::path_guard::PathGuard;
use super::transport::{Channel, Transport};
use crate::error::{OrchestratorError, Result};
use crate::models::PoolConfig;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

struct IdleChannel {
    channel: Box<dyn Channel>,
    idle_since: Instant,
}

struct HostPool {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleChannel>>,
}

/// Quote a value for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Bounded set of reusable command channels per host.
///
/// Every command is checked against the [`PathGuard`] before a channel is touched.
/// Failures are not retried here; callers own their retry policy.
pub struct RemoteExecutionPool {
    transport: Arc<dyn Transport>,
    guard: PathGuard,
    config: PoolConfig,
    hosts: Mutex<HashMap<String, Arc<HostPool>>>,
}

impl RemoteExecutionPool {
    pub fn new(transport: Arc<dyn Transport>, guard: PathGuard, config: PoolConfig) -> Self {
        Self {
            transport,
            guard,
            config,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Default per-command timeout from the pool config.
    pub fn command_timeout(&self) -> Duration {
        self.config.command_timeout()
    }

    pub async fn exec(&self, host: &str, command: &str, timeout: Duration) -> Result<ExecOutput> {
        self.guard.check_command(command)?;
        self.run(host, command, None, timeout).await
    }

    /// Like [`exec`](Self::exec) but a non-zero exit becomes [`OrchestratorError::RemoteCommand`].
    pub async fn exec_checked(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let output = self.exec(host, command, timeout).await?;
        if !output.success() {
            return Err(OrchestratorError::RemoteCommand {
                host: host.to_string(),
                command: command.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Write `content` to `path` by streaming it through the channel's stdin.
    pub async fn write_file(
        &self,
        host: &str,
        path: &str,
        content: &str,
        timeout: Duration,
    ) -> Result<()> {
        self.guard.check_path(path)?;
        let command = format!("cat > {}", shell_quote(path));
        let output = self
            .run(host, &command, Some(content.as_bytes()), timeout)
            .await?;
        if !output.success() {
            return Err(OrchestratorError::RemoteCommand {
                host: host.to_string(),
                command,
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    /// Read a remote file, or `None` if it does not exist.
    pub async fn read_file(
        &self,
        host: &str,
        path: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        self.guard.check_path(path)?;
        let quoted = shell_quote(path);
        let command = format!("if [ -f {quoted} ]; then cat {quoted}; else exit 3; fi");
        let output = self.run(host, &command, None, timeout).await?;
        match output.exit_code {
            0 => Ok(Some(output.stdout)),
            3 => Ok(None),
            code => Err(OrchestratorError::RemoteCommand {
                host: host.to_string(),
                command,
                exit_code: code,
                stderr: output.stderr.trim().to_string(),
            }),
        }
    }

    pub async fn remove_file(&self, host: &str, path: &str, timeout: Duration) -> Result<()> {
        self.guard.check_path(path)?;
        let command = format!("rm -f {}", shell_quote(path));
        self.exec_checked(host, &command, timeout).await?;
        Ok(())
    }

    fn host_pool(&self, host: &str) -> Arc<HostPool> {
        let mut hosts = self.hosts.lock().unwrap();
        hosts
            .entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(HostPool {
                    permits: Arc::new(Semaphore::new(self.config.max_channels_per_host.max(1))),
                    idle: Mutex::new(Vec::new()),
                })
            })
            .clone()
    }

    async fn take_idle(&self, pool: &HostPool) -> Option<Box<dyn Channel>> {
        let idle_timeout = self.config.idle_timeout();
        let mut stale = Vec::new();
        let found = {
            let mut idle = pool.idle.lock().unwrap();
            let mut found = None;
            while let Some(entry) = idle.pop() {
                if entry.idle_since.elapsed() < idle_timeout && entry.channel.is_alive() {
                    found = Some(entry.channel);
                    break;
                }
                stale.push(entry.channel);
            }
            found
        };
        for mut channel in stale {
            channel.close().await;
        }
        found
    }

    async fn run(
        &self,
        host: &str,
        command: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let pool = self.host_pool(host);
        let connect_timeout = self.config.connect_timeout();

        let _permit = tokio::time::timeout(connect_timeout, pool.permits.clone().acquire_owned())
            .await
            .map_err(|_| OrchestratorError::ExecConnection {
                host: host.to_string(),
                reason: format!(
                    "all {} channels busy for {}s",
                    self.config.max_channels_per_host,
                    connect_timeout.as_secs()
                ),
            })?
            .map_err(|_| OrchestratorError::ExecConnection {
                host: host.to_string(),
                reason: "pool is closed".into(),
            })?;

        let mut channel = match self.take_idle(&pool).await {
            Some(channel) => channel,
            None => tokio::time::timeout(connect_timeout, self.transport.connect(host))
                .await
                .map_err(|_| OrchestratorError::ExecConnection {
                    host: host.to_string(),
                    reason: format!("connect timed out after {}s", connect_timeout.as_secs()),
                })??,
        };

        tracing::debug!(host, command, "exec");
        let started = Instant::now();
        match tokio::time::timeout(timeout, channel.run(command, stdin)).await {
            Err(_) => {
                channel.close().await;
                Err(OrchestratorError::ExecTimeout {
                    host: host.to_string(),
                    command: command.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Ok(Err(e)) => {
                channel.close().await;
                Err(e)
            }
            Ok(Ok(raw)) => {
                pool.idle.lock().unwrap().push(IdleChannel {
                    channel,
                    idle_since: Instant::now(),
                });
                Ok(ExecOutput {
                    stdout: raw.stdout,
                    stderr: raw.stderr,
                    exit_code: raw.exit_code,
                    duration_ms: started.elapsed().as_millis() as u64,
                })
            }
        }
    }

    /// Close channels idle longer than the idle timeout. Returns how many were closed.
    pub async fn reap_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout();
        let pools: Vec<Arc<HostPool>> = self.hosts.lock().unwrap().values().cloned().collect();
        let mut expired = Vec::new();
        for pool in pools {
            let mut idle = pool.idle.lock().unwrap();
            let (keep, stale): (Vec<_>, Vec<_>) = idle
                .drain(..)
                .partition(|e| e.idle_since.elapsed() < idle_timeout && e.channel.is_alive());
            *idle = keep;
            expired.extend(stale.into_iter().map(|e| e.channel));
        }
        let count = expired.len();
        for mut channel in expired {
            channel.close().await;
        }
        if count > 0 {
            tracing::debug!(count, "closed idle channels");
        }
        count
    }

    pub async fn close_all(&self) {
        let pools: Vec<Arc<HostPool>> = self.hosts.lock().unwrap().drain().map(|(_, p)| p).collect();
        for pool in pools {
            let channels: Vec<IdleChannel> = pool.idle.lock().unwrap().drain(..).collect();
            for mut entry in channels {
                entry.channel.close().await;
            }
        }
    }

    pub fn idle_count(&self, host: &str) -> usize {
        self.hosts
            .lock()
            .unwrap()
            .get(host)
            .map(|p| p.idle.lock().unwrap().len())
            .unwrap_or(0)
    }
}
