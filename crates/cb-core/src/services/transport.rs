use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use crate::error::{OrchestratorError, Result};
use crate::models::ServerConfig;

/// Output of one command, before the pool adds timing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// A reusable command channel to one host.
#[async_trait]
pub trait Channel: Send {
    /// Run `command`, feeding `stdin` if given. `Err` means the channel itself failed.
    async fn run(&mut self, command: &str, stdin: Option<&[u8]>) -> Result<RawOutput>;

    fn is_alive(&self) -> bool {
        true
    }

    async fn close(&mut self) {}
}

/// Opens channels to fleet hosts.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, host: &str) -> Result<Box<dyn Channel>>;
}

fn connection_error(host: &str, reason: impl Into<String>) -> OrchestratorError {
    OrchestratorError::ExecConnection {
        host: host.to_string(),
        reason: reason.into(),
    }
}

fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

async fn collect(mut child: Child, stdin: Option<&[u8]>, host: &str) -> Result<RawOutput> {
    if let Some(data) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(data)
                .await
                .map_err(|e| connection_error(host, format!("writing stdin: {e}")))?;
            pipe.shutdown()
                .await
                .map_err(|e| connection_error(host, format!("closing stdin: {e}")))?;
        }
    }
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| connection_error(host, format!("waiting for command: {e}")))?;
    Ok(RawOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// Runs commands on the orchestrator machine itself.
pub struct LocalChannel {
    host: String,
}

#[async_trait]
impl Channel for LocalChannel {
    async fn run(&mut self, command: &str, stdin: Option<&[u8]>) -> Result<RawOutput> {
        let child = Command::new("sh")
            .args(["-c", command])
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| connection_error(&self.host, format!("failed to start sh: {e}")))?;
        collect(child, stdin, &self.host).await
    }
}

/// Channel backed by a dedicated OpenSSH control master.
pub struct SshChannel {
    server: ServerConfig,
    control_path: PathBuf,
    master: Child,
}

impl SshChannel {
    fn target(&self) -> String {
        format!("{}@{}", self.server.user, self.server.host)
    }
}

#[async_trait]
impl Channel for SshChannel {
    async fn run(&mut self, command: &str, stdin: Option<&[u8]>) -> Result<RawOutput> {
        let mut args = vec![
            "-S".to_string(),
            self.control_path.to_string_lossy().to_string(),
            "-o".to_string(),
            "ControlMaster=no".to_string(),
        ];
        if self.server.port != 22 {
            args.push("-p".into());
            args.push(self.server.port.to_string());
        }
        args.push(self.target());
        args.push("--".into());
        args.push(command.to_string());

        let child = Command::new("ssh")
            .args(&args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| connection_error(&self.server.host, format!("failed to start ssh: {e}")))?;

        let output = collect(child, stdin, &self.server.host).await?;
        // 255 is ssh's own failure code; only trust it as a command result while the master lives.
        if output.exit_code == 255 && !self.is_alive() {
            return Err(connection_error(
                &self.server.host,
                format!("control master exited: {}", output.stderr.trim()),
            ));
        }
        Ok(output)
    }

    fn is_alive(&self) -> bool {
        match self.master.id() {
            Some(pid) => is_pid_alive(pid),
            None => false,
        }
    }

    async fn close(&mut self) {
        let _ = self.master.kill().await;
        let _ = tokio::fs::remove_file(&self.control_path).await;
    }
}

#[cfg(unix)]
fn is_pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn is_pid_alive(_pid: u32) -> bool {
    true
}

/// Connects to registered servers over SSH, or locally for loopback hosts.
pub struct SshTransport {
    servers: HashMap<String, ServerConfig>,
    control_dir: PathBuf,
}

impl SshTransport {
    pub fn new(servers: HashMap<String, ServerConfig>, control_dir: &Path) -> Self {
        Self {
            servers,
            control_dir: control_dir.to_path_buf(),
        }
    }

    fn master_args(server: &ServerConfig, control_path: &Path) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(identity) = &server.identity_file {
            args.push("-i".to_string());
            args.push(identity.clone());
        }
        if server.port != 22 {
            args.push("-p".to_string());
            args.push(server.port.to_string());
        }
        for option in [
            "BatchMode=yes",
            "ConnectTimeout=10",
            "ServerAliveInterval=15",
            "ServerAliveCountMax=3",
            "ControlMaster=yes",
        ] {
            args.push("-o".to_string());
            args.push(option.to_string());
        }
        args.extend([
            "-M".to_string(),
            "-N".to_string(),
            "-S".to_string(),
            control_path.to_string_lossy().to_string(),
            format!("{}@{}", server.user, server.host),
        ]);
        args
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&self, host: &str) -> Result<Box<dyn Channel>> {
        let server = self
            .servers
            .get(host)
            .ok_or_else(|| connection_error(host, "server is not registered"))?;

        if is_local_host(&server.host) {
            return Ok(Box::new(LocalChannel {
                host: host.to_string(),
            }));
        }

        tokio::fs::create_dir_all(&self.control_dir)
            .await
            .map_err(|e| connection_error(host, format!("creating control dir: {e}")))?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        let control_path = self.control_dir.join(format!("{}.sock", &id[..12]));

        let mut master = Command::new("ssh")
            .args(Self::master_args(server, &control_path))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| connection_error(host, format!("failed to start ssh: {e}")))?;

        // The pool bounds this loop with its connect timeout.
        loop {
            if control_path.exists() {
                tracing::debug!(host, control_path = %control_path.display(), "ssh channel ready");
                return Ok(Box::new(SshChannel {
                    server: server.clone(),
                    control_path,
                    master,
                }));
            }
            if let Ok(Some(status)) = master.try_wait() {
                let mut stderr = String::new();
                if let Some(mut pipe) = master.stderr.take() {
                    use tokio::io::AsyncReadExt;
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                return Err(connection_error(
                    host,
                    format!("ssh exited with {status}: {}", stderr.trim()),
                ));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
