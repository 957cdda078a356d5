use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use super::project::{Environment, PortRange, Project};

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_grace_period_hours")]
    pub grace_period_hours: u64,
    /// Bounded wait for a busy registry. Absent means reject immediately.
    #[serde(default)]
    pub lock_wait_ms: Option<u64>,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_base_domain")]
    pub base_domain: String,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub paths: RemotePaths,
    #[serde(default = "default_port_ranges")]
    pub port_ranges: BTreeMap<Environment, PortRange>,
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
    #[serde(default)]
    pub projects: Vec<Project>,
}

impl PlatformConfig {
    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::hours(self.grace_period_hours as i64)
    }

    pub fn lock_wait(&self) -> Option<Duration> {
        self.lock_wait_ms.map(Duration::from_millis)
    }

    /// Reserved port range for a project in an environment.
    pub fn port_range(&self, project: &Project, environment: Environment) -> PortRange {
        project
            .port_ranges
            .get(&environment)
            .or_else(|| self.port_ranges.get(&environment))
            .copied()
            .unwrap_or_else(|| default_range(environment))
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            grace_period_hours: default_grace_period_hours(),
            lock_wait_ms: None,
            sweep_interval_secs: default_sweep_interval_secs(),
            base_domain: default_base_domain(),
            pool: PoolConfig::default(),
            health: HealthConfig::default(),
            paths: RemotePaths::default(),
            port_ranges: default_port_ranges(),
            servers: HashMap::new(),
            projects: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_channels")]
    pub max_channels_per_host: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_channels_per_host: default_max_channels(),
            idle_timeout_secs: default_idle_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_path")]
    pub path: String,
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_health_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_health_deadline_secs")]
    pub deadline_secs: u64,
    #[serde(default = "default_health_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            interval_ms: default_health_interval_ms(),
            max_attempts: default_health_attempts(),
            deadline_secs: default_health_deadline_secs(),
            request_timeout_secs: default_health_request_timeout_secs(),
        }
    }
}

/// Remote directories the platform is allowed to touch.
#[derive(Debug, Clone, Deserialize)]
pub struct RemotePaths {
    #[serde(default = "default_deploy_root")]
    pub deploy_root: PathBuf,
    #[serde(default = "default_quadlet_dir")]
    pub quadlet_dir: PathBuf,
    #[serde(default = "default_proxy_sites_dir")]
    pub proxy_sites_dir: PathBuf,
    #[serde(default = "default_proxy_main_config")]
    pub proxy_main_config: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl RemotePaths {
    pub fn allowed_roots(&self) -> Vec<PathBuf> {
        let mut roots = vec![
            self.deploy_root.clone(),
            self.quadlet_dir.clone(),
            self.proxy_sites_dir.clone(),
            self.log_dir.clone(),
        ];
        if let Some(parent) = self.proxy_main_config.parent() {
            roots.push(parent.to_path_buf());
        }
        roots
    }
}

impl Default for RemotePaths {
    fn default() -> Self {
        Self {
            deploy_root: default_deploy_root(),
            quadlet_dir: default_quadlet_dir(),
            proxy_sites_dir: default_proxy_sites_dir(),
            proxy_main_config: default_proxy_main_config(),
            log_dir: default_log_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub identity_file: Option<String>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".codeb")
}
fn default_grace_period_hours() -> u64 {
    48
}
fn default_sweep_interval_secs() -> u64 {
    300
}
fn default_base_domain() -> String {
    "apps.localhost".into()
}
fn default_max_channels() -> usize {
    5
}
fn default_idle_timeout_secs() -> u64 {
    60
}
fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_command_timeout_secs() -> u64 {
    120
}
fn default_health_path() -> String {
    "/health".into()
}
fn default_health_interval_ms() -> u64 {
    2000
}
fn default_health_attempts() -> u32 {
    30
}
fn default_health_deadline_secs() -> u64 {
    90
}
fn default_health_request_timeout_secs() -> u64 {
    5
}
fn default_deploy_root() -> PathBuf {
    PathBuf::from("/opt/codeb/projects")
}
fn default_quadlet_dir() -> PathBuf {
    PathBuf::from("/etc/containers/systemd")
}
fn default_proxy_sites_dir() -> PathBuf {
    PathBuf::from("/etc/caddy/sites")
}
fn default_proxy_main_config() -> PathBuf {
    PathBuf::from("/etc/caddy/Caddyfile")
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/codeb")
}
fn default_ssh_user() -> String {
    "root".into()
}
fn default_ssh_port() -> u16 {
    22
}

fn default_range(environment: Environment) -> PortRange {
    match environment {
        Environment::Staging => PortRange::new(3000, 3499),
        Environment::Production => PortRange::new(4000, 4499),
        Environment::Preview => PortRange::new(5000, 5499),
    }
}

fn default_port_ranges() -> BTreeMap<Environment, PortRange> {
    [
        Environment::Staging,
        Environment::Production,
        Environment::Preview,
    ]
    .into_iter()
    .map(|e| (e, default_range(e)))
    .collect()
}
