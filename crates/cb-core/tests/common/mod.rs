// Each test binary compiles this module independently and uses a different
// subset of helpers, so unused-function warnings are expected.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use cb_core::error::{OrchestratorError, Result};
use cb_core::models::{
    AuthContext, DeploymentRecord, Environment, HealthConfig, PlatformConfig, Project,
    ProjectType, Role, ServerConfig, SlotRegistry,
};
use cb_core::services::deploy::{DeployRequest, DeployResult};
use cb_core::services::dispatch::{
    Operation, OperationOutcome, Platform, RollbackRequest, SlotTarget,
};
use cb_core::services::history::JsonlDeploymentLog;
use cb_core::services::promote::PromoteResult;
use cb_core::services::rollback::RollbackResult;
use cb_core::services::transport::{Channel, RawOutput, Transport};

pub const SERVER_ID: &str = "app-1";
pub const SERVER_HOST: &str = "10.0.0.5";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeContainer {
    pub port: u16,
    pub version: String,
    /// `cb.project` label; `None` for containers the platform did not create.
    pub project: Option<String>,
}

/// Everything the simulated host knows about.
#[derive(Debug, Default)]
pub struct HostState {
    pub files: BTreeMap<String, String>,
    pub containers: BTreeMap<String, FakeContainer>,
    /// Sockets held by processes the platform does not manage.
    pub foreign_listeners: BTreeSet<u16>,
    /// Containers running one of these versions answer 503 on every probe.
    pub unhealthy_versions: BTreeSet<String>,
    pub fail_start: bool,
    pub fail_validate: bool,
    pub fail_reload: bool,
    pub fail_teardown: bool,
    pub reloads: usize,
    pub commands: Vec<String>,
}

impl HostState {
    /// Port the live routing unit for `scope` points at, if any.
    pub fn routed_port(&self, scope: &str) -> Option<u16> {
        let suffix = format!("/{scope}.caddy");
        let unit = self
            .files
            .iter()
            .find(|(path, _)| path.ends_with(&suffix))
            .map(|(_, content)| content)?;
        let (_, rest) = unit.split_once("reverse_proxy 127.0.0.1:")?;
        rest.lines().next()?.trim().parse().ok()
    }

    fn unit_for(&self, container: &str) -> Option<&String> {
        let suffix = format!("/{container}.container");
        self.files
            .iter()
            .find(|(path, _)| path.ends_with(&suffix))
            .map(|(_, content)| content)
    }
}

/// In-memory fleet that understands the handful of commands the platform issues.
#[derive(Clone, Default)]
pub struct FakeFleet {
    state: Arc<Mutex<HostState>>,
}

impl FakeFleet {
    pub fn with<R>(&self, f: impl FnOnce(&mut HostState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn commands_matching(&self, prefix: &str) -> usize {
        self.with(|s| s.commands.iter().filter(|c| c.starts_with(prefix)).count())
    }
}

#[async_trait]
impl Transport for FakeFleet {
    async fn connect(&self, host: &str) -> Result<Box<dyn Channel>> {
        if host != SERVER_ID {
            return Err(OrchestratorError::ExecConnection {
                host: host.to_string(),
                reason: "unknown host".into(),
            });
        }
        Ok(Box::new(FakeChannel {
            state: self.state.clone(),
        }))
    }
}

struct FakeChannel {
    state: Arc<Mutex<HostState>>,
}

fn unquote(value: &str) -> String {
    value.trim().trim_matches('\'').to_string()
}

fn ok(stdout: impl Into<String>) -> RawOutput {
    RawOutput {
        stdout: stdout.into(),
        stderr: String::new(),
        exit_code: 0,
    }
}

fn fail(code: i32, stderr: &str) -> RawOutput {
    RawOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code: code,
    }
}

fn parse_unit(unit: &str) -> Option<FakeContainer> {
    let mut port = None;
    let mut version = None;
    let mut project = None;
    for line in unit.lines() {
        if let Some(rest) = line.strip_prefix("PublishPort=") {
            port = rest.split(':').next().and_then(|p| p.parse().ok());
        }
        if let Some(rest) = line.strip_prefix("Environment=CB_VERSION=") {
            version = Some(rest.trim_matches('"').to_string());
        }
        if let Some(rest) = line.strip_prefix("Label=cb.project=") {
            project = Some(rest.to_string());
        }
    }
    Some(FakeContainer {
        port: port?,
        version: version?,
        project,
    })
}

impl FakeChannel {
    fn handle(&self, command: &str, stdin: Option<&[u8]>) -> RawOutput {
        let mut state = self.state.lock().unwrap();
        state.commands.push(command.to_string());

        if let Some(path) = command.strip_prefix("cat > ") {
            let content = String::from_utf8_lossy(stdin.unwrap_or_default()).to_string();
            state.files.insert(unquote(path), content);
            return ok("");
        }
        if let Some(rest) = command.strip_prefix("if [ -f ") {
            let path = unquote(rest.split(" ]").next().unwrap_or_default());
            return match state.files.get(&path) {
                Some(content) => ok(content.clone()),
                None => fail(3, ""),
            };
        }
        if let Some(path) = command.strip_prefix("rm -f ") {
            state.files.remove(&unquote(path));
            return ok("");
        }
        if command == "systemctl daemon-reload" {
            return ok("");
        }
        if let Some(rest) = command.strip_prefix("systemctl restart ") {
            if state.fail_start {
                return fail(1, "Job for unit failed because the control process exited");
            }
            let service = unquote(rest);
            let name = service.trim_end_matches(".service").to_string();
            let Some(container) = state.unit_for(&name).and_then(|u| parse_unit(u)) else {
                return fail(5, "Unit not found.");
            };
            state.containers.insert(name, container);
            return ok("");
        }
        if let Some(rest) = command.strip_prefix("systemctl stop ") {
            if state.fail_teardown {
                return fail(1, "Failed to stop unit: Transport endpoint is not connected");
            }
            let service = unquote(rest.trim_end_matches("|| true"));
            state.containers.remove(service.trim_end_matches(".service"));
            return ok("");
        }
        if let Some(rest) = command.strip_prefix("podman ps -a --filter publish=") {
            let port: u16 = rest
                .split_whitespace()
                .next()
                .and_then(|p| p.parse().ok())
                .unwrap_or_default();
            let lines: Vec<String> = state
                .containers
                .iter()
                .filter(|(_, c)| c.port == port)
                .map(|(n, c)| match &c.project {
                    Some(project) => format!("{n} {project}"),
                    None => format!("{n} <no value>"),
                })
                .collect();
            return ok(lines.join("\n"));
        }
        if command.starts_with("podman ps -a --format") {
            let lines: Vec<String> = state
                .containers
                .values()
                .map(|c| format!("0.0.0.0:{}->3000/tcp", c.port))
                .collect();
            return ok(lines.join("\n"));
        }
        if let Some(rest) = command.strip_prefix("podman rm -f --ignore ") {
            state.containers.remove(&unquote(rest));
            return ok("");
        }
        if command == "ss -tlnH" {
            let ports: BTreeSet<u16> = state
                .containers
                .values()
                .map(|c| c.port)
                .chain(state.foreign_listeners.iter().copied())
                .collect();
            let lines: Vec<String> = ports
                .iter()
                .map(|p| format!("LISTEN 0      4096         0.0.0.0:{p}        0.0.0.0:*"))
                .collect();
            return ok(lines.join("\n"));
        }
        if command.starts_with("caddy validate") {
            if state.fail_validate {
                return fail(1, "Error: adapting config using caddyfile: unrecognized directive");
            }
            return ok("Valid configuration");
        }
        if command.starts_with("caddy reload") {
            if state.fail_reload {
                return fail(1, "Error: sending configuration to instance: connection refused");
            }
            state.reloads += 1;
            return ok("");
        }
        if command.starts_with("curl ") {
            let port: Option<u16> = command
                .split("127.0.0.1:")
                .nth(1)
                .and_then(|rest| rest.split('/').next())
                .and_then(|p| p.parse().ok());
            let container = state.containers.values().find(|c| Some(c.port) == port);
            return match container {
                Some(c) if state.unhealthy_versions.contains(&c.version) => {
                    ok("service unavailable\n503")
                }
                Some(_) => ok("{\"status\":\"ok\"}\n200"),
                None => RawOutput {
                    stdout: "\n000".into(),
                    stderr: String::new(),
                    exit_code: 7,
                },
            };
        }
        fail(127, &format!("sh: unknown command: {command}"))
    }
}

#[async_trait]
impl Channel for FakeChannel {
    async fn run(&mut self, command: &str, stdin: Option<&[u8]>) -> Result<RawOutput> {
        tokio::task::yield_now().await;
        Ok(self.handle(command, stdin))
    }
}

pub fn project(name: &str) -> Project {
    Project {
        name: name.into(),
        team: "core".into(),
        project_type: ProjectType::Nextjs,
        server: SERVER_ID.into(),
        container_port: 3000,
        port_ranges: Default::default(),
        env: Default::default(),
        datastores: Vec::new(),
    }
}

pub fn config(state_dir: &Path) -> PlatformConfig {
    let mut config = PlatformConfig {
        state_dir: state_dir.to_path_buf(),
        base_domain: "apps.example.com".into(),
        health: HealthConfig {
            path: "/health".into(),
            interval_ms: 5,
            max_attempts: 3,
            deadline_secs: 5,
            request_timeout_secs: 1,
        },
        projects: vec![project("demo"), project("other")],
        ..PlatformConfig::default()
    };
    config.servers.insert(
        SERVER_ID.into(),
        ServerConfig {
            host: SERVER_HOST.into(),
            user: "deploy".into(),
            port: 22,
            identity_file: None,
        },
    );
    config
}

pub fn auth(role: Role) -> AuthContext {
    AuthContext {
        team: "core".into(),
        role,
        actor: "ci".into(),
        allowed_projects: Default::default(),
    }
}

pub struct Harness {
    pub platform: Platform,
    pub fleet: FakeFleet,
    pub auth: AuthContext,
    pub dir: TempDir,
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

pub fn harness_with(adjust: impl FnOnce(&mut PlatformConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    adjust(&mut config);
    let fleet = FakeFleet::default();
    let sink = Arc::new(JsonlDeploymentLog::new(dir.path()));
    let platform = Platform::new(config, Arc::new(fleet.clone()), sink).unwrap();
    Harness {
        platform,
        fleet,
        auth: auth(Role::Member),
        dir,
    }
}

impl Harness {
    pub async fn deploy(&self, project: &str, env: Environment, version: &str) -> Result<DeployResult> {
        let op = Operation::Deploy(DeployRequest {
            project_name: project.into(),
            environment: env,
            version: Some(version.into()),
            image: Some(format!("img:{version}")),
        });
        match self.platform.execute(&self.auth, op).await? {
            OperationOutcome::Deploy(result) => Ok(result),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    pub async fn promote(&self, project: &str, env: Environment) -> Result<PromoteResult> {
        let op = Operation::Promote(SlotTarget {
            project_name: project.into(),
            environment: env,
        });
        match self.platform.execute(&self.auth, op).await? {
            OperationOutcome::Promote(result) => Ok(result),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    pub async fn rollback(&self, project: &str, env: Environment) -> Result<RollbackResult> {
        let op = Operation::Rollback(RollbackRequest {
            project_name: project.into(),
            environment: env,
            reason: Some("bad release".into()),
        });
        match self.platform.execute(&self.auth, op).await? {
            OperationOutcome::Rollback(result) => Ok(result),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    pub async fn status(&self, project: &str, env: Environment) -> SlotRegistry {
        let op = Operation::Status(SlotTarget {
            project_name: project.into(),
            environment: env,
        });
        match self.platform.execute(&self.auth, op).await.unwrap() {
            OperationOutcome::Status(registry) => registry,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    pub async fn history(&self) -> Vec<DeploymentRecord> {
        JsonlDeploymentLog::new(self.dir.path())
            .recent(1000)
            .await
            .unwrap()
    }
}
