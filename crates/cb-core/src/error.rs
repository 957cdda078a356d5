use std::path::PathBuf;

use crate::models::{Environment, HealthStatus, SlotColor};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("command on {host} timed out after {timeout_ms}ms: {command}")]
    ExecTimeout {
        host: String,
        command: String,
        timeout_ms: u64,
    },

    #[error("no channel to {host}: {reason}")]
    ExecConnection { host: String, reason: String },

    #[error("path '{path}' rejected: {reason}")]
    ExecPathRejected { path: String, reason: String },

    #[error("command on {host} failed (exit {exit_code}): {command}: {stderr}")]
    RemoteCommand {
        host: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("another operation is already running for {project}/{environment}")]
    ConcurrentOperationInProgress {
        project: String,
        environment: Environment,
    },

    #[error("timed out after {waited_ms}ms waiting for the {project}/{environment} lock")]
    LockTimeout {
        project: String,
        environment: Environment,
        waited_ms: u64,
    },

    #[error(
        "health check failed for slot {slot} (port {port}, version {version}) after {attempts} attempts: last status {status}"
    )]
    HealthCheckFailed {
        slot: SlotColor,
        port: u16,
        version: String,
        attempts: u32,
        status: HealthStatus,
    },

    #[error("no deployed slot to promote for {project}/{environment}")]
    NoDeployedSlot {
        project: String,
        environment: Environment,
    },

    #[error("no slot within its grace window for {project}/{environment}")]
    NoGraceSlot {
        project: String,
        environment: Environment,
    },

    #[error("proxy reload failed for {unit} (port {port}): {reason}")]
    ProxyReloadFailed {
        unit: String,
        port: u16,
        reason: String,
    },

    #[error("proxy config for {unit} is invalid: {reason}")]
    ConfigInvalid { unit: String, reason: String },

    #[error("project '{0}' not found")]
    ProjectNotFound(String),

    #[error("not allowed to operate on '{project}': {reason}")]
    Forbidden { project: String, reason: String },

    #[error("invalid name '{0}'")]
    InvalidName(String),

    #[error("invalid {field} {value:?}: only letters, digits and . _ : / @ - are allowed")]
    InvalidReference { field: &'static str, value: String },

    #[error("port allocation failed: {0}")]
    PortAllocation(String),

    #[error("config file not found at {0}")]
    ConfigNotFound(PathBuf),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("state persistence failed: {0}")]
    State(String),

    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl OrchestratorError {
    /// Stable identifier for callers that match on error kinds across a process boundary.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ExecTimeout { .. } => "EXEC_TIMEOUT",
            Self::ExecConnection { .. } => "EXEC_CONNECTION_ERROR",
            Self::ExecPathRejected { .. } => "EXEC_PATH_REJECTED",
            Self::RemoteCommand { .. } => "REMOTE_COMMAND_FAILED",
            Self::ConcurrentOperationInProgress { .. } => "CONCURRENT_OPERATION_IN_PROGRESS",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::HealthCheckFailed { .. } => "HEALTH_CHECK_FAILED",
            Self::NoDeployedSlot { .. } => "NO_DEPLOYED_SLOT",
            Self::NoGraceSlot { .. } => "NO_GRACE_SLOT",
            Self::ProxyReloadFailed { .. } => "PROXY_RELOAD_FAILED",
            Self::ConfigInvalid { .. } => "CONFIG_INVALID",
            Self::ProjectNotFound(_) => "PROJECT_NOT_FOUND",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::InvalidName(_) => "INVALID_NAME",
            Self::InvalidReference { .. } => "INVALID_REFERENCE",
            Self::PortAllocation(_) => "PORT_ALLOCATION_FAILED",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::State(_) => "STATE_ERROR",
            Self::UnknownOperation(_) => "UNKNOWN_OPERATION",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Yaml(_) => "YAML_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
