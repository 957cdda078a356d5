use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]{0,62}$").unwrap());

static REFERENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:/@-]{0,254}$").unwrap());

/// Validate a project or server name used in registry keys, unit names and remote paths.
pub fn validate_name(name: &str) -> Result<()> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidName(name.to_string()))
    }
}

/// Validate a caller-supplied image reference or version tag.
///
/// Both end up verbatim in container units and routing files, so only a plain
/// registry charset is accepted.
pub fn validate_reference(field: &'static str, value: &str) -> Result<()> {
    if REFERENCE_RE.is_match(value) {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidReference {
            field,
            value: value.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum Environment {
    Staging,
    Production,
    Preview,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Production => "production",
            Self::Preview => "preview",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "staging" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            "preview" => Ok(Self::Preview),
            other => Err(OrchestratorError::InvalidName(other.to_string())),
        }
    }
}

/// Identifies one slot registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistryKey {
    pub project: String,
    pub environment: Environment,
}

impl RegistryKey {
    pub fn new(project: &str, environment: Environment) -> Result<Self> {
        validate_name(project)?;
        Ok(Self {
            project: project.to_string(),
            environment,
        })
    }

    /// `{project}-{environment}`, the scope used for proxy units.
    pub fn scope(&self) -> String {
        format!("{}-{}", self.project, self.environment)
    }

    pub fn file_stem(&self) -> String {
        format!("{}--{}", self.project, self.environment)
    }

    pub fn from_file_stem(stem: &str) -> Option<Self> {
        let (project, environment) = stem.split_once("--")?;
        let environment = environment.parse().ok()?;
        Self::new(project, environment).ok()
    }
}

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.environment)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ProjectType {
    Nextjs,
    Remix,
    #[default]
    Node,
    Python,
    Go,
    Static,
    Other,
}

impl ProjectType {
    /// Value of `NODE_ENV`-style runtime hints passed into the container, if the family uses one.
    pub fn runtime_env(self, environment: Environment) -> Option<(&'static str, &'static str)> {
        let mode = match environment {
            Environment::Production => "production",
            Environment::Staging | Environment::Preview => "development",
        };
        match self {
            Self::Nextjs | Self::Remix | Self::Node => Some(("NODE_ENV", mode)),
            Self::Python => Some(("APP_ENV", mode)),
            Self::Go | Self::Static | Self::Other => None,
        }
    }
}

/// Coordinates of a datastore the project's containers connect to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DatastoreRef {
    pub kind: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

impl DatastoreRef {
    /// Environment variable name, e.g. `POSTGRES_HOST` for kind `postgres`.
    pub fn env_prefix(&self) -> String {
        self.kind.to_ascii_uppercase().replace('-', "_")
    }
}

fn default_container_port() -> u16 {
    3000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub name: String,
    pub team: String,
    #[serde(default, rename = "type")]
    pub project_type: ProjectType,
    /// Id of the registered server the project runs on.
    pub server: String,
    #[serde(default = "default_container_port")]
    pub container_port: u16,
    #[serde(default)]
    pub port_ranges: BTreeMap<Environment, PortRange>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub datastores: Vec<DatastoreRef>,
}

impl Project {
    pub fn container_name(&self, environment: Environment, color: super::SlotColor) -> String {
        format!("cb-{}-{}-{}", self.name, environment, color)
    }
}
