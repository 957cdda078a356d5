//! Podman Quadlet `.container` units for slot containers.
//!
//! Rendering is a pure function of the descriptor; activation lives in
//! [`containers`](super::containers).

use std::collections::BTreeMap;

use super::containers::PROJECT_LABEL;
use crate::models::{Environment, Project, SlotColor};

/// Everything needed to render one slot's container unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDescriptor {
    pub name: String,
    pub description: String,
    pub image: String,
    pub host_port: u16,
    pub container_port: u16,
    pub environment: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub health_cmd: String,
}

impl ContainerDescriptor {
    pub fn for_slot(
        project: &Project,
        environment: Environment,
        color: SlotColor,
        host_port: u16,
        image: &str,
        version: &str,
        health_path: &str,
    ) -> Self {
        let env_vars = build_env_vars(project, environment, color, version);
        let labels = BTreeMap::from([
            ("cb.environment".to_string(), environment.to_string()),
            (PROJECT_LABEL.to_string(), project.name.clone()),
            ("cb.slot".to_string(), color.to_string()),
            ("cb.version".to_string(), version.to_string()),
        ]);
        Self {
            name: project.container_name(environment, color),
            description: format!("{} {} ({color}, {version})", project.name, environment),
            image: image.to_string(),
            host_port,
            container_port: project.container_port,
            environment: env_vars,
            labels,
            health_cmd: format!(
                "curl -fsS http://127.0.0.1:{}{} || exit 1",
                project.container_port, health_path
            ),
        }
    }

    pub fn unit_file_name(&self) -> String {
        format!("{}.container", self.name)
    }

    /// systemd service generated by Quadlet from the unit.
    pub fn service_name(&self) -> String {
        format!("{}.service", self.name)
    }
}

/// Container environment: platform variables, runtime hints, datastores, then project overrides.
pub fn build_env_vars(
    project: &Project,
    environment: Environment,
    color: SlotColor,
    version: &str,
) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    vars.insert("PORT".to_string(), project.container_port.to_string());
    vars.insert("CB_SLOT".to_string(), color.to_string());
    vars.insert("CB_VERSION".to_string(), version.to_string());
    vars.insert("CB_ENVIRONMENT".to_string(), environment.to_string());
    if let Some((key, value)) = project.project_type.runtime_env(environment) {
        vars.insert(key.to_string(), value.to_string());
    }
    for store in &project.datastores {
        let prefix = store.env_prefix();
        vars.insert(format!("{prefix}_HOST"), store.host.clone());
        vars.insert(format!("{prefix}_PORT"), store.port.to_string());
        if let Some(db) = &store.database {
            vars.insert(format!("{prefix}_DATABASE"), db.clone());
        }
    }
    for (key, value) in &project.env {
        vars.insert(key.clone(), value.clone());
    }
    vars
}

/// One `Key=value` assignment, quoted with C-style escapes when it holds anything a unit
/// line could misread. Control characters never reach the file raw.
fn quote_assignment(key: &str, value: &str) -> String {
    let pair = format!("{key}={value}");
    if !pair
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || c == '"' || c == '\\')
    {
        return pair;
    }
    let mut quoted = String::with_capacity(pair.len() + 2);
    quoted.push('"');
    for c in pair.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            c if c.is_control() => quoted.push_str(&format!("\\x{:02x}", c as u32 & 0xff)),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

/// Render the Quadlet unit. The security profile is fixed and not configurable.
pub fn render(descriptor: &ContainerDescriptor) -> String {
    let mut lines = vec![
        "[Unit]".to_string(),
        format!("Description={}", descriptor.description),
        "After=network-online.target".to_string(),
        "Wants=network-online.target".to_string(),
        String::new(),
        "[Container]".to_string(),
        format!("ContainerName={}", descriptor.name),
        format!("Image={}", descriptor.image),
        format!(
            "PublishPort={}:{}",
            descriptor.host_port, descriptor.container_port
        ),
    ];
    lines.extend(
        descriptor
            .environment
            .iter()
            .map(|(key, value)| format!("Environment={}", quote_assignment(key, value))),
    );
    lines.extend(
        descriptor
            .labels
            .iter()
            .map(|(key, value)| format!("Label={}", quote_assignment(key, value))),
    );
    lines.extend([
        "ReadOnly=true".to_string(),
        "NoNewPrivileges=true".to_string(),
        "DropCapability=ALL".to_string(),
        "Tmpfs=/tmp:rw,noexec,nosuid,size=64m".to_string(),
        format!("HealthCmd={}", descriptor.health_cmd),
        "HealthInterval=10s".to_string(),
        "HealthRetries=3".to_string(),
        String::new(),
        "[Service]".to_string(),
        "Restart=on-failure".to_string(),
        "TimeoutStartSec=300".to_string(),
        String::new(),
        "[Install]".to_string(),
        "WantedBy=multi-user.target".to_string(),
    ]);

    let mut out = lines.join("\n");
    out.push('\n');
    out
}
