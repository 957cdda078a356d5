use std::path::Path;

use crate::error::{OrchestratorError, Result};
use crate::models::PlatformConfig;

pub const CONFIG_FILENAME: &str = "codeb.yaml";

pub fn load(config_path: &Path) -> Result<PlatformConfig> {
    if !config_path.exists() {
        return Err(OrchestratorError::ConfigNotFound(config_path.to_path_buf()));
    }
    let contents = std::fs::read_to_string(config_path)?;
    let config: PlatformConfig = serde_yaml::from_str(&contents)
        .map_err(|e| OrchestratorError::InvalidConfig(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &PlatformConfig) -> Result<()> {
    if config.pool.max_channels_per_host == 0 {
        return Err(OrchestratorError::InvalidConfig(
            "pool.max_channels_per_host must be at least 1".into(),
        ));
    }
    if config.health.max_attempts == 0 {
        return Err(OrchestratorError::InvalidConfig(
            "health.max_attempts must be at least 1".into(),
        ));
    }
    if !config.health.path.starts_with('/') {
        return Err(OrchestratorError::InvalidConfig(
            "health.path must start with '/'".into(),
        ));
    }
    for (environment, range) in &config.port_ranges {
        if range.start > range.end {
            return Err(OrchestratorError::InvalidConfig(format!(
                "port range for {environment} is empty"
            )));
        }
    }
    let paths = &config.paths;
    for path in paths.allowed_roots() {
        if !path.is_absolute() {
            return Err(OrchestratorError::InvalidConfig(format!(
                "remote path {} must be absolute",
                path.display()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Environment, PortRange};
    use std::fs;

    #[test]
    fn parse_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
state_dir: /var/lib/codeb
grace_period_hours: 24
lock_wait_ms: 500
base_domain: apps.example.com
pool:
  max_channels_per_host: 3
health:
  path: /api/health
  max_attempts: 10
port_ranges:
  production: { start: 4100, end: 4199 }
servers:
  app-1:
    host: 10.0.0.5
    user: deploy
projects:
  - name: demo
    team: core
    type: nextjs
    server: app-1
"#;
        let path = dir.path().join(CONFIG_FILENAME);
        fs::write(&path, yaml).unwrap();
        let config = load(&path).unwrap();
        assert_eq!(config.grace_period_hours, 24);
        assert_eq!(config.lock_wait_ms, Some(500));
        assert_eq!(config.pool.max_channels_per_host, 3);
        assert_eq!(config.pool.idle_timeout_secs, 60);
        assert_eq!(config.health.path, "/api/health");
        assert_eq!(config.health.interval_ms, 2000);
        assert_eq!(config.servers["app-1"].port, 22);
        assert_eq!(config.projects[0].name, "demo");
        assert_eq!(
            config.port_range(&config.projects[0], Environment::Production),
            PortRange::new(4100, 4199)
        );
        // Environments not overridden keep the built-in range.
        assert_eq!(
            config.port_range(&config.projects[0], Environment::Staging),
            PortRange::new(3000, 3499)
        );
    }

    #[test]
    fn parse_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        fs::write(&path, "{}\n").unwrap();
        let config = load(&path).unwrap();
        assert_eq!(config.grace_period_hours, 48);
        assert_eq!(config.lock_wait_ms, None);
        assert_eq!(config.pool.max_channels_per_host, 5);
        assert_eq!(config.pool.connect_timeout_secs, 30);
        assert!(config.projects.is_empty());
    }

    #[test]
    fn missing_config_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load(&dir.path().join(CONFIG_FILENAME)),
            Err(OrchestratorError::ConfigNotFound(_))
        ));
    }

    #[test]
    fn relative_remote_path_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        fs::write(&path, "paths:\n  quadlet_dir: etc/containers\n").unwrap();
        assert!(matches!(load(&path), Err(OrchestratorError::InvalidConfig(_))));
    }
}
