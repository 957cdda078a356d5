use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;

use crate::error::{OrchestratorError, Result};
use crate::models::project::validate_name;
use crate::models::{Project, ServerConfig};

/// Read access to registered projects.
#[async_trait]
pub trait ProjectCatalog: Send + Sync {
    async fn get(&self, name: &str) -> Result<Project>;
    async fn list(&self) -> Result<Vec<Project>>;
}

/// Catalog fixed at startup from configuration.
pub struct StaticProjectCatalog {
    projects: BTreeMap<String, Project>,
}

impl StaticProjectCatalog {
    /// Build the catalog, rejecting bad names, duplicates and unknown servers.
    pub fn new(projects: Vec<Project>, servers: &HashMap<String, ServerConfig>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for project in projects {
            validate_name(&project.name)?;
            if !servers.contains_key(&project.server) {
                return Err(OrchestratorError::InvalidConfig(format!(
                    "project '{}' references unknown server '{}'",
                    project.name, project.server
                )));
            }
            for (environment, range) in &project.port_ranges {
                if range.start > range.end {
                    return Err(OrchestratorError::InvalidConfig(format!(
                        "project '{}' has an empty {environment} port range",
                        project.name
                    )));
                }
            }
            if let Some(dup) = map.insert(project.name.clone(), project) {
                return Err(OrchestratorError::InvalidConfig(format!(
                    "project '{}' is registered twice",
                    dup.name
                )));
            }
        }
        Ok(Self { projects: map })
    }
}

#[async_trait]
impl ProjectCatalog for StaticProjectCatalog {
    async fn get(&self, name: &str) -> Result<Project> {
        self.projects
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::ProjectNotFound(name.to_string()))
    }

    async fn list(&self) -> Result<Vec<Project>> {
        Ok(self.projects.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Environment, PortRange, ProjectType};

    fn project(name: &str, server: &str) -> Project {
        Project {
            name: name.into(),
            team: "core".into(),
            project_type: ProjectType::Node,
            server: server.into(),
            container_port: 3000,
            port_ranges: Default::default(),
            env: Default::default(),
            datastores: Vec::new(),
        }
    }

    fn servers() -> HashMap<String, ServerConfig> {
        HashMap::from([(
            "app-1".to_string(),
            ServerConfig {
                host: "10.0.0.1".into(),
                user: "root".into(),
                port: 22,
                identity_file: None,
            },
        )])
    }

    #[tokio::test]
    async fn lookup_by_name() {
        let catalog = StaticProjectCatalog::new(vec![project("demo", "app-1")], &servers()).unwrap();
        assert_eq!(catalog.get("demo").await.unwrap().server, "app-1");
        assert!(matches!(
            catalog.get("missing").await,
            Err(OrchestratorError::ProjectNotFound(_))
        ));
    }

    #[test]
    fn unknown_server_is_rejected() {
        assert!(StaticProjectCatalog::new(vec![project("demo", "app-9")], &servers()).is_err());
    }

    #[test]
    fn duplicates_and_bad_ranges_are_rejected() {
        let dup = vec![project("demo", "app-1"), project("demo", "app-1")];
        assert!(StaticProjectCatalog::new(dup, &servers()).is_err());

        let mut bad = project("demo", "app-1");
        bad.port_ranges
            .insert(Environment::Staging, PortRange::new(3100, 3000));
        assert!(StaticProjectCatalog::new(vec![bad], &servers()).is_err());
    }
}
