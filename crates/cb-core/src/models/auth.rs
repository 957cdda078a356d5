use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::project::Project;
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Viewer,
    Member,
    Admin,
    Owner,
}

/// Identity handed over by the authentication layer. Trusted as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthContext {
    pub team: String,
    pub role: Role,
    pub actor: String,
    /// Projects this caller may touch. Empty means every project of the team.
    #[serde(default)]
    pub allowed_projects: BTreeSet<String>,
}

impl AuthContext {
    pub fn authorize(&self, project: &Project, required: Role) -> Result<()> {
        if project.team != self.team {
            return Err(OrchestratorError::Forbidden {
                project: project.name.clone(),
                reason: format!("project belongs to team '{}'", project.team),
            });
        }
        if !self.allowed_projects.is_empty() && !self.allowed_projects.contains(&project.name) {
            return Err(OrchestratorError::Forbidden {
                project: project.name.clone(),
                reason: "project not in the allowed set".into(),
            });
        }
        if self.role < required {
            return Err(OrchestratorError::Forbidden {
                project: project.name.clone(),
                reason: format!("role {:?} is below {:?}", self.role, required),
            });
        }
        Ok(())
    }
}
