use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::project::Environment;
use super::slot::SlotColor;
use crate::error::Result;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DeploymentKind {
    Deploy,
    Promote,
    Rollback,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DeploymentStatus {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StepLog {
    pub name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Append-only history entry for one deploy, promote or rollback call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub id: String,
    pub kind: DeploymentKind,
    pub project: String,
    pub environment: Environment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<SlotColor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub status: DeploymentStatus,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub steps: Vec<StepLog>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    clock: Option<Instant>,
}

impl DeploymentRecord {
    pub fn start(kind: DeploymentKind, project: &str, environment: Environment, actor: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            project: project.to_string(),
            environment,
            slot: None,
            version: None,
            image: None,
            status: DeploymentStatus::Running,
            actor: actor.to_string(),
            reason: None,
            steps: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            error: None,
            clock: Some(Instant::now()),
        }
    }

    /// Start timing a step; finish it with [`StepTimer::ok`] or [`StepTimer::failed`].
    pub fn step(&self, name: &str) -> StepTimer {
        StepTimer {
            name: name.to_string(),
            started: Instant::now(),
        }
    }

    pub fn push(&mut self, step: StepLog) {
        self.steps.push(step);
    }

    /// Log the step as succeeded or failed depending on `result`, then pass it through.
    pub fn track<T>(&mut self, timer: StepTimer, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.steps.push(timer.ok()),
            Err(e) => self.steps.push(timer.failed(e.to_string())),
        }
        result
    }

    pub fn skip(&mut self, name: &str, message: impl Into<String>) {
        self.steps.push(StepLog {
            name: name.to_string(),
            status: StepStatus::Skipped,
            duration_ms: None,
            message: Some(message.into()),
        });
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.clock
            .map(|c| c.elapsed().as_millis() as u64)
            .unwrap_or_default()
    }

    pub fn finish(&mut self, error: Option<String>) {
        self.status = if error.is_some() {
            DeploymentStatus::Failed
        } else {
            DeploymentStatus::Succeeded
        };
        self.error = error;
        self.finished_at = Some(Utc::now());
        self.duration_ms = Some(self.elapsed_ms());
    }
}

pub struct StepTimer {
    name: String,
    started: Instant,
}

impl StepTimer {
    fn finish(self, status: StepStatus, message: Option<String>) -> StepLog {
        StepLog {
            name: self.name,
            status,
            duration_ms: Some(self.started.elapsed().as_millis() as u64),
            message,
        }
    }

    pub fn ok(self) -> StepLog {
        self.finish(StepStatus::Success, None)
    }

    pub fn ok_with(self, message: impl Into<String>) -> StepLog {
        self.finish(StepStatus::Success, Some(message.into()))
    }

    pub fn failed(self, message: impl Into<String>) -> StepLog {
        self.finish(StepStatus::Failed, Some(message.into()))
    }
}
