use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::{OrchestratorError, Result};
use crate::models::DeploymentRecord;

/// Write-only sink for deployment history.
#[async_trait]
pub trait DeploymentSink: Send + Sync {
    async fn append(&self, record: &DeploymentRecord) -> Result<()>;
}

/// Appends one JSON document per line to `deployments.jsonl`.
pub struct JsonlDeploymentLog {
    path: PathBuf,
}

impl JsonlDeploymentLog {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("deployments.jsonl"),
        }
    }

    /// The last `limit` records, oldest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<DeploymentRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| OrchestratorError::State(format!("reading deployment log: {e}")))?;
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(limit);
        lines[start..]
            .iter()
            .map(|l| serde_json::from_str(l).map_err(OrchestratorError::from))
            .collect()
    }
}

#[async_trait]
impl DeploymentSink for JsonlDeploymentLog {
    async fn append(&self, record: &DeploymentRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| OrchestratorError::State(format!("creating log dir: {e}")))?;
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| OrchestratorError::State(format!("opening deployment log: {e}")))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| OrchestratorError::State(format!("writing deployment log: {e}")))?;
        Ok(())
    }
}

/// Record a finished deployment without letting a sink failure change the outcome.
pub async fn record(sink: &dyn DeploymentSink, record: &DeploymentRecord) {
    if let Err(e) = sink.append(record).await {
        tracing::warn!(id = %record.id, error = %e, "failed to append deployment record");
    }
}
