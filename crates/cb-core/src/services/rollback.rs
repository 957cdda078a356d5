use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::Instrument;

use super::caddy::ReverseProxyConfigurator;
use super::history::{self, DeploymentSink};
use super::promote::{switch_traffic, Switched};
use super::slot_store::SlotStore;
use crate::error::{OrchestratorError, Result};
use crate::models::{DeploymentKind, DeploymentRecord, Environment, Project, SlotColor, StepLog};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResult {
    pub deployment_id: String,
    pub active_slot: SlotColor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_slot: Option<SlotColor>,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub steps: Vec<StepLog>,
    pub duration_ms: u64,
}

/// Sends traffic back to the slot still inside its grace window.
///
/// The slot it replaces goes into grace with a fresh window, so a rollback can itself be
/// rolled back.
pub struct RollbackOrchestrator {
    store: Arc<SlotStore>,
    proxy: Arc<ReverseProxyConfigurator>,
    sink: Arc<dyn DeploymentSink>,
    grace_period: Duration,
}

impl RollbackOrchestrator {
    pub fn new(
        store: Arc<SlotStore>,
        proxy: Arc<ReverseProxyConfigurator>,
        sink: Arc<dyn DeploymentSink>,
        grace_period: Duration,
    ) -> Self {
        Self {
            store,
            proxy,
            sink,
            grace_period,
        }
    }

    pub async fn rollback(
        &self,
        project: &Project,
        environment: Environment,
        reason: Option<String>,
        actor: &str,
    ) -> Result<RollbackResult> {
        let mut record =
            DeploymentRecord::start(DeploymentKind::Rollback, &project.name, environment, actor);
        record.reason = reason.clone();
        let span = tracing::info_span!(
            "rollback",
            project = %project.name,
            environment = %environment,
            slot = tracing::field::Empty,
        );
        let outcome = self
            .run(project, environment, &mut record)
            .instrument(span)
            .await;
        record.finish(outcome.as_ref().err().map(ToString::to_string));
        history::record(self.sink.as_ref(), &record).await;

        let switched = outcome?;
        Ok(RollbackResult {
            deployment_id: record.id,
            active_slot: switched.active,
            previous_slot: switched.previous,
            port: switched.port,
            version: switched.version,
            grace_expires_at: switched.grace_expires_at,
            reason,
            steps: record.steps,
            duration_ms: record.duration_ms.unwrap_or_default(),
        })
    }

    async fn run(
        &self,
        project: &Project,
        environment: Environment,
        record: &mut DeploymentRecord,
    ) -> Result<Switched> {
        let mut guard = self.store.lock(&project.name, environment).await?;

        let timer = record.step("select_slot");
        // An expired window counts as no grace slot even before the sweep reclaims it.
        let selected = guard
            .registry()
            .open_grace_slot(Utc::now())
            .ok_or_else(|| OrchestratorError::NoGraceSlot {
                project: project.name.clone(),
                environment,
            });
        let color = record.track(timer, selected)?;
        record.slot = Some(color);
        record.version = guard.registry().slot(color).version.clone();
        record.image = guard.registry().slot(color).image.clone();
        tracing::Span::current().record("slot", color.as_str());
        if let Some(reason) = &record.reason {
            tracing::info!(reason, "rolling back");
        }

        switch_traffic(
            &self.proxy,
            &mut guard,
            &project.server,
            color,
            self.grace_period,
            record,
        )
        .await
    }
}
