use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::Instrument;

use super::caddy::{ReverseProxyConfigurator, RouteTarget};
use super::history::{self, DeploymentSink};
use super::slot_store::{RegistryGuard, SlotStore};
use crate::error::{OrchestratorError, Result};
use crate::models::{
    DeploymentKind, DeploymentRecord, Environment, Project, SlotColor, SlotRegistry, SlotState,
    StepLog,
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoteResult {
    pub deployment_id: String,
    pub active_slot: SlotColor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_slot: Option<SlotColor>,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_expires_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepLog>,
    pub duration_ms: u64,
}

/// Outcome of moving live traffic onto a slot.
pub(super) struct Switched {
    pub active: SlotColor,
    pub previous: Option<SlotColor>,
    pub port: u16,
    pub version: Option<String>,
    pub grace_expires_at: Option<DateTime<Utc>>,
}

/// Point the proxy at `color`, then mark it active and persist.
///
/// Shared by promote and rollback. If the proxy step fails the registry is untouched. If
/// persisting fails after the switch, the proxy is pointed back at the previously active slot.
pub(super) async fn switch_traffic(
    proxy: &ReverseProxyConfigurator,
    guard: &mut RegistryGuard<'_>,
    host: &str,
    color: SlotColor,
    grace_period: Duration,
    record: &mut DeploymentRecord,
) -> Result<Switched> {
    let slot = guard.registry().slot(color).clone();
    let port = slot.port.ok_or_else(|| {
        OrchestratorError::State(format!("slot {color} of {} has no port", guard.key()))
    })?;
    let version = slot.version.clone().unwrap_or_else(|| "unknown".into());
    let target = RouteTarget {
        slot: color,
        port,
        version: &version,
    };

    let timer = record.step("switch_proxy");
    let result = proxy.apply(host, guard.key(), &target).await;
    let activation = record.track(timer, result)?;

    let timer = record.step("activate");
    let before = guard.registry().clone();
    let result = guard
        .registry_mut()
        .activate(color, &activation, grace_period, Utc::now())
        .map_err(OrchestratorError::State);
    let saved = match result {
        Ok(previous) => guard.save().await.map(|_| previous),
        Err(e) => Err(e),
    };
    let previous = match saved {
        Ok(previous) => {
            record.push(timer.ok_with(format!("{color} on port {port}")));
            previous
        }
        Err(e) => {
            record.push(timer.failed(e.to_string()));
            *guard.registry_mut() = before.clone();
            restore_route(proxy, guard, host, &before).await;
            return Err(e);
        }
    };

    tracing::info!(active = %color, previous = ?previous, port, "traffic switched");
    Ok(Switched {
        active: color,
        previous,
        port,
        version: slot.version,
        grace_expires_at: guard.registry().grace_expires_at,
    })
}

async fn restore_route(
    proxy: &ReverseProxyConfigurator,
    guard: &RegistryGuard<'_>,
    host: &str,
    before: &SlotRegistry,
) {
    let Some(active) = before.active_slot else {
        tracing::error!(key = %guard.key(), "registry not saved and no previous route to restore");
        return;
    };
    let slot = before.slot(active);
    let Some(port) = slot.port else {
        return;
    };
    let version = slot.version.as_deref().unwrap_or("unknown");
    let target = RouteTarget {
        slot: active,
        port,
        version,
    };
    if let Err(e) = proxy.apply(host, guard.key(), &target).await {
        tracing::error!(key = %guard.key(), error = %e, "failed to restore previous route");
    }
}

/// Switches live traffic to the slot holding a freshly deployed version.
pub struct PromoteOrchestrator {
    store: Arc<SlotStore>,
    proxy: Arc<ReverseProxyConfigurator>,
    sink: Arc<dyn DeploymentSink>,
    grace_period: Duration,
}

impl PromoteOrchestrator {
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

    pub async fn promote(
        &self,
        project: &Project,
        environment: Environment,
        actor: &str,
    ) -> Result<PromoteResult> {
        let mut record =
            DeploymentRecord::start(DeploymentKind::Promote, &project.name, environment, actor);
        let span = tracing::info_span!(
            "promote",
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
        Ok(PromoteResult {
            deployment_id: record.id,
            active_slot: switched.active,
            previous_slot: switched.previous,
            port: switched.port,
            version: switched.version,
            grace_expires_at: switched.grace_expires_at,
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
        let selected = guard
            .registry()
            .find_in_state(SlotState::Deployed)
            .ok_or_else(|| OrchestratorError::NoDeployedSlot {
                project: project.name.clone(),
                environment,
            });
        let color = record.track(timer, selected)?;
        record.slot = Some(color);
        record.version = guard.registry().slot(color).version.clone();
        record.image = guard.registry().slot(color).image.clone();
        tracing::Span::current().record("slot", color.as_str());

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
