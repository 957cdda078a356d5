use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use super::containers::ContainerRuntime;
use super::health::HealthChecker;
use super::history::{self, DeploymentSink};
use super::ports::PortAllocator;
use super::quadlet::ContainerDescriptor;
use super::slot_store::{RegistryGuard, SlotStore};
use crate::error::{OrchestratorError, Result};
use crate::models::{
    validate_reference, DeploymentKind, DeploymentRecord, Environment, HealthStatus,
    PlatformConfig, Project, RegistryKey, Slot, SlotColor, SlotRegistry, SlotState, StepLog,
};

pub const DEFAULT_VERSION: &str = "latest";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub project_name: String,
    pub environment: Environment,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResult {
    pub deployment_id: String,
    pub success: bool,
    pub slot: SlotColor,
    pub port: u16,
    pub version: String,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    pub steps: Vec<StepLog>,
    pub duration_ms: u64,
}

struct Placement {
    slot: SlotColor,
    port: u16,
}

/// Brings a new version up in the inactive slot without touching live traffic.
pub struct DeployOrchestrator {
    config: Arc<PlatformConfig>,
    store: Arc<SlotStore>,
    runtime: Arc<ContainerRuntime>,
    health: Arc<HealthChecker>,
    sink: Arc<dyn DeploymentSink>,
}

impl DeployOrchestrator {
    pub fn new(
        config: Arc<PlatformConfig>,
        store: Arc<SlotStore>,
        runtime: Arc<ContainerRuntime>,
        health: Arc<HealthChecker>,
        sink: Arc<dyn DeploymentSink>,
    ) -> Self {
        Self {
            config,
            store,
            runtime,
            health,
            sink,
        }
    }

    pub async fn deploy(
        &self,
        project: &Project,
        request: &DeployRequest,
        actor: &str,
    ) -> Result<DeployResult> {
        let environment = request.environment;
        let version = request
            .version
            .clone()
            .unwrap_or_else(|| DEFAULT_VERSION.to_string());
        let image = request
            .image
            .clone()
            .unwrap_or_else(|| format!("{}:{version}", project.name));
        validate_reference("version", &version)?;
        validate_reference("image", &image)?;

        let mut record =
            DeploymentRecord::start(DeploymentKind::Deploy, &project.name, environment, actor);
        record.version = Some(version.clone());
        record.image = Some(image.clone());

        let span = tracing::info_span!(
            "deploy",
            project = %project.name,
            environment = %environment,
            slot = tracing::field::Empty,
        );
        let outcome = self
            .run(project, environment, &version, &image, &mut record)
            .instrument(span)
            .await;
        record.finish(outcome.as_ref().err().map(ToString::to_string));
        history::record(self.sink.as_ref(), &record).await;

        let placement = outcome?;
        Ok(DeployResult {
            deployment_id: record.id,
            success: true,
            slot: placement.slot,
            port: placement.port,
            version,
            image,
            preview_url: self.preview_url(project, placement.port),
            steps: record.steps,
            duration_ms: record.duration_ms.unwrap_or_default(),
        })
    }

    fn preview_url(&self, project: &Project, port: u16) -> Option<String> {
        self.config
            .servers
            .get(&project.server)
            .map(|server| format!("http://{}:{port}", server.host))
    }

    async fn run(
        &self,
        project: &Project,
        environment: Environment,
        version: &str,
        image: &str,
        record: &mut DeploymentRecord,
    ) -> Result<Placement> {
        let mut guard = self.store.lock(&project.name, environment).await?;
        let host = project.server.as_str();

        let timer = record.step("select_slot");
        let color = guard.registry().inactive_color();
        let before = guard.registry().clone();
        record.slot = Some(color);
        tracing::Span::current().record("slot", color.as_str());
        record.push(timer.ok_with(format!("{color} (was {})", before.slot(color).state)));

        let container = project.container_name(environment, color);
        let timer = record.step("teardown");
        let result = self
            .runtime
            .teardown(host, &project.name, &container, before.slot(color).port)
            .await;
        record.track(timer, result)?;

        let timer = record.step("allocate_port");
        // Held until the deploying slot's port is persisted, so concurrent deploys on the
        // same host see each other's claim.
        let allocation = self.store.lock_host_ports(host).await;
        let result = self
            .allocate_port(project, environment, guard.key(), &before, color)
            .await;
        let port = record.track(timer, result)?;

        {
            let registry = guard.registry_mut();
            if registry.slot(color).state == SlotState::Grace {
                // Redeploying over the grace slot gives up the rollback target.
                registry.grace_expires_at = None;
            }
            let slot = registry.slot_mut(color);
            slot.state = SlotState::Deploying;
            slot.port = Some(port);
            slot.error = None;
        }
        guard.save().await?;
        drop(allocation);

        let descriptor = ContainerDescriptor::for_slot(
            project,
            environment,
            color,
            port,
            image,
            version,
            &self.config.health.path,
        );
        let timer = record.step("start_container");
        let result = self.runtime.start(host, &descriptor).await;
        if let Err(e) = record.track(timer, result) {
            self.compensate(&mut guard, host, &container, port, &before, color, &e)
                .await;
            return Err(e);
        }

        let timer = record.step("health_check");
        let report = self.health.wait_until_healthy(host, port).await;
        if report.status != HealthStatus::Healthy {
            let error = OrchestratorError::HealthCheckFailed {
                slot: color,
                port,
                version: version.to_string(),
                attempts: report.attempts,
                status: report.status,
            };
            record.push(timer.failed(error.to_string()));
            self.compensate(&mut guard, host, &container, port, &before, color, &error)
                .await;
            return Err(error);
        }
        record.push(timer.ok_with(format!("healthy after {} attempts", report.attempts)));

        let timer = record.step("finalize");
        *guard.registry_mut().slot_mut(color) = Slot {
            state: SlotState::Deployed,
            port: Some(port),
            version: Some(version.to_string()),
            image: Some(image.to_string()),
            deployed_at: Some(Utc::now()),
            deployed_by: Some(record.actor.clone()),
            health_status: HealthStatus::Healthy,
            error: None,
        };
        let result = guard.save().await;
        if let Err(e) = record.track(timer, result) {
            self.compensate(&mut guard, host, &container, port, &before, color, &e)
                .await;
            return Err(e);
        }

        tracing::info!(port, version, "slot deployed");
        Ok(Placement { slot: color, port })
    }

    /// Pick the slot's port: the recorded one if it is still free, else the lowest free port.
    ///
    /// "Free" means unclaimed by any other registry and not held by a container or socket on
    /// the host, checked after teardown so a stale claim by this slot does not count.
    async fn allocate_port(
        &self,
        project: &Project,
        environment: Environment,
        key: &RegistryKey,
        registry: &SlotRegistry,
        color: SlotColor,
    ) -> Result<u16> {
        let range = self.config.port_range(project, environment);
        let live = self.runtime.host_ports(&project.server).await?;
        let mut claimed = self.store.claimed_ports(key).await?;
        claimed.extend(registry.slot(color.other()).port);
        claimed.extend(live.published.iter().copied());
        claimed.extend(live.listening.iter().copied());

        if let Some(previous) = registry.slot(color).port {
            if range.contains(previous) && !claimed.contains(&previous) {
                return Ok(previous);
            }
            tracing::info!(previous, "recorded port is no longer free");
        }
        PortAllocator::lowest_free(range, &claimed)
    }

    /// Undo a failed deploy: remove the new container and put the registry back as it was,
    /// with the failure noted on the slot.
    ///
    /// A slot that held a container before the deploy cannot be restored as-is, since that
    /// container was torn down to make room. It comes back empty with its port still reserved,
    /// and a grace window it carried is closed.
    #[allow(clippy::too_many_arguments)]
    async fn compensate(
        &self,
        guard: &mut RegistryGuard<'_>,
        host: &str,
        container: &str,
        port: u16,
        before: &SlotRegistry,
        color: SlotColor,
        error: &OrchestratorError,
    ) {
        tracing::warn!(container, port, error = %error, "deploy failed, restoring slot");
        let project = guard.key().project.clone();
        if let Err(e) = self
            .runtime
            .teardown(host, &project, container, Some(port))
            .await
        {
            tracing::error!(container, port, error = %e, "compensating teardown failed");
        }
        let mut restored = before.clone();
        let prior = before.slot(color).state;
        if prior != SlotState::Empty {
            tracing::warn!(container, %prior, "previous container is gone, slot restored as empty");
            restored.slot_mut(color).reset_keeping_port();
            if prior == SlotState::Grace {
                restored.grace_expires_at = None;
            }
        }
        restored.slot_mut(color).error = Some(error.to_string());
        *guard.registry_mut() = restored;
        if let Err(e) = guard.save().await {
            tracing::error!(key = %guard.key(), error = %e, "failed to restore slot registry");
        }
    }
}
