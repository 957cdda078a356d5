use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::catalog::ProjectCatalog;
use super::containers::ContainerRuntime;
use super::exec_pool::RemoteExecutionPool;
use super::slot_store::SlotStore;
use crate::error::{OrchestratorError, Result};
use crate::models::{Environment, RegistryKey, SlotColor, SlotRegistry, SlotState};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SweptSlot {
    pub project: String,
    pub environment: Environment,
    pub slot: SlotColor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub expired: Vec<SweptSlot>,
    /// Keys locked by another operation; picked up again on the next pass.
    pub skipped_busy: Vec<String>,
    pub failed: Vec<String>,
}

enum SweepOutcome {
    Nothing,
    Expired(SweptSlot),
}

/// Read access to registries plus the background reclamation of expired grace slots.
pub struct SlotQueryService {
    store: Arc<SlotStore>,
    runtime: Arc<ContainerRuntime>,
    catalog: Arc<dyn ProjectCatalog>,
    pool: Arc<RemoteExecutionPool>,
}

impl SlotQueryService {
    pub fn new(
        store: Arc<SlotStore>,
        runtime: Arc<ContainerRuntime>,
        catalog: Arc<dyn ProjectCatalog>,
        pool: Arc<RemoteExecutionPool>,
    ) -> Self {
        Self {
            store,
            runtime,
            catalog,
            pool,
        }
    }

    /// Last persisted registry. Never blocks on a running operation.
    pub async fn get_status(&self, project: &str, environment: Environment) -> Result<SlotRegistry> {
        self.store.get_or_init(project, environment).await
    }

    pub async fn list(&self, environment: Option<Environment>) -> Result<Vec<SlotRegistry>> {
        let mut registries = Vec::new();
        for key in self.store.list_keys().await? {
            if environment.is_some_and(|e| e != key.environment) {
                continue;
            }
            registries.push(self.store.get_or_init(&key.project, key.environment).await?);
        }
        Ok(registries)
    }

    /// Tear down every grace slot whose window closed at or before `now` and mark it empty.
    ///
    /// Takes the same per-key lock as rollback. Busy keys are skipped rather than waited on.
    pub async fn sweep_expired_grace(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for key in self.store.list_keys().await? {
            match self.sweep_key(&key, now).await {
                Ok(SweepOutcome::Nothing) => {}
                Ok(SweepOutcome::Expired(slot)) => report.expired.push(slot),
                Err(
                    OrchestratorError::ConcurrentOperationInProgress { .. }
                    | OrchestratorError::LockTimeout { .. },
                ) => {
                    tracing::debug!(%key, "registry busy, skipping sweep");
                    report.skipped_busy.push(key.to_string());
                }
                Err(e) => {
                    tracing::warn!(%key, error = %e, "grace sweep failed");
                    report.failed.push(format!("{key}: {e}"));
                }
            }
        }
        if !report.expired.is_empty() {
            tracing::info!(expired = report.expired.len(), "reclaimed expired grace slots");
        }
        Ok(report)
    }

    async fn sweep_key(&self, key: &RegistryKey, now: DateTime<Utc>) -> Result<SweepOutcome> {
        // Cheap unlocked peek so idle keys never contend with foreground operations.
        let snapshot = self.store.get_or_init(&key.project, key.environment).await?;
        if snapshot.expired_grace_slot(now).is_none() {
            return Ok(SweepOutcome::Nothing);
        }

        let mut guard = self.store.lock(&key.project, key.environment).await?;
        let Some(color) = guard.registry().expired_grace_slot(now) else {
            return Ok(SweepOutcome::Nothing);
        };
        let project = self.catalog.get(&key.project).await?;
        let container = project.container_name(key.environment, color);
        let port = guard.registry().slot(color).port;
        let expired_at = guard.registry().grace_expires_at;

        {
            let registry = guard.registry_mut();
            registry.slot_mut(color).state = SlotState::Draining;
            registry.grace_expires_at = None;
        }
        guard.save().await?;

        match self.runtime.teardown(&project.server, &project.name, &container, port).await {
            Ok(()) => {
                guard.registry_mut().slot_mut(color).reset_keeping_port();
                guard.save().await?;
                tracing::info!(%key, slot = %color, ?port, "grace slot reclaimed");
                Ok(SweepOutcome::Expired(SweptSlot {
                    project: key.project.clone(),
                    environment: key.environment,
                    slot: color,
                    port,
                }))
            }
            Err(e) => {
                let registry = guard.registry_mut();
                registry.slot_mut(color).state = SlotState::Grace;
                registry.slot_mut(color).error = Some(e.to_string());
                registry.grace_expires_at = expired_at;
                guard.save().await?;
                Err(e)
            }
        }
    }

    pub fn pool(&self) -> &Arc<RemoteExecutionPool> {
        &self.pool
    }
}

/// Run the grace sweep every `interval` until `shutdown` flips to `true`.
///
/// Each tick also closes pooled channels that have sat idle too long.
pub fn spawn_grace_sweeper(
    service: Arc<SlotQueryService>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match service.sweep_expired_grace(Utc::now()).await {
                        Ok(report) if !report.failed.is_empty() => {
                            tracing::warn!(failed = report.failed.len(), "grace sweep finished with failures");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "grace sweep aborted"),
                    }
                    let reaped = service.pool().reap_idle().await;
                    if reaped > 0 {
                        tracing::debug!(reaped, "closed idle channels");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("grace sweeper stopping");
                        break;
                    }
                }
            }
        }
    })
}
