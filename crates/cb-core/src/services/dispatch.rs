use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::caddy::ReverseProxyConfigurator;
use super::catalog::{ProjectCatalog, StaticProjectCatalog};
use super::containers::ContainerRuntime;
use super::deploy::{DeployOrchestrator, DeployRequest, DeployResult};
use super::exec_pool::RemoteExecutionPool;
use super::health::HealthChecker;
use super::history::{DeploymentSink, JsonlDeploymentLog};
use super::path_guard::PathGuard;
use super::promote::{PromoteOrchestrator, PromoteResult};
use super::query::{SlotQueryService, SweepReport};
use super::rollback::{RollbackOrchestrator, RollbackResult};
use super::slot_store::SlotStore;
use super::transport::{SshTransport, Transport};
use crate::error::{OrchestratorError, Result};
use crate::models::{AuthContext, Environment, PlatformConfig, Role, SlotRegistry};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotTarget {
    pub project_name: String,
    pub environment: Environment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRequest {
    pub project_name: String,
    pub environment: Environment,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRequest {
    #[serde(default)]
    pub environment: Option<Environment>,
}

/// Every call the platform accepts.
#[derive(Debug, Clone)]
pub enum Operation {
    Deploy(DeployRequest),
    Promote(SlotTarget),
    Rollback(RollbackRequest),
    Status(SlotTarget),
    List(ListRequest),
    SweepExpiredGrace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Deploy,
    Promote,
    Rollback,
    SlotStatus,
    SlotList,
    SweepGrace,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Deploy(_) => OperationKind::Deploy,
            Self::Promote(_) => OperationKind::Promote,
            Self::Rollback(_) => OperationKind::Rollback,
            Self::Status(_) => OperationKind::SlotStatus,
            Self::List(_) => OperationKind::SlotList,
            Self::SweepExpiredGrace => OperationKind::SweepGrace,
        }
    }
}

/// External operation names, resolved once at the boundary into typed operations.
pub struct OperationRegistry {
    by_name: BTreeMap<&'static str, OperationKind>,
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationRegistry {
    pub fn new() -> Self {
        let by_name = BTreeMap::from([
            ("deploy", OperationKind::Deploy),
            ("promote", OperationKind::Promote),
            ("rollback", OperationKind::Rollback),
            ("slot_status", OperationKind::SlotStatus),
            ("slot_list", OperationKind::SlotList),
            ("sweep_grace", OperationKind::SweepGrace),
        ]);
        Self { by_name }
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.by_name.keys().copied()
    }

    pub fn resolve(&self, name: &str) -> Result<OperationKind> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| OrchestratorError::UnknownOperation(name.to_string()))
    }

    /// Build a typed operation from an external name and its JSON parameters.
    pub fn parse(&self, name: &str, params: serde_json::Value) -> Result<Operation> {
        let params = if params.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            params
        };
        let operation = match self.resolve(name)? {
            OperationKind::Deploy => Operation::Deploy(serde_json::from_value(params)?),
            OperationKind::Promote => Operation::Promote(serde_json::from_value(params)?),
            OperationKind::Rollback => Operation::Rollback(serde_json::from_value(params)?),
            OperationKind::SlotStatus => Operation::Status(serde_json::from_value(params)?),
            OperationKind::SlotList => Operation::List(serde_json::from_value(params)?),
            OperationKind::SweepGrace => Operation::SweepExpiredGrace,
        };
        Ok(operation)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "operation", content = "result", rename_all = "camelCase")]
pub enum OperationOutcome {
    Deploy(DeployResult),
    Promote(PromoteResult),
    Rollback(RollbackResult),
    Status(SlotRegistry),
    List(Vec<SlotRegistry>),
    Sweep(SweepReport),
}

/// The constructed service graph. Built once at startup and shared by every caller.
pub struct Platform {
    catalog: Arc<dyn ProjectCatalog>,
    pool: Arc<RemoteExecutionPool>,
    deploy: DeployOrchestrator,
    promote: PromoteOrchestrator,
    rollback: RollbackOrchestrator,
    query: Arc<SlotQueryService>,
    registry: OperationRegistry,
}

impl Platform {
    /// Wire up the services against real hosts over SSH, with history in the state dir.
    pub fn from_config(config: PlatformConfig) -> Result<Self> {
        let transport = Arc::new(SshTransport::new(
            config.servers.clone(),
            &config.state_dir.join("ssh"),
        ));
        let sink = Arc::new(JsonlDeploymentLog::new(&config.state_dir));
        Self::new(config, transport, sink)
    }

    pub fn new(
        config: PlatformConfig,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn DeploymentSink>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let catalog: Arc<dyn ProjectCatalog> = Arc::new(StaticProjectCatalog::new(
            config.projects.clone(),
            &config.servers,
        )?);
        let pool = Arc::new(RemoteExecutionPool::new(
            transport,
            PathGuard::new(config.paths.allowed_roots()),
            config.pool.clone(),
        ));
        let store = Arc::new(SlotStore::new(&config.state_dir, config.lock_wait()));
        let runtime = Arc::new(ContainerRuntime::new(pool.clone(), &config.paths.quadlet_dir));
        let health = Arc::new(HealthChecker::new(pool.clone(), config.health.clone()));
        let proxy = Arc::new(ReverseProxyConfigurator::new(
            pool.clone(),
            &config.paths.proxy_sites_dir,
            &config.paths.proxy_main_config,
            &config.base_domain,
        ));

        let deploy = DeployOrchestrator::new(
            config.clone(),
            store.clone(),
            runtime.clone(),
            health,
            sink.clone(),
        );
        let promote = PromoteOrchestrator::new(
            store.clone(),
            proxy.clone(),
            sink.clone(),
            config.grace_period(),
        );
        let rollback = RollbackOrchestrator::new(store.clone(), proxy, sink, config.grace_period());
        let query = Arc::new(SlotQueryService::new(
            store,
            runtime,
            catalog.clone(),
            pool.clone(),
        ));

        Ok(Self {
            catalog,
            pool,
            deploy,
            promote,
            rollback,
            query,
            registry: OperationRegistry::new(),
        })
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn query(&self) -> Arc<SlotQueryService> {
        self.query.clone()
    }

    pub async fn execute(&self, auth: &AuthContext, operation: Operation) -> Result<OperationOutcome> {
        tracing::debug!(kind = ?operation.kind(), actor = %auth.actor, "executing operation");
        match operation {
            Operation::Deploy(request) => {
                let project = self.catalog.get(&request.project_name).await?;
                auth.authorize(&project, Role::Member)?;
                let result = self.deploy.deploy(&project, &request, &auth.actor).await?;
                Ok(OperationOutcome::Deploy(result))
            }
            Operation::Promote(target) => {
                let project = self.catalog.get(&target.project_name).await?;
                auth.authorize(&project, Role::Member)?;
                let result = self
                    .promote
                    .promote(&project, target.environment, &auth.actor)
                    .await?;
                Ok(OperationOutcome::Promote(result))
            }
            Operation::Rollback(request) => {
                let project = self.catalog.get(&request.project_name).await?;
                auth.authorize(&project, Role::Member)?;
                let result = self
                    .rollback
                    .rollback(&project, request.environment, request.reason, &auth.actor)
                    .await?;
                Ok(OperationOutcome::Rollback(result))
            }
            Operation::Status(target) => {
                let project = self.catalog.get(&target.project_name).await?;
                auth.authorize(&project, Role::Viewer)?;
                let registry = self
                    .query
                    .get_status(&project.name, target.environment)
                    .await?;
                Ok(OperationOutcome::Status(registry))
            }
            Operation::List(request) => {
                let mut visible = Vec::new();
                for registry in self.query.list(request.environment).await? {
                    let allowed = match self.catalog.get(&registry.project).await {
                        Ok(project) => auth.authorize(&project, Role::Viewer).is_ok(),
                        Err(_) => false,
                    };
                    if allowed {
                        visible.push(registry);
                    }
                }
                Ok(OperationOutcome::List(visible))
            }
            Operation::SweepExpiredGrace => {
                if auth.role < Role::Admin {
                    return Err(OrchestratorError::Forbidden {
                        project: "*".into(),
                        reason: "sweeping grace slots requires the admin role".into(),
                    });
                }
                let report = self.query.sweep_expired_grace(Utc::now()).await?;
                Ok(OperationOutcome::Sweep(report))
            }
        }
    }

    /// Close every pooled channel. Call once on shutdown.
    pub async fn shutdown(&self) {
        self.pool.close_all().await;
    }
}
