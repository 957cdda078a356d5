pub mod auth;
pub mod config;
pub mod deployment;
pub mod project;
pub mod slot;

pub use auth::{AuthContext, Role};
pub use config::{HealthConfig, PlatformConfig, PoolConfig, RemotePaths, ServerConfig};
pub use deployment::{DeploymentKind, DeploymentRecord, DeploymentStatus, StepLog, StepStatus};
pub use project::{
    validate_reference, DatastoreRef, Environment, PortRange, Project, ProjectType, RegistryKey,
};
pub use slot::{HealthStatus, Slot, SlotColor, SlotRegistry, SlotState};
