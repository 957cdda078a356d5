use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::OwnedMutexGuard;

use super::state::SlotStateStore;
use crate::error::{OrchestratorError, Result};
use crate::models::{Environment, RegistryKey, SlotColor, SlotRegistry};

/// Source of truth for every slot registry, with one exclusive lock per key.
///
/// Locks do not queue: unless a bounded wait is configured, a second caller on a busy
/// key is rejected with [`OrchestratorError::ConcurrentOperationInProgress`].
pub struct SlotStore {
    state: SlotStateStore,
    locks: Mutex<HashMap<RegistryKey, Arc<tokio::sync::Mutex<()>>>>,
    /// Per-host port allocation, shared by every key on that host.
    allocations: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    lock_wait: Option<Duration>,
}

/// Exclusive access to one registry. Dropping the guard releases the lock.
pub struct RegistryGuard<'a> {
    key: RegistryKey,
    registry: SlotRegistry,
    state: &'a SlotStateStore,
    _lock: OwnedMutexGuard<()>,
}

impl RegistryGuard<'_> {
    pub fn key(&self) -> &RegistryKey {
        &self.key
    }

    pub fn registry(&self) -> &SlotRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut SlotRegistry {
        &mut self.registry
    }

    /// Persist the current registry. Refuses to write a registry that breaks its invariants.
    pub async fn save(&mut self) -> Result<()> {
        self.registry.validate().map_err(|reason| {
            OrchestratorError::State(format!("refusing to persist {}: {reason}", self.key))
        })?;
        self.registry.last_updated = Utc::now();
        self.state.save(&self.key, &self.registry).await
    }
}

impl SlotStore {
    pub fn new(state_dir: &Path, lock_wait: Option<Duration>) -> Self {
        Self {
            state: SlotStateStore::new(state_dir),
            locks: Mutex::new(HashMap::new()),
            allocations: Mutex::new(HashMap::new()),
            lock_wait,
        }
    }

    fn mutex_for(&self, key: &RegistryKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Serialise port allocation on `host` across all keys.
    ///
    /// Unlike the per-key lock this one always waits: holders only scan ports and persist a
    /// claim, both bounded by command timeouts.
    pub async fn lock_host_ports(&self, host: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .allocations
            .lock()
            .unwrap()
            .entry(host.to_string())
            .or_default()
            .clone();
        mutex.lock_owned().await
    }

    /// Current registry, or a fresh one if none has been persisted yet. Takes no lock.
    pub async fn get_or_init(&self, project: &str, environment: Environment) -> Result<SlotRegistry> {
        let key = RegistryKey::new(project, environment)?;
        Ok(self
            .state
            .load(&key)
            .await?
            .unwrap_or_else(|| SlotRegistry::new(project, environment)))
    }

    pub async fn lock(&self, project: &str, environment: Environment) -> Result<RegistryGuard<'_>> {
        let key = RegistryKey::new(project, environment)?;
        let mutex = self.mutex_for(&key);
        let lock = match self.lock_wait {
            None => mutex.try_lock_owned().map_err(|_| {
                OrchestratorError::ConcurrentOperationInProgress {
                    project: project.to_string(),
                    environment,
                }
            })?,
            Some(wait) => tokio::time::timeout(wait, mutex.lock_owned())
                .await
                .map_err(|_| OrchestratorError::LockTimeout {
                    project: project.to_string(),
                    environment,
                    waited_ms: wait.as_millis() as u64,
                })?,
        };

        let registry = self
            .state
            .load(&key)
            .await?
            .unwrap_or_else(|| SlotRegistry::new(project, environment));
        Ok(RegistryGuard {
            key,
            registry,
            state: &self.state,
            _lock: lock,
        })
    }

    /// Run `f` with exclusive access to the registry and persist what it returns.
    ///
    /// Nothing is written when `f` fails; the lock is released either way.
    pub async fn with_lock<F, Fut, T>(&self, project: &str, environment: Environment, f: F) -> Result<T>
    where
        F: FnOnce(SlotRegistry) -> Fut,
        Fut: Future<Output = Result<(SlotRegistry, T)>>,
    {
        let mut guard = self.lock(project, environment).await?;
        let (updated, value) = f(guard.registry().clone()).await?;
        if &updated != guard.registry() {
            *guard.registry_mut() = updated;
            guard.save().await?;
        }
        Ok(value)
    }

    pub async fn list_keys(&self) -> Result<Vec<RegistryKey>> {
        self.state.list_keys().await
    }

    /// Ports recorded by every slot outside `key`.
    pub async fn claimed_ports(&self, key: &RegistryKey) -> Result<HashSet<u16>> {
        let mut ports = HashSet::new();
        for other in self.list_keys().await? {
            if &other == key {
                continue;
            }
            if let Some(registry) = self.state.load(&other).await? {
                for color in [SlotColor::Blue, SlotColor::Green] {
                    if let Some(port) = registry.slot(color).port {
                        ports.insert(port);
                    }
                }
            }
        }
        Ok(ports)
    }
}
