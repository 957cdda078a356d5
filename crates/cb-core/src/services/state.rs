use std::path::{Path, PathBuf};

use crate::error::{OrchestratorError, Result};
use crate::models::{RegistryKey, SlotRegistry};

/// One JSON file per registry, replaced atomically so readers never see a partial write.
pub struct SlotStateStore {
    registries_dir: PathBuf,
}

impl SlotStateStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            registries_dir: state_dir.join("registries"),
        }
    }

    fn path_for(&self, key: &RegistryKey) -> PathBuf {
        self.registries_dir.join(format!("{}.json", key.file_stem()))
    }

    pub async fn load(&self, key: &RegistryKey) -> Result<Option<SlotRegistry>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let json = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| OrchestratorError::State(format!("failed to read {}: {e}", path.display())))?;
        let registry: SlotRegistry = serde_json::from_str(&json)?;
        Ok(Some(registry))
    }

    pub async fn save(&self, key: &RegistryKey, registry: &SlotRegistry) -> Result<()> {
        tokio::fs::create_dir_all(&self.registries_dir)
            .await
            .map_err(|e| OrchestratorError::State(format!("failed to create state dir: {e}")))?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(registry)?;
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| OrchestratorError::State(format!("failed to write state file: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| OrchestratorError::State(format!("failed to replace state file: {e}")))?;
        Ok(())
    }

    /// Keys of every persisted registry, sorted.
    pub async fn list_keys(&self) -> Result<Vec<RegistryKey>> {
        if !self.registries_dir.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.registries_dir)
            .await
            .map_err(|e| OrchestratorError::State(format!("reading state dir: {e}")))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| OrchestratorError::State(format!("reading state entry: {e}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(RegistryKey::from_file_stem)
            {
                Some(key) => keys.push(key),
                None => tracing::warn!(path = %path.display(), "ignoring unrecognised state file"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}
