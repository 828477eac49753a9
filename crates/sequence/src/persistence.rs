//! JSON snapshot persistence for the in-memory engine state.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use outreach_core::error::{OutreachError, OutreachResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::rate_limit::BudgetCounter;
use crate::registry::RegistrySnapshot;
use crate::types::Enrollment;

/// Everything needed to resume scheduling after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub taken_at: DateTime<Utc>,
    pub registry: RegistrySnapshot,
    pub enrollments: Vec<Enrollment>,
    #[serde(default)]
    pub budget: Vec<BudgetCounter>,
}

/// Snapshot file on disk. Writes go to a sibling temp file that is renamed
/// over the target, so readers never see a partial snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, snapshot: &EngineSnapshot) -> OutreachResult<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            OutreachError::Persistence(format!(
                "rename {} -> {}: {e}",
                tmp.display(),
                self.path.display()
            ))
        })?;
        debug!(
            path = %self.path.display(),
            enrollments = snapshot.enrollments.len(),
            bytes = json.len(),
            "Snapshot written"
        );
        Ok(())
    }

    /// `None` when no snapshot exists yet.
    pub fn load(&self) -> OutreachResult<Option<EngineSnapshot>> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "No snapshot found, starting empty");
            return Ok(None);
        }
        let bytes = std::fs::read(&self.path)?;
        let snapshot = serde_json::from_slice(&bytes).map_err(|e| {
            OutreachError::Persistence(format!("corrupt snapshot {}: {e}", self.path.display()))
        })?;
        Ok(Some(snapshot))
    }
}
