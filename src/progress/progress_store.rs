use crate::progress::error::ProgressError;
use crate::types::location::{Location, LocationSet};
use crate::types::outcome::FailureKind;
use crate::utils::write_atomic_async;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ProgressState {
    #[serde(default)]
    completed: BTreeSet<String>,
    #[serde(default)]
    failed: BTreeMap<String, FailureRecord>,
}

/// Completed and failed location ids of one year, persisted as JSON.
///
/// Constructed once per run with [`ProgressStore::load`] and passed to the
/// runner. Changes stay in memory until [`ProgressStore::persist`], which
/// replaces the file atomically.
#[derive(Debug)]
pub struct ProgressStore {
    path: PathBuf,
    state: ProgressState,
}

impl ProgressStore {
    /// Reads `path`; a missing file yields an empty store.
    pub async fn load(path: &Path) -> Result<Self, ProgressError> {
        let state = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| ProgressError::Parse(path.to_path_buf(), e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No progress file at {}", path.display());
                ProgressState::default()
            }
            Err(e) => return Err(ProgressError::Read(path.to_path_buf(), e)),
        };
        info!(
            "Loaded progress from {}: {} completed, {} failed",
            path.display(),
            state.completed.len(),
            state.failed.len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            state,
        })
    }

    pub fn is_done(&self, location_id: &str) -> bool {
        self.state.completed.contains(location_id)
    }

    /// Records a success and clears any failure left by an earlier run.
    pub fn mark_done(&mut self, location_id: &str) {
        self.state.failed.remove(location_id);
        self.state.completed.insert(location_id.to_string());
    }

    /// Records a failure. An id completed by an earlier run stays completed;
    /// its output file from that run is still valid.
    pub fn mark_failed(&mut self, location_id: &str, kind: FailureKind, reason: impl Into<String>) {
        self.state.failed.insert(
            location_id.to_string(),
            FailureRecord {
                kind,
                reason: reason.into(),
            },
        );
    }

    pub fn failure(&self, location_id: &str) -> Option<&FailureRecord> {
        self.state.failed.get(location_id)
    }

    pub fn completed_count(&self) -> usize {
        self.state.completed.len()
    }

    pub fn failed_count(&self) -> usize {
        self.state.failed.len()
    }

    /// Locations of `locations` not yet completed, in input order.
    pub fn missing<'a>(&self, locations: &'a LocationSet) -> Vec<&'a Location> {
        locations.iter().filter(|l| !self.is_done(&l.id)).collect()
    }

    pub async fn persist(&self) -> Result<(), ProgressError> {
        let bytes = serde_json::to_vec_pretty(&self.state).map_err(ProgressError::Serialize)?;
        write_atomic_async(&self.path, bytes)
            .await
            .map_err(|e| ProgressError::Persist(self.path.clone(), e))?;
        debug!("Persisted progress to {}", self.path.display());
        Ok(())
    }
}
