//! Filesystem implementation of CheckpointStore
//!
//! Layout: one directory per workflow under the store root, one
//! `<version>.json` file per checkpoint plus an optional `retain` marker
//! holding the retention deadline. Writes go to a `.tmp` file in the same
//! directory and are published with an atomic rename, so a crash mid-write
//! never yields a readable partial blob.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use mahavishnu_core::{Error, Result, WorkflowId};

use super::checkpoint::{enforce_size_cap, Checkpoint, CheckpointFilter, CheckpointStore};

/// Filesystem-backed checkpoint store
///
/// # Example
///
/// ```ignore
/// use mahavishnu_orchestrator::persistence::FsCheckpointStore;
///
/// let store = FsCheckpointStore::new("./data/checkpoints", 4 * 1024 * 1024).await?;
/// ```
pub struct FsCheckpointStore {
    root: PathBuf,
    max_size_bytes: usize,
    /// Serializes writers; version precedence still decides conflicts
    write_lock: Mutex<()>,
}

impl FsCheckpointStore {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn new(root: impl Into<PathBuf>, max_size_bytes: usize) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            max_size_bytes,
            write_lock: Mutex::new(()),
        })
    }

    fn workflow_dir(&self, workflow_id: WorkflowId) -> PathBuf {
        self.root.join(workflow_id.to_string())
    }

    async fn scan_versions(dir: &Path) -> Result<Vec<u64>> {
        let mut versions = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(versions),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".json") {
                if let Ok(version) = stem.parse::<u64>() {
                    versions.push(version);
                }
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    async fn read_checkpoint(dir: &Path, version: u64) -> Result<Checkpoint> {
        let bytes = tokio::fs::read(dir.join(format!("{version}.json"))).await?;
        serde_json::from_slice(&bytes).map_err(Into::into)
    }

    async fn read_retention(dir: &Path) -> Option<DateTime<Utc>> {
        let raw = tokio::fs::read_to_string(dir.join("retain")).await.ok()?;
        raw.trim().parse().ok()
    }

    async fn workflow_dirs(&self) -> Result<Vec<(WorkflowId, PathBuf)>> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            match name.parse::<WorkflowId>() {
                Ok(id) => out.push((id, entry.path())),
                Err(_) => warn!(dir = %name, "skipping non-workflow directory"),
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn put(
        &self,
        workflow_id: WorkflowId,
        step: &str,
        state: &serde_json::Value,
        expected_version: u64,
    ) -> Result<u64> {
        enforce_size_cap(workflow_id, state, self.max_size_bytes)?;

        let _guard = self.write_lock.lock().await;

        let dir = self.workflow_dir(workflow_id);
        tokio::fs::create_dir_all(&dir).await?;

        let latest = Self::scan_versions(&dir).await?.last().copied().unwrap_or(0);
        if latest != expected_version {
            return Err(Error::conflict("checkpoint version is stale")
                .with_context("workflow_id", workflow_id)
                .with_context("expected", expected_version)
                .with_context("latest", latest));
        }

        let version = latest + 1;
        let checkpoint = Checkpoint {
            workflow_id,
            step: step.to_string(),
            state: state.clone(),
            version,
            created_at: Utc::now(),
        };

        // Write-temp-then-rename keeps the publish atomic
        let tmp = dir.join(format!("{version}.json.tmp"));
        let final_path = dir.join(format!("{version}.json"));
        tokio::fs::write(&tmp, serde_json::to_vec(&checkpoint)?).await?;
        tokio::fs::rename(&tmp, &final_path).await?;

        debug!(%workflow_id, step, version, "checkpoint committed");
        Ok(version)
    }

    async fn get_latest(&self, workflow_id: WorkflowId) -> Result<Option<Checkpoint>> {
        let dir = self.workflow_dir(workflow_id);
        match Self::scan_versions(&dir).await?.last() {
            Some(&version) => Ok(Some(Self::read_checkpoint(&dir, version).await?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, workflow_id: WorkflowId) -> Result<()> {
        let dir = self.workflow_dir(workflow_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self, filter: CheckpointFilter) -> Result<Vec<Checkpoint>> {
        let dirs = match filter.workflow_id {
            Some(id) => vec![(id, self.workflow_dir(id))],
            None => self.workflow_dirs().await?,
        };

        let mut out = Vec::new();
        for (_, dir) in dirs {
            let mut versions = Self::scan_versions(&dir).await?;
            versions.reverse();
            for version in versions {
                out.push(Self::read_checkpoint(&dir, version).await?);
                if filter.limit > 0 && out.len() >= filter.limit {
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }

    async fn retain_until(&self, workflow_id: WorkflowId, until: DateTime<Utc>) -> Result<()> {
        let dir = self.workflow_dir(workflow_id);
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::write(dir.join("retain"), until.to_rfc3339()).await?;
        }
        Ok(())
    }

    async fn gc_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut collected = 0;
        for (id, dir) in self.workflow_dirs().await? {
            if let Some(until) = Self::read_retention(&dir).await {
                if until <= now {
                    self.delete(id).await?;
                    collected += 1;
                }
            }
        }
        Ok(collected)
    }

    async fn probe_writable(&self) -> Result<()> {
        let probe = self.root.join(".writable-probe");
        tokio::fs::write(&probe, b"ok").await?;
        tokio::fs::remove_file(&probe).await?;
        Ok(())
    }
}
