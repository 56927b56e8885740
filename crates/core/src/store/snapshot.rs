use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::Job;

const BACKUP_SUFFIX: &str = "bak";

#[derive(Serialize)]
struct SnapshotDocumentRef<'a> {
    jobs: &'a [Job],
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotDocument {
    Wrapped { jobs: Vec<Job> },
    Bare(Vec<Job>),
}

impl SnapshotDocument {
    fn into_jobs(self) -> Vec<Job> {
        match self {
            Self::Wrapped { jobs } | Self::Bare(jobs) => jobs,
        }
    }
}

/// JSON snapshot file plus its `.bak` sibling.
#[derive(Debug, Clone)]
pub(crate) struct SnapshotFile {
    path: PathBuf,
    backup_path: PathBuf,
}

impl SnapshotFile {
    pub(crate) fn new(path: PathBuf) -> Self {
        let backup_path = backup_path_for(&path);
        Self { path, backup_path }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Load the primary snapshot, falling back to the backup and finally to an
    /// empty job list. Never fails.
    pub(crate) fn load_jobs_for_startup(&self) -> Vec<Job> {
        match read_jobs(&self.path) {
            Ok(Some(jobs)) => {
                info!(
                    restored_count = jobs.len(),
                    snapshot = %self.path.display(),
                    "Restored jobs from snapshot"
                );
                return jobs;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(
                    error = %format!("{err:#}"),
                    snapshot = %self.path.display(),
                    "Primary job snapshot unreadable; trying backup"
                );
            }
        }

        match read_jobs(&self.backup_path) {
            Ok(Some(jobs)) => {
                warn!(
                    restored_count = jobs.len(),
                    backup = %self.backup_path.display(),
                    "Restored jobs from backup snapshot"
                );
                jobs
            }
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(
                    error = %format!("{err:#}"),
                    backup = %self.backup_path.display(),
                    "Backup job snapshot unreadable; starting with an empty store"
                );
                Vec::new()
            }
        }
    }

    /// Copy the current primary to the backup path, then overwrite the primary.
    pub(crate) fn write_jobs(&self, jobs: &[Job]) -> Result<()> {
        let encoded = serde_json::to_vec_pretty(&SnapshotDocumentRef { jobs })
            .context("failed to serialize job snapshot")?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create snapshot directory: {}", parent.display())
                })?;
            }
        }

        if self.path.exists() {
            if let Err(err) = fs::copy(&self.path, &self.backup_path) {
                warn!(
                    error = %err,
                    backup = %self.backup_path.display(),
                    "Failed to refresh job snapshot backup"
                );
            }
        }

        fs::write(&self.path, encoded)
            .with_context(|| format!("failed to write job snapshot: {}", self.path.display()))
    }
}

fn backup_path_for(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(".");
    raw.push(BACKUP_SUFFIX);
    PathBuf::from(raw)
}

fn read_jobs(path: &Path) -> Result<Option<Vec<Job>>> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read job snapshot: {}", path.display()))?;
    if raw.trim().is_empty() {
        anyhow::bail!("job snapshot is empty: {}", path.display());
    }

    let document: SnapshotDocument = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse job snapshot: {}", path.display()))?;
    Ok(Some(document.into_jobs()))
}
