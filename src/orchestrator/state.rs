//! Checkpoint Store: durable, single-owner storage of per-issue checkpoints.
//!
//! Layout under the state directory:
//!
//! ```text
//! checkpoints/
//!   .lock        # exclusive lock held by the owning orchestrator
//!   24.json
//!   25.json
//! ```

use crate::errors::{ConfigurationError, OrchestratorError, OrchestratorResult};
use crate::issue::IssueId;
use crate::orchestrator::checkpoint::Checkpoint;
use crate::util::write_atomic;
use anyhow::Context;
use fs2::FileExt;
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = ".lock";

pub struct CheckpointStore {
    dir: PathBuf,
    /// Held for the life of the store; dropping it releases the lock.
    lock: Option<File>,
}

impl CheckpointStore {
    /// Open the store and take ownership of it.
    ///
    /// Fails with `StoreLocked` if another orchestrator instance holds it.
    pub fn open(dir: &Path) -> OrchestratorResult<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create checkpoint directory: {}", dir.display()))?;

        let lock_path = dir.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;

        if lock.try_lock_exclusive().is_err() {
            return Err(OrchestratorError::StoreLocked { path: lock_path });
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            lock: Some(lock),
        })
    }

    /// Open for inspection only (status, dry runs). Never writes.
    pub fn open_read_only(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            lock: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, issue: IssueId) -> PathBuf {
        self.dir.join(format!("{}.json", issue.0))
    }

    fn ensure_owner(&self) -> OrchestratorResult<()> {
        if self.lock.is_none() {
            return Err(anyhow::anyhow!(
                "Checkpoint store at {} was opened read-only",
                self.dir.display()
            )
            .into());
        }
        Ok(())
    }

    /// Persist a checkpoint. The previous record stays intact until the
    /// new one is fully written.
    pub fn save(&self, checkpoint: &Checkpoint) -> OrchestratorResult<()> {
        self.ensure_owner()?;
        let json = serde_json::to_string_pretty(checkpoint)
            .context("Failed to serialize checkpoint")?;
        write_atomic(&self.path_for(checkpoint.issue_id), &json)?;
        tracing::debug!(
            issue = %checkpoint.issue_id,
            completed = checkpoint.completed_phases.len(),
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Load the checkpoint for an issue, `None` if there is none.
    pub fn load(&self, issue: IssueId) -> OrchestratorResult<Option<Checkpoint>> {
        let path = self.path_for(issue);
        if !path.exists() {
            return Ok(None);
        }
        let checkpoint = Self::read(&path)?;
        if checkpoint.issue_id != issue {
            return Err(ConfigurationError::InvalidCheckpoint {
                path,
                message: format!(
                    "record belongs to issue {}, not {}",
                    checkpoint.issue_id, issue
                ),
            }
            .into());
        }
        Ok(Some(checkpoint))
    }

    fn read(path: &Path) -> OrchestratorResult<Checkpoint> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read checkpoint: {}", path.display()))?;
        let checkpoint: Checkpoint =
            serde_json::from_str(&content).map_err(|e| ConfigurationError::InvalidCheckpoint {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        checkpoint
            .validate()
            .map_err(|message| ConfigurationError::InvalidCheckpoint {
                path: path.to_path_buf(),
                message,
            })?;
        Ok(checkpoint)
    }

    /// Delete the checkpoint for an issue. Returns whether one existed.
    pub fn delete(&self, issue: IssueId) -> OrchestratorResult<bool> {
        self.ensure_owner()?;
        let path = self.path_for(issue);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)
            .with_context(|| format!("Failed to delete checkpoint: {}", path.display()))?;
        tracing::debug!(issue = %issue, "Checkpoint deleted");
        Ok(true)
    }

    /// Ids of every issue with a retained checkpoint, valid or not.
    pub fn retained_ids(&self) -> OrchestratorResult<BTreeSet<IssueId>> {
        let mut ids = BTreeSet::new();
        if !self.dir.exists() {
            return Ok(ids);
        }
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list checkpoints in {}", self.dir.display()))?;
        for entry in entries {
            let path = entry.context("Failed to read checkpoint directory entry")?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                ids.insert(IssueId(id));
            }
        }
        Ok(ids)
    }

    /// Every retained checkpoint, ordered by issue id.
    ///
    /// Records that fail to parse are returned as errors alongside the
    /// valid ones so a single bad file does not hide the rest.
    pub fn list(&self) -> OrchestratorResult<Vec<Result<Checkpoint, ConfigurationError>>> {
        let mut results = Vec::new();
        for id in self.retained_ids()? {
            match Self::read(&self.path_for(id)) {
                Ok(cp) => results.push(Ok(cp)),
                Err(OrchestratorError::Configuration(e)) => results.push(Err(e)),
                Err(other) => return Err(other),
            }
        }
        Ok(results)
    }
}
