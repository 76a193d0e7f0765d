//! Session-scoped loop queue directories.
//!
//! Layout under `{repo}/.agent-pipeline/loops/{sessionId}/`:
//! `pending/` (produced by the loop agent, waiting), `running/` (claimed),
//! `finished/` and `failed/` (terminal, by run outcome). Pipelines move
//! between directories by rename; a pipeline loaded from `pending/` ends up
//! in exactly one of `finished/` or `failed/`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct LoopQueue {
    root: PathBuf,
}

impl LoopQueue {
    pub fn new(repo_root: &Path, session_id: &str) -> Self {
        Self {
            root: repo_root
                .join(".agent-pipeline")
                .join("loops")
                .join(session_id),
        }
    }

    /// Root a queue at an explicit directory (the `looping.directories`
    /// override).
    pub fn at(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.root.join("pending")
    }

    pub fn running_dir(&self) -> PathBuf {
        self.root.join("running")
    }

    pub fn finished_dir(&self) -> PathBuf {
        self.root.join("finished")
    }

    pub fn failed_dir(&self) -> PathBuf {
        self.root.join("failed")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            self.pending_dir(),
            self.running_dir(),
            self.finished_dir(),
            self.failed_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create loop dir {}", dir.display()))?;
        }
        Ok(())
    }

    /// Pending pipeline files, oldest modification time first.
    pub fn scan_pending(&self) -> Result<Vec<PathBuf>> {
        let mut entries: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
        for pattern in ["*.yml", "*.yaml"] {
            let full = self.pending_dir().join(pattern);
            for entry in glob::glob(&full.to_string_lossy())
                .context("Failed to read pending glob")?
                .flatten()
            {
                let modified = std::fs::metadata(&entry)
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                entries.push((modified, entry));
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries.into_iter().map(|(_, path)| path).collect())
    }

    /// Move the oldest pending pipeline into `running/` and return its new
    /// path. `None` when the queue is dry.
    pub fn claim_oldest(&self) -> Result<Option<PathBuf>> {
        let Some(oldest) = self.scan_pending()?.into_iter().next() else {
            return Ok(None);
        };
        let file_name = oldest
            .file_name()
            .context("pending pipeline has no file name")?;
        let target = self.running_dir().join(file_name);
        std::fs::rename(&oldest, &target)
            .with_context(|| format!("Failed to claim {}", oldest.display()))?;
        debug!(pipeline = %target.display(), "claimed pending pipeline");
        Ok(Some(target))
    }

    /// Move a claimed pipeline to its terminal directory by run outcome.
    pub fn complete(&self, running_path: &Path, succeeded: bool) -> Result<PathBuf> {
        let file_name = running_path
            .file_name()
            .context("running pipeline has no file name")?;
        let target_dir = if succeeded {
            self.finished_dir()
        } else {
            self.failed_dir()
        };
        let target = target_dir.join(file_name);
        std::fs::rename(running_path, &target)
            .with_context(|| format!("Failed to move {}", running_path.display()))?;
        debug!(pipeline = %target.display(), succeeded, "completed loop pipeline");
        Ok(target)
    }
}
