//! Pipeline worktrees: isolated checkouts on dedicated branches.
//!
//! Stage mutations happen in a worktree so the user's working copy is never
//! touched. Branch naming follows the configured strategy:
//! - `reusable`: `{prefix}/{pipeline}` — reset to the base branch per run,
//!   one worktree per (repo, branch), reused when present
//! - `unique-per-run`: `{prefix}/{pipeline}/{runId}` — fresh every run
//!
//! Worktree plumbing shells out to the `git` binary; libgit2's worktree
//! coverage does not include checkout-on-add. Concurrent runs sharing a
//! reusable branch are the caller's responsibility.

use crate::config::BranchStrategy;
use crate::errors::GitError;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct WorktreeSetup {
    pub worktree_path: PathBuf,
    pub branch_name: String,
}

pub struct WorktreeManager {
    repo_root: PathBuf,
    /// Override for where worktrees are created; defaults to a sibling of
    /// the repository named `{repo}-worktrees`.
    directory: Option<PathBuf>,
}

impl WorktreeManager {
    pub fn new(repo_root: &Path, directory: Option<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            directory,
        }
    }

    fn worktree_root(&self) -> PathBuf {
        if let Some(ref dir) = self.directory {
            return dir.clone();
        }
        let name = self
            .repo_root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "repo".to_string());
        self.repo_root
            .parent()
            .unwrap_or(&self.repo_root)
            .join(format!("{name}-worktrees"))
    }

    /// Create (or reuse) the worktree for a pipeline run.
    pub async fn setup_pipeline_worktree(
        &self,
        pipeline_name: &str,
        run_id: &str,
        base_branch: Option<&str>,
        strategy: BranchStrategy,
        prefix: &str,
    ) -> Result<WorktreeSetup, GitError> {
        let pipeline_slug = slugify(pipeline_name);
        let branch_name = match strategy {
            BranchStrategy::Reusable => format!("{prefix}/{pipeline_slug}"),
            BranchStrategy::UniquePerRun => format!("{prefix}/{pipeline_slug}/{run_id}"),
        };
        let base = match base_branch {
            Some(branch) => branch.to_string(),
            None => self.current_branch().await?,
        };

        let worktree_path = self.worktree_root().join(branch_name.replace('/', "-"));
        tokio::fs::create_dir_all(self.worktree_root())
            .await
            .map_err(|e| GitError::WorktreeSetup(e.to_string()))?;

        if worktree_path.exists() && strategy == BranchStrategy::Reusable {
            // Reuse the checkout, resetting the branch back onto base.
            self.git_in(&worktree_path, &["checkout", &branch_name]).await?;
            self.git_in(&worktree_path, &["reset", "--hard", &base]).await?;
            self.git_in(&worktree_path, &["clean", "-fd"]).await?;
            info!(path = %worktree_path.display(), branch = %branch_name, "reusing pipeline worktree");
            return Ok(WorktreeSetup {
                worktree_path,
                branch_name,
            });
        }

        if worktree_path.exists() {
            return Err(GitError::WorktreeSetup(format!(
                "worktree path {} already exists for a unique-per-run branch",
                worktree_path.display()
            )));
        }

        let path_arg = worktree_path.to_string_lossy().to_string();
        let add_args: Vec<&str> = match strategy {
            // -B resets an existing reusable branch onto base.
            BranchStrategy::Reusable => {
                vec!["worktree", "add", &path_arg, "-B", &branch_name, &base]
            }
            BranchStrategy::UniquePerRun => {
                vec!["worktree", "add", &path_arg, "-b", &branch_name, &base]
            }
        };
        self.git_in(&self.repo_root, &add_args).await?;

        info!(path = %worktree_path.display(), branch = %branch_name, "created pipeline worktree");
        Ok(WorktreeSetup {
            worktree_path,
            branch_name,
        })
    }

    /// Remove a worktree checkout, keeping its branch.
    pub async fn remove_worktree(&self, worktree_path: &Path) -> Result<(), GitError> {
        if !worktree_path.exists() {
            return Ok(());
        }
        let path_arg = worktree_path.to_string_lossy().to_string();
        self.git_in(
            &self.repo_root,
            &["worktree", "remove", "--force", &path_arg],
        )
        .await?;
        self.git_in(&self.repo_root, &["worktree", "prune"]).await?;
        debug!(path = %worktree_path.display(), "removed pipeline worktree");
        Ok(())
    }

    async fn current_branch(&self) -> Result<String, GitError> {
        let output = self
            .git_in(&self.repo_root, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        Ok(output.trim().to_string())
    }

    async fn git_in(&self, cwd: &Path, args: &[&str]) -> Result<String, GitError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .map_err(|e| GitError::Command(format!("git {}: {e}", args.join(" "))))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GitError::WorktreeSetup(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn slugify(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
