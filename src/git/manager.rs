//! Repository operations for the pipeline engine.
//!
//! The manager holds only the repository path and opens the repository per
//! operation, so it stays `Send + Sync` and safe to share across stage
//! tasks. Engine commits carry `Pipeline-Run-ID` and `Pipeline-Stage`
//! trailers so runs can be audited from history alone.

use crate::errors::GitError;
use git2::{DiffOptions, Repository, Signature};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name and email used for engine-produced commits.
const COMMIT_AUTHOR: (&str, &str) = ("agent-pipeline", "agent-pipeline@localhost");

#[derive(Debug, Clone)]
pub struct GitManager {
    repo_path: PathBuf,
}

impl GitManager {
    pub fn new(repo_path: &Path) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn open(&self) -> Result<Repository, GitError> {
        Repository::open(&self.repo_path).map_err(|e| GitError::Open {
            path: self.repo_path.clone(),
            message: e.message().to_string(),
        })
    }

    /// Current HEAD SHA; `None` on an unborn branch.
    pub fn current_commit(&self) -> Result<Option<String>, GitError> {
        let repo = self.open()?;
        Ok(head_commit(&repo).map(|c| c.id().to_string()))
    }

    /// Files changed by a commit, diffed against its first parent.
    ///
    /// Root commits have no parent; fall back to listing the full tree.
    pub fn changed_files(&self, sha: &str) -> Result<Vec<String>, GitError> {
        let repo = self.open()?;
        let oid = git2::Oid::from_str(sha).map_err(|e| GitError::UnknownRevision {
            sha: sha.to_string(),
            message: e.message().to_string(),
        })?;
        let commit = repo.find_commit(oid).map_err(|e| GitError::UnknownRevision {
            sha: sha.to_string(),
            message: e.message().to_string(),
        })?;
        let tree = commit.tree()?;

        let mut files = Vec::new();
        match commit.parent(0) {
            Ok(parent) => {
                let parent_tree = parent.tree()?;
                let mut opts = DiffOptions::new();
                let diff = repo.diff_tree_to_tree(
                    Some(&parent_tree),
                    Some(&tree),
                    Some(&mut opts),
                )?;
                diff.foreach(
                    &mut |delta, _| {
                        if let Some(path) = delta.new_file().path() {
                            files.push(path.to_string_lossy().to_string());
                        }
                        true
                    },
                    None,
                    None,
                    None,
                )?;
            }
            Err(_) => {
                tree.walk(git2::TreeWalkMode::PreOrder, |dir, entry| {
                    if entry.kind() == Some(git2::ObjectType::Blob)
                        && let Some(name) = entry.name()
                    {
                        files.push(format!("{dir}{name}"));
                    }
                    git2::TreeWalkResult::Ok
                })?;
            }
        }
        Ok(files)
    }

    pub fn has_uncommitted_changes(&self) -> Result<bool, GitError> {
        let repo = self.open()?;
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true).include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }

    /// Stage every change, including untracked files.
    pub fn stage_all_changes(&self) -> Result<(), GitError> {
        let repo = self.open()?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;
        Ok(())
    }

    /// Commit the index with the given message plus trailers.
    ///
    /// Handles the unborn-branch case by creating a parentless commit.
    pub fn commit_with_metadata(
        &self,
        message: &str,
        trailers: &[(&str, &str)],
    ) -> Result<String, GitError> {
        let repo = self.open()?;
        let mut index = repo.index()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Signature::now(COMMIT_AUTHOR.0, COMMIT_AUTHOR.1)?;

        let mut full_message = message.to_string();
        if !trailers.is_empty() {
            full_message.push_str("\n\n");
            for (key, value) in trailers {
                full_message.push_str(&format!("{key}: {value}\n"));
            }
        }

        let commit_id = match head_commit(&repo) {
            Some(parent) => repo.commit(
                Some("HEAD"),
                &sig,
                &sig,
                &full_message,
                &tree,
                &[&parent],
            )?,
            None => repo.commit(Some("HEAD"), &sig, &sig, &full_message, &tree, &[])?,
        };

        debug!(sha = %commit_id, "created commit");
        Ok(commit_id.to_string())
    }

    /// Commit a stage's file changes with pipeline metadata.
    ///
    /// Clean tree is a no-op returning the empty string.
    pub fn create_pipeline_commit(
        &self,
        stage_name: &str,
        run_id: &str,
        custom_message: Option<&str>,
    ) -> Result<String, GitError> {
        if !self.has_uncommitted_changes()? {
            return Ok(String::new());
        }
        self.stage_all_changes()?;
        let message = custom_message.unwrap_or("automated changes");
        let subject = format!("[pipeline:{stage_name}] {message}");
        self.commit_with_metadata(
            &subject,
            &[("Pipeline-Run-ID", run_id), ("Pipeline-Stage", stage_name)],
        )
    }

    /// Hard reset to a commit.
    pub fn revert_to_commit(&self, sha: &str) -> Result<(), GitError> {
        let repo = self.open()?;
        let oid = git2::Oid::from_str(sha).map_err(|e| GitError::UnknownRevision {
            sha: sha.to_string(),
            message: e.message().to_string(),
        })?;
        let object = repo.find_object(oid, None)?;
        repo.reset(&object, git2::ResetType::Hard, None)?;
        Ok(())
    }

    pub fn commit_message(&self, sha: &str) -> Result<String, GitError> {
        let repo = self.open()?;
        let oid = git2::Oid::from_str(sha).map_err(|e| GitError::UnknownRevision {
            sha: sha.to_string(),
            message: e.message().to_string(),
        })?;
        let commit = repo.find_commit(oid)?;
        Ok(commit.message().unwrap_or_default().to_string())
    }
}

fn head_commit(repo: &Repository) -> Option<git2::Commit<'_>> {
    repo.head().ok().and_then(|head| head.peel_to_commit().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn setup_repo() -> (GitManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        let manager = GitManager::new(dir.path());
        (manager, dir)
    }

    fn write_and_commit(manager: &GitManager, dir: &Path, name: &str, content: &str) -> String {
        fs::write(dir.join(name), content).unwrap();
        manager
            .create_pipeline_commit("setup", "run-0", Some("seed"))
            .unwrap()
    }

    #[test]
    fn current_commit_none_on_unborn_branch() {
        let (manager, _dir) = setup_repo();
        assert!(manager.current_commit().unwrap().is_none());
    }

    #[test]
    fn create_pipeline_commit_clean_tree_is_noop() {
        let (manager, dir) = setup_repo();
        write_and_commit(&manager, dir.path(), "a.txt", "one");

        let before = manager.current_commit().unwrap();
        let sha = manager
            .create_pipeline_commit("review", "run-1", None)
            .unwrap();
        assert_eq!(sha, "");
        assert_eq!(manager.current_commit().unwrap(), before);
    }

    #[test]
    fn pipeline_commit_has_subject_and_trailers() {
        let (manager, dir) = setup_repo();
        fs::write(dir.path().join("out.md"), "agent output").unwrap();

        let sha = manager
            .create_pipeline_commit("review", "run-abc", Some("reviewed the diff"))
            .unwrap();
        assert_eq!(sha.len(), 40);

        let message = manager.commit_message(&sha).unwrap();
        assert!(message.starts_with("[pipeline:review] reviewed the diff"));
        assert!(message.contains("Pipeline-Run-ID: run-abc"));
        assert!(message.contains("Pipeline-Stage: review"));
    }

    #[test]
    fn default_commit_message_when_none_given() {
        let (manager, dir) = setup_repo();
        fs::write(dir.path().join("x.txt"), "x").unwrap();
        let sha = manager.create_pipeline_commit("fix", "run-1", None).unwrap();
        let message = manager.commit_message(&sha).unwrap();
        assert!(message.starts_with("[pipeline:fix] automated changes"));
    }

    #[test]
    fn changed_files_against_parent() {
        let (manager, dir) = setup_repo();
        write_and_commit(&manager, dir.path(), "first.txt", "1");
        fs::write(dir.path().join("second.txt"), "2").unwrap();
        let sha = manager
            .create_pipeline_commit("stage", "run-1", None)
            .unwrap();

        let files = manager.changed_files(&sha).unwrap();
        assert_eq!(files, vec!["second.txt"]);
    }

    #[test]
    fn changed_files_root_commit_lists_full_tree() {
        let (manager, dir) = setup_repo();
        let sha = write_and_commit(&manager, dir.path(), "only.txt", "1");

        let files = manager.changed_files(&sha).unwrap();
        assert_eq!(files, vec!["only.txt"]);
    }

    #[test]
    fn changed_files_unknown_revision_errors() {
        let (manager, dir) = setup_repo();
        write_and_commit(&manager, dir.path(), "a.txt", "1");
        let err = manager
            .changed_files("deadbeefdeadbeefdeadbeefdeadbeefdeadbeef")
            .unwrap_err();
        assert!(matches!(err, GitError::UnknownRevision { .. }));
    }

    #[test]
    fn has_uncommitted_changes_tracks_dirt() {
        let (manager, dir) = setup_repo();
        write_and_commit(&manager, dir.path(), "a.txt", "1");
        assert!(!manager.has_uncommitted_changes().unwrap());

        fs::write(dir.path().join("b.txt"), "2").unwrap();
        assert!(manager.has_uncommitted_changes().unwrap());
    }

    #[test]
    fn revert_to_commit_restores_tree() {
        let (manager, dir) = setup_repo();
        let first = write_and_commit(&manager, dir.path(), "a.txt", "original");
        fs::write(dir.path().join("a.txt"), "mutated").unwrap();
        manager
            .create_pipeline_commit("stage", "run-1", None)
            .unwrap();

        manager.revert_to_commit(&first).unwrap();
        let content = fs::read_to_string(dir.path().join("a.txt")).unwrap();
        assert_eq!(content, "original");
    }
}
