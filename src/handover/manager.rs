//! Per-run handover workspace.
//!
//! Layout under `.agent-pipeline/runs/{runId}/`:
//! - `HANDOVER.md` — current state, rewritten as stages complete
//! - `LOG.md` — append-only event log
//! - `stages/{stageName}/output.md` — full output per stage
//!
//! The directory lives inside the execution repository so agent filesystem
//! sandboxes (which scope to the working directory) cover it. In worktree
//! mode the initializer records a mirror path in the main repository and the
//! finalizer copies the directory back.

use super::instructions::{InstructionKind, InstructionLoader, interpolate};
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct HandoverManager {
    run_id: String,
    pipeline_name: String,
    handover_dir: PathBuf,
    loader: InstructionLoader,
}

impl HandoverManager {
    /// Manager for a run rooted at the execution repository.
    ///
    /// `directory_override` comes from `handover.directory` in the pipeline
    /// config; the default is `.agent-pipeline/runs/{runId}`.
    pub fn new(
        execution_repo: &Path,
        run_id: &str,
        pipeline_name: &str,
        directory_override: Option<&Path>,
        custom_instructions: Option<PathBuf>,
    ) -> Self {
        let handover_dir = match directory_override {
            Some(dir) if dir.is_absolute() => dir.to_path_buf(),
            Some(dir) => execution_repo.join(dir),
            None => execution_repo
                .join(".agent-pipeline")
                .join("runs")
                .join(run_id),
        };
        Self {
            run_id: run_id.to_string(),
            pipeline_name: pipeline_name.to_string(),
            handover_dir,
            loader: InstructionLoader::new(execution_repo, custom_instructions),
        }
    }

    /// Create the directory skeleton and seed HANDOVER.md / LOG.md.
    pub fn initialize(&self) -> Result<()> {
        std::fs::create_dir_all(self.handover_dir.join("stages"))
            .context("Failed to create handover directory")?;

        let handover = self.handover_dir.join("HANDOVER.md");
        if !handover.exists() {
            std::fs::write(
                &handover,
                format!(
                    "# Handover — {} (run {})\n\nNo stages have completed yet.\n",
                    self.pipeline_name, self.run_id
                ),
            )
            .context("Failed to seed HANDOVER.md")?;
        }

        let log = self.handover_dir.join("LOG.md");
        if !log.exists() {
            std::fs::write(
                &log,
                format!("# Log — {} (run {})\n", self.pipeline_name, self.run_id),
            )
            .context("Failed to seed LOG.md")?;
        }

        debug!(dir = %self.handover_dir.display(), "initialized handover directory");
        Ok(())
    }

    pub fn handover_dir(&self) -> &Path {
        &self.handover_dir
    }

    pub fn create_stage_directory(&self, stage_name: &str) -> Result<PathBuf> {
        let dir = self.handover_dir.join("stages").join(stage_name);
        std::fs::create_dir_all(&dir).context("Failed to create stage handover directory")?;
        Ok(dir)
    }

    /// Instructions injected into a stage's system prompt.
    pub fn build_context_message(&self, stage_name: &str) -> String {
        let template = self.loader.load(InstructionKind::Handover);
        let mut context = HashMap::new();
        context.insert("handoverDir", self.handover_dir.display().to_string());
        context.insert("stageName", stage_name.to_string());
        context.insert("timestamp", Utc::now().to_rfc3339());
        context.insert("pipelineName", self.pipeline_name.clone());
        interpolate(&template, &context)
    }

    /// Persist a stage's full output under `stages/{name}/output.md`.
    pub fn save_agent_output(&self, stage_name: &str, output: &str) -> Result<()> {
        let dir = self.create_stage_directory(stage_name)?;
        std::fs::write(dir.join("output.md"), output)
            .context("Failed to write stage output")?;
        Ok(())
    }

    /// Append one timestamped entry to LOG.md.
    pub fn append_to_log(&self, entry: &str) -> Result<()> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.handover_dir.join("LOG.md"))
            .context("Failed to open LOG.md")?;
        writeln!(file, "\n- {} — {}", Utc::now().to_rfc3339(), entry)
            .context("Failed to append to LOG.md")?;
        Ok(())
    }
}

/// Recursively copy a handover directory (worktree → main repo mirror).
pub fn copy_dir_recursive(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to).context("Failed to create mirror directory")?;
    for entry in std::fs::read_dir(from).context("Failed to read handover directory")? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(dir: &Path) -> HandoverManager {
        HandoverManager::new(dir, "run-1", "demo", None, None)
    }

    #[test]
    fn initialize_creates_layout() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path());
        m.initialize().unwrap();

        let root = dir.path().join(".agent-pipeline/runs/run-1");
        assert!(root.join("HANDOVER.md").exists());
        assert!(root.join("LOG.md").exists());
        assert!(root.join("stages").is_dir());
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path());
        m.initialize().unwrap();
        m.append_to_log("first entry").unwrap();
        m.initialize().unwrap();

        let log =
            std::fs::read_to_string(m.handover_dir().join("LOG.md")).unwrap();
        assert!(log.contains("first entry"));
    }

    #[test]
    fn save_agent_output_writes_stage_file() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path());
        m.initialize().unwrap();
        m.save_agent_output("review", "verdict: approve").unwrap();

        let path = m.handover_dir().join("stages/review/output.md");
        assert_eq!(std::fs::read_to_string(path).unwrap(), "verdict: approve");
    }

    #[test]
    fn log_is_append_only() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path());
        m.initialize().unwrap();
        m.append_to_log("one").unwrap();
        m.append_to_log("two").unwrap();

        let log = std::fs::read_to_string(m.handover_dir().join("LOG.md")).unwrap();
        let one = log.find("one").unwrap();
        let two = log.find("two").unwrap();
        assert!(one < two);
    }

    #[test]
    fn context_message_interpolates_dir_and_stage() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path());
        let message = m.build_context_message("review");
        assert!(message.contains("review"));
        assert!(message.contains(&m.handover_dir().display().to_string()));
        assert!(!message.contains("{{handoverDir}}"));
    }

    #[test]
    fn directory_override_is_respected() {
        let dir = tempdir().unwrap();
        let m = HandoverManager::new(
            dir.path(),
            "run-2",
            "demo",
            Some(Path::new("custom/handover")),
            None,
        );
        m.initialize().unwrap();
        assert!(dir.path().join("custom/handover/HANDOVER.md").exists());
    }

    #[test]
    fn copy_dir_recursive_mirrors_tree() {
        let from = tempdir().unwrap();
        let to = tempdir().unwrap();
        std::fs::create_dir_all(from.path().join("stages/a")).unwrap();
        std::fs::write(from.path().join("HANDOVER.md"), "state").unwrap();
        std::fs::write(from.path().join("stages/a/output.md"), "out").unwrap();

        let target = to.path().join("mirror");
        copy_dir_recursive(from.path(), &target).unwrap();
        assert_eq!(
            std::fs::read_to_string(target.join("HANDOVER.md")).unwrap(),
            "state"
        );
        assert_eq!(
            std::fs::read_to_string(target.join("stages/a/output.md")).unwrap(),
            "out"
        );
    }
}
