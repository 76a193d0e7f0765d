//! JSON persistence for run state and loop sessions.
//!
//! Layout under the repository root:
//! - `.agent-pipeline/state/runs/{runId}.json`
//! - `.agent-pipeline/state/loops/{sessionId}.json`

use super::PipelineState;
use crate::looping::LoopSession;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct StateManager {
    runs_dir: PathBuf,
    loops_dir: PathBuf,
}

impl StateManager {
    /// Create a manager rooted at the repository.
    pub fn new(repo_root: &Path) -> Self {
        let state_dir = repo_root.join(".agent-pipeline").join("state");
        Self {
            runs_dir: state_dir.join("runs"),
            loops_dir: state_dir.join("loops"),
        }
    }

    pub fn save_run(&self, state: &PipelineState) -> Result<()> {
        std::fs::create_dir_all(&self.runs_dir).context("Failed to create runs state dir")?;
        let path = self.runs_dir.join(format!("{}.json", state.run_id));
        let json =
            serde_json::to_string_pretty(state).context("Failed to serialize run state")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write run state to {}", path.display()))?;
        debug!(run_id = %state.run_id, "persisted run state");
        Ok(())
    }

    pub fn load_run(&self, run_id: &str) -> Result<PipelineState> {
        let path = self.runs_dir.join(format!("{run_id}.json"));
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("No persisted run at {}", path.display()))?;
        serde_json::from_str(&text).context("Failed to parse run state")
    }

    /// Run IDs with persisted state, newest file first.
    pub fn list_runs(&self) -> Result<Vec<String>> {
        list_json_stems(&self.runs_dir)
    }

    pub fn save_loop_session(&self, session: &LoopSession) -> Result<()> {
        std::fs::create_dir_all(&self.loops_dir).context("Failed to create loops state dir")?;
        let path = self.loops_dir.join(format!("{}.json", session.session_id));
        let json =
            serde_json::to_string_pretty(session).context("Failed to serialize loop session")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write loop session to {}", path.display()))?;
        Ok(())
    }

    pub fn load_loop_session(&self, session_id: &str) -> Result<LoopSession> {
        let path = self.loops_dir.join(format!("{session_id}.json"));
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("No persisted loop session at {}", path.display()))?;
        serde_json::from_str(&text).context("Failed to parse loop session")
    }

    pub fn list_loop_sessions(&self) -> Result<Vec<String>> {
        list_json_stems(&self.loops_dir)
    }
}

fn list_json_stems(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut entries: Vec<(std::time::SystemTime, String)> = Vec::new();
    for entry in std::fs::read_dir(dir).context("Failed to read state directory")? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        entries.push((modified, stem.to_string()));
    }
    entries.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(entries.into_iter().map(|(_, stem)| stem).collect())
}
