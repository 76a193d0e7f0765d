//! Run state tracking.
//!
//! `PipelineState` is the mutable record of one run: the frozen config, the
//! trigger, one `StageExecution` per started (or skipped) stage, and the run
//! artifacts. It lives behind [`SharedState`] — a mutex-wrapped handle whose
//! `snapshot()` feeds listeners, so UI-style observers never need reference
//! identity into live state.

mod store;

pub use store::StateManager;

use crate::config::{PipelineConfig, Trigger};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Terminal and non-terminal run statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    #[default]
    Running,
    Completed,
    Failed,
    /// Finished, but some stages failed under a continue/warn policy.
    Partial,
    Aborted,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Partial => "partial",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Per-stage lifecycle: pending → running → {success | failed | skipped}.
///
/// `skipped` is terminal and entered without passing through `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }
}

/// Error detail carried on a failed stage execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageErrorInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_path: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl StageErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        let suggestion = crate::errors::suggestion_for(&message);
        Self {
            message,
            stack: None,
            agent_path: None,
            timestamp: Utc::now(),
            suggestion,
        }
    }

    pub fn with_agent_path(mut self, path: impl Into<String>) -> Self {
        self.agent_path = Some(path.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// Token accounting reported by a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", default)]
pub struct TokenUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_input: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_input: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u64>,
}

impl TokenUsage {
    /// Field access by name for the condition language.
    pub fn field(&self, name: &str) -> Option<u64> {
        match name {
            "estimated_input" => self.estimated_input,
            "actual_input" => self.actual_input,
            "output" => self.output,
            "cache_creation" => self.cache_creation,
            "cache_read" => self.cache_read,
            "thinking" => self.thinking,
            "num_turns" => self.num_turns,
            _ => None,
        }
    }
}

/// Execution record of one stage within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageExecution {
    pub stage_name: String,
    pub status: StageStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_data: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageErrorInfo>,
    pub retry_attempt: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_evaluated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_result: Option<bool>,
}

impl StageExecution {
    /// Fresh `running` entry for a stage about to execute.
    pub fn running(stage_name: &str, max_retries: u32) -> Self {
        Self {
            stage_name: stage_name.to_string(),
            status: StageStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            commit_sha: None,
            agent_output: None,
            extracted_data: None,
            token_usage: None,
            error: None,
            retry_attempt: 0,
            max_retries,
            condition_evaluated: None,
            condition_result: None,
        }
    }

    /// Terminal `skipped` entry; never passes through `running`.
    pub fn skipped(stage_name: &str) -> Self {
        let now = Utc::now();
        Self {
            stage_name: stage_name.to_string(),
            status: StageStatus::Skipped,
            start_time: now,
            end_time: Some(now),
            duration_ms: Some(0),
            commit_sha: None,
            agent_output: None,
            extracted_data: None,
            token_usage: None,
            error: None,
            retry_attempt: 0,
            max_retries: 0,
            condition_evaluated: None,
            condition_result: None,
        }
    }

    /// Transition to a new status. Terminal states are immutable: attempts
    /// to leave them are ignored.
    pub fn set_status(&mut self, status: StageStatus) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        if status.is_terminal() {
            let end = Utc::now();
            self.end_time = Some(end);
            self.duration_ms = Some(
                (end - self.start_time).num_milliseconds().max(0) as u64,
            );
        }
    }

    pub fn fail(&mut self, error: StageErrorInfo) {
        self.error = Some(error);
        self.set_status(StageStatus::Failed);
    }
}

/// What started the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerInfo {
    #[serde(rename = "type")]
    pub trigger: Trigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TriggerInfo {
    pub fn manual() -> Self {
        Self {
            trigger: Trigger::Manual,
            commit_sha: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestInfo {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u64>,
}

/// Artifacts accumulated over one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RunArtifacts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_commit: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changed_files: Vec<String>,
    pub total_duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handover_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequestInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

/// Why a loop terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationReason {
    Natural,
    Failure,
    Aborted,
    LimitReached,
}

/// Where the currently running pipeline definition came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineSource {
    /// The pipeline the user invoked.
    #[default]
    Seed,
    /// Loaded from the loop pending queue.
    LoopPending,
}

/// Loop bookkeeping attached to a run when loop mode is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopContext {
    pub enabled: bool,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub session_id: String,
    pub pipeline_source: PipelineSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,
}

/// The mutable record of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub run_id: String,
    pub pipeline_config: PipelineConfig,
    pub trigger: TriggerInfo,
    pub stages: Vec<StageExecution>,
    pub status: PipelineStatus,
    pub artifacts: RunArtifacts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_context: Option<LoopContext>,
}

impl PipelineState {
    pub fn new(run_id: String, config: PipelineConfig, trigger: TriggerInfo) -> Self {
        Self {
            run_id,
            pipeline_config: config,
            trigger,
            stages: Vec::new(),
            status: PipelineStatus::Running,
            artifacts: RunArtifacts::default(),
            loop_context: None,
        }
    }

    /// Most recent execution entry for a stage name.
    pub fn stage(&self, name: &str) -> Option<&StageExecution> {
        self.stages.iter().rev().find(|e| e.stage_name == name)
    }

    pub fn stage_mut(&mut self, name: &str) -> Option<&mut StageExecution> {
        self.stages.iter_mut().rev().find(|e| e.stage_name == name)
    }

    /// Successful executions in insertion order (prompt context, reduction).
    pub fn successful_stages(&self) -> Vec<&StageExecution> {
        self.stages
            .iter()
            .filter(|e| e.status == StageStatus::Success)
            .collect()
    }

    pub fn failed_stages(&self) -> Vec<&StageExecution> {
        self.stages
            .iter()
            .filter(|e| e.status == StageStatus::Failed)
            .collect()
    }
}

/// Listener invoked with a state snapshot after each mutation batch.
pub type StateListener = Arc<dyn Fn(&PipelineState) + Send + Sync>;

/// Mutex-wrapped shared handle to the run state.
///
/// Critical sections are short and synchronous (no awaits inside), so a
/// std mutex is sufficient; worker tasks funnel their results back through
/// the driver rather than holding the lock across IO.
#[derive(Clone)]
pub struct SharedState {
    inner: Arc<Mutex<PipelineState>>,
    listeners: Arc<Mutex<Vec<StateListener>>>,
}

impl SharedState {
    pub fn new(state: PipelineState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Run a closure against the locked state.
    pub fn with<R>(&self, f: impl FnOnce(&mut PipelineState) -> R) -> R {
        let mut guard = self.inner.lock().expect("pipeline state poisoned");
        f(&mut guard)
    }

    /// Owned copy for listeners, persistence, and summaries.
    pub fn snapshot(&self) -> PipelineState {
        self.inner.lock().expect("pipeline state poisoned").clone()
    }

    pub fn subscribe(&self, listener: StateListener) {
        self.listeners
            .lock()
            .expect("state listeners poisoned")
            .push(listener);
    }

    /// Invoke every listener with a fresh snapshot.
    pub fn notify_changed(&self) {
        let snapshot = self.snapshot();
        let listeners = self.listeners.lock().expect("state listeners poisoned");
        for listener in listeners.iter() {
            listener(&snapshot);
        }
    }

    /// Insert a `running` entry for a stage unless one is already in flight.
    ///
    /// Returns true when a new entry was inserted. The parallel group
    /// executor batch-inserts before spawning; the stage executor calls this
    /// again and finds the entry already present.
    pub fn begin_stage(&self, stage_name: &str, max_retries: u32) -> bool {
        self.with(|state| {
            let in_flight = state
                .stage(stage_name)
                .map(|e| e.status == StageStatus::Running)
                .unwrap_or(false);
            if in_flight {
                return false;
            }
            state
                .stages
                .push(StageExecution::running(stage_name, max_retries));
            true
        })
    }

    /// Apply a mutation to the most recent entry for a stage.
    pub fn update_stage(&self, stage_name: &str, f: impl FnOnce(&mut StageExecution)) {
        self.with(|state| {
            if let Some(execution) = state.stage_mut(stage_name) {
                f(execution);
            }
        });
    }
}
