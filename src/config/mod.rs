//! Pipeline configuration model.
//!
//! Pipelines are defined as YAML documents under
//! `.agent-pipeline/pipelines/*.yml`; the types here are the deserialized
//! form plus the load-time defaults. Field names stay camelCase on the wire
//! so definitions written for the original tooling keep working.

mod loader;

pub use loader::{load_pipeline_config, parse_pipeline_yaml, validate_config};

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Sentinel agent path meaning "the prompt is provided inline".
pub const INLINE_AGENT: &str = "__inline__";

/// Default stage timeout in seconds.
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 120;

/// Timeouts above this produce a validation warning.
pub const STAGE_TIMEOUT_SOFT_CAP_SECS: u64 = 900;

/// What started the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Trigger {
    #[default]
    Manual,
    PostCommit,
    PreCommit,
    PrePush,
    PostMerge,
}

/// What to do when a stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailureAction {
    #[default]
    Stop,
    Continue,
    Warn,
}

/// Permission mode forwarded to the agent runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

/// Runtime selection, overridable per stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSelection {
    #[serde(rename = "type")]
    pub runtime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<PermissionMode>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: serde_json::Map<String, serde_json::Value>,
}

/// One stage of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageConfig {
    pub name: String,
    /// Path to a markdown prompt file, or [`INLINE_AGENT`].
    pub agent: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Wall-clock deadline in seconds for the runtime call.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_fail: Option<FailureAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_commit: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeSelection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_keys: Vec<String>,
    /// Inline system prompt, used when `agent` is [`INLINE_AGENT`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl StageConfig {
    /// Minimal stage for tests and synthetic stages.
    pub fn new(name: &str, agent: &str) -> Self {
        Self {
            name: name.to_string(),
            agent: agent.to_string(),
            depends_on: Vec::new(),
            enabled: true,
            condition: None,
            timeout: DEFAULT_STAGE_TIMEOUT_SECS,
            retry: None,
            on_fail: None,
            auto_commit: None,
            commit_message: None,
            inputs: BTreeMap::new(),
            runtime: None,
            output_keys: Vec::new(),
            prompt: None,
        }
    }

    pub fn with_depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|s| s.to_string()).collect();
        self
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    DEFAULT_STAGE_TIMEOUT_SECS
}

/// Pipeline-level execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSettings {
    /// Run independent stages of one DAG level concurrently.
    pub parallel: bool,
    pub failure_strategy: FailureAction,
    /// Commit stage file changes automatically unless the stage opts out.
    pub auto_commit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_reduction: Option<ContextReductionSettings>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            parallel: true,
            failure_strategy: FailureAction::Stop,
            auto_commit: true,
            context_reduction: None,
        }
    }
}

/// Agent-based context reduction between groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextReductionSettings {
    pub enabled: bool,
    pub strategy: String,
    /// Estimated-token threshold above which the reducer runs.
    pub threshold_tokens: u64,
    /// How many recent stage executions survive a reduction.
    pub context_window: usize,
}

impl Default for ContextReductionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: "agent-based".to_string(),
            threshold_tokens: 50_000,
            context_window: 3,
        }
    }
}

/// Branch lifecycle for pipeline worktrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BranchStrategy {
    #[default]
    Reusable,
    UniquePerRun,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct WorktreeSettings {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PullRequestSettings {
    pub auto_create: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub draft: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reviewers: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    /// Open the PR in a browser instead of printing the URL.
    pub web: bool,
}

/// Git integration settings for a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GitSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    pub branch_strategy: BranchStrategy,
    pub branch_prefix: String,
    pub worktree: WorktreeSettings,
    pub pull_request: PullRequestSettings,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            base_branch: None,
            branch_strategy: BranchStrategy::Reusable,
            branch_prefix: "pipeline".to_string(),
            worktree: WorktreeSettings::default(),
            pull_request: PullRequestSettings::default(),
        }
    }
}

/// Loop mode: consume newly produced pipeline files from a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoopSettings {
    pub enabled: bool,
    pub max_iterations: u32,
    /// Custom loop-agent instruction template path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<PathBuf>,
    /// Override for the queue directory root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directories: Option<PathBuf>,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_iterations: 100,
            instructions: None,
            directories: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HandoverSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_instructions_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationSettings {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,
}

/// A complete pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub trigger: Trigger,
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub settings: PipelineSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<NotificationSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub looping: Option<LoopSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handover: Option<HandoverSettings>,
}

impl PipelineConfig {
    /// Minimal pipeline for tests.
    pub fn new(name: &str, stages: Vec<StageConfig>) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            trigger: Trigger::Manual,
            stages,
            settings: PipelineSettings::default(),
            git: None,
            notifications: None,
            looping: None,
            runtime: None,
            handover: None,
        }
    }

    /// Effective failure action for a stage: the stage override wins.
    pub fn failure_action_for(&self, stage: &StageConfig) -> FailureAction {
        stage.on_fail.unwrap_or(self.settings.failure_strategy)
    }

    /// Effective auto-commit flag for a stage.
    pub fn auto_commit_for(&self, stage: &StageConfig) -> bool {
        stage.auto_commit.unwrap_or(self.settings.auto_commit)
    }
}

/// Outcome of pure validation: never an error, always a report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}
