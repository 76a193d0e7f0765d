//! Agent-based context reduction between groups.
//!
//! Long pipelines accumulate stage outputs that later prompts replay in the
//! previous-stages section. When the estimated token count for the next
//! stage crosses the configured threshold, a reducer agent summarises the
//! older executions and the state keeps only the summary plus the most
//! recent `context_window` entries. Reduction never runs before the first
//! group and never for the loop stage; reducer failures are logged and
//! swallowed — the pipeline continues with the unreduced state.

use crate::abort::AbortController;
use crate::config::ContextReductionSettings;
use crate::dag::ExecutionGroup;
use crate::runtime::{ExecuteOptions, ExecuteRequest, Runtime};
use crate::state::{SharedState, StageExecution, StageStatus};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Virtual stage name the reducer's execution is recorded under.
pub const REDUCER_STAGE: &str = "__context_reducer__";

/// Hard deadline on the reducer agent itself.
const REDUCER_TIMEOUT: Duration = Duration::from_secs(300);

/// Rough chars-per-token estimate for prompt sizing.
const CHARS_PER_TOKEN: usize = 4;

const REDUCER_INSTRUCTIONS: &str = "\
You summarise pipeline execution history. Given the outputs of previously \
completed stages, produce a compact summary that preserves: decisions made, \
files created or modified, key findings, and unresolved problems. Drop \
conversational filler. The summary replaces the raw outputs as context for \
later stages, so keep every fact a later stage could depend on.";

pub struct ContextReducer {
    settings: ContextReductionSettings,
    runtime: Arc<dyn Runtime>,
    repo_path: PathBuf,
    abort: AbortController,
}

impl ContextReducer {
    pub fn new(
        settings: ContextReductionSettings,
        runtime: Arc<dyn Runtime>,
        repo_path: PathBuf,
        abort: AbortController,
    ) -> Self {
        Self {
            settings,
            runtime,
            repo_path,
            abort,
        }
    }

    /// Estimated prompt tokens for the next group's first enabled stage.
    pub fn estimate_next_tokens(&self, shared: &SharedState, next_group: &ExecutionGroup) -> u64 {
        let Some(stage) = next_group.stages.iter().find(|s| s.enabled) else {
            return 0;
        };
        let prompt = shared.with(|state| crate::stage::build_user_prompt(stage, state));
        (prompt.chars().count() / CHARS_PER_TOKEN) as u64
    }

    /// Run the reducer when warranted. `groups_completed` gates the
    /// never-before-the-first-group rule.
    pub async fn maybe_reduce(
        &self,
        shared: &SharedState,
        next_group: &ExecutionGroup,
        groups_completed: usize,
    ) {
        if !self.settings.enabled || self.settings.strategy != "agent-based" {
            return;
        }
        if groups_completed == 0 {
            return;
        }
        if next_group
            .stages
            .iter()
            .all(|s| s.name == crate::looping::LOOP_STAGE)
        {
            return;
        }

        let estimated = self.estimate_next_tokens(shared, next_group);
        if estimated <= self.settings.threshold_tokens {
            debug!(estimated, threshold = self.settings.threshold_tokens, "no reduction needed");
            return;
        }

        info!(estimated, "context above threshold, running reducer agent");
        if let Err(e) = self.reduce(shared).await {
            warn!("context reduction failed, continuing unreduced: {e}");
        }
    }

    async fn reduce(&self, shared: &SharedState) -> anyhow::Result<()> {
        let window = self.settings.context_window;
        let history = shared.with(|state| {
            let keep_from = state.stages.len().saturating_sub(window);
            state.stages[..keep_from]
                .iter()
                .filter(|e| e.status == StageStatus::Success)
                .map(|e| {
                    format!(
                        "### {}\n{}\n",
                        e.stage_name,
                        e.agent_output.as_deref().unwrap_or("")
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        });
        if history.is_empty() {
            return Ok(());
        }

        let mut options = ExecuteOptions::new(self.repo_path.clone(), REDUCER_TIMEOUT.as_secs());
        options.permission_mode = crate::config::PermissionMode::Plan;
        let request = ExecuteRequest {
            system_prompt: REDUCER_INSTRUCTIONS.to_string(),
            user_prompt: format!("## Stage history\n\n{history}"),
            options,
        };

        let outcome = tokio::time::timeout(
            REDUCER_TIMEOUT,
            self.runtime.execute(request, Some(&self.abort)),
        )
        .await
        .map_err(|_| anyhow::anyhow!("reducer agent timed out"))??;

        shared.with(|state| {
            let keep_from = state.stages.len().saturating_sub(window);
            let recent: Vec<StageExecution> = state.stages.split_off(keep_from);
            let mut summary = StageExecution::running(REDUCER_STAGE, 0);
            summary.agent_output = Some(outcome.text_output.clone());
            summary.token_usage = outcome.token_usage;
            summary.set_status(StageStatus::Success);
            state.stages = vec![summary];
            state.stages.extend(recent);
        });
        shared.notify_changed();
        info!(window, "replaced older stage history with reducer summary");
        Ok(())
    }
}
