//! Run one stage end to end.
//!
//! The executor owns the full per-stage sequence: insert the running entry,
//! resolve the runtime, assemble prompts, drive the runtime under the retry
//! handler and the stage timeout, commit resulting file changes, and extract
//! structured outputs. Stage failures are captured into the execution record
//! and returned — only cooperative abort escapes as an error.

use super::{extract, prompt};
use crate::abort::{AbortController, KILL_GRACE};
use crate::config::{INLINE_AGENT, PermissionMode, StageConfig};
use crate::errors::{AbortedError, StageRunError};
use crate::git::GitManager;
use crate::handover::HandoverManager;
use crate::retry::{self, RetryPolicy};
use crate::runtime::{ExecuteOptions, ExecuteRequest, OutputCallback, RuntimeRegistry};
use crate::state::{SharedState, StageErrorInfo, StageExecution, StageStatus};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct StageExecutor {
    registry: Arc<RuntimeRegistry>,
    /// Execution repository — the worktree when one is active.
    repo_path: PathBuf,
    run_id: String,
    /// Serialises `stage all -> commit` across concurrent stages; the git
    /// index is shared per worktree.
    git_lock: Arc<Mutex<()>>,
    handover: Option<Arc<HandoverManager>>,
    abort: AbortController,
}

impl StageExecutor {
    pub fn new(
        registry: Arc<RuntimeRegistry>,
        repo_path: PathBuf,
        run_id: String,
        abort: AbortController,
    ) -> Self {
        Self {
            registry,
            repo_path,
            run_id,
            git_lock: Arc::new(Mutex::new(())),
            handover: None,
            abort,
        }
    }

    pub fn with_handover(mut self, handover: Arc<HandoverManager>) -> Self {
        self.handover = Some(handover);
        self
    }

    pub fn repo_path(&self) -> &std::path::Path {
        &self.repo_path
    }

    /// Execute one stage against the shared run state.
    ///
    /// Returns the finished execution record; `Err` only on abort.
    pub async fn execute_stage(
        &self,
        stage: &StageConfig,
        shared: &SharedState,
        on_output: Option<OutputCallback>,
    ) -> Result<StageExecution, AbortedError> {
        let policy = stage.retry.clone().unwrap_or_default();
        let max_retries = policy.max_attempts.saturating_sub(1);

        if shared.begin_stage(&stage.name, max_retries) {
            shared.notify_changed();
        }

        if self.abort.is_aborted() {
            return Err(self.mark_aborted(stage, shared));
        }

        match self.drive_stage(stage, shared, &policy, on_output).await {
            Ok(()) => {}
            Err(error) if error.is::<AbortedError>() || self.abort.is_aborted() => {
                return Err(self.mark_aborted(stage, shared));
            }
            Err(error) => {
                let message = error.to_string();
                warn!(stage = %stage.name, "stage failed: {message}");
                shared.update_stage(&stage.name, |execution| {
                    execution.fail(
                        StageErrorInfo::new(&message)
                            .with_agent_path(&stage.agent)
                            .with_stack(format!("{error:?}")),
                    );
                });
                shared.notify_changed();
            }
        }

        Ok(self.finished_entry(stage, shared))
    }

    /// The fallible middle of stage execution; errors become stage failures.
    async fn drive_stage(
        &self,
        stage: &StageConfig,
        shared: &SharedState,
        policy: &RetryPolicy,
        on_output: Option<OutputCallback>,
    ) -> anyhow::Result<()> {
        let config = shared.with(|state| state.pipeline_config.clone());

        let selection = stage.runtime.as_ref().or(config.runtime.as_ref());
        let runtime = self
            .registry
            .resolve(selection.map(|s| s.runtime_type.as_str()))?;

        let mut system_prompt = self.load_system_prompt(stage, shared)?;
        if let Some(ref handover) = self.handover {
            handover.create_stage_directory(&stage.name).ok();
            system_prompt.push_str("\n\n");
            system_prompt.push_str(&handover.build_context_message(&stage.name));
        }

        let user_prompt = shared.with(|state| prompt::build_user_prompt(stage, state));

        let mut options = ExecuteOptions::new(self.repo_path.clone(), stage.timeout);
        options.permission_mode = selection
            .and_then(|s| s.permission_mode)
            .unwrap_or(PermissionMode::AcceptEdits);
        options.model = selection.and_then(|s| s.model.clone());
        options.output_keys = stage.output_keys.clone();
        options.on_output = on_output;
        if let Some(s) = selection {
            options.runtime_options = s.options.clone();
        }

        let request = ExecuteRequest {
            system_prompt,
            user_prompt,
            options,
        };

        debug!(stage = %stage.name, runtime = %runtime.name(), "executing stage");
        let timeout_secs = stage.timeout;
        let deadline = Duration::from_secs(timeout_secs) + KILL_GRACE;
        let abort = self.abort.clone();
        let outcome = retry::execute_with_retry(
            |_attempt| {
                let request = request.clone();
                let runtime = runtime.clone();
                let abort = abort.clone();
                async move {
                    match tokio::time::timeout(deadline, runtime.execute(request, Some(&abort)))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(StageRunError::Timeout { timeout_secs }.into()),
                    }
                }
            },
            policy,
            Some(&self.abort),
            |notice| {
                info!(
                    stage = %stage.name,
                    attempt = notice.attempt_number,
                    max = notice.max_attempts,
                    delay = %retry::format_delay(*notice.delays.last().expect("delay recorded")),
                    "retrying stage: {}",
                    notice.last_error
                );
                let attempt = notice.attempt_number;
                shared.update_stage(&stage.name, |execution| {
                    execution.retry_attempt = attempt;
                });
            },
        )
        .await?;

        let extracted = outcome
            .extracted_data
            .clone()
            .or_else(|| extract::extract_outputs(&outcome.text_output, &stage.output_keys));

        let commit_sha = if config.auto_commit_for(stage) {
            self.commit_stage_changes(stage).await
        } else {
            None
        };

        if let Some(ref handover) = self.handover {
            handover
                .save_agent_output(&stage.name, &outcome.text_output)
                .ok();
            handover
                .append_to_log(&format!("stage '{}' completed", stage.name))
                .ok();
        }

        shared.update_stage(&stage.name, |execution| {
            execution.agent_output = Some(outcome.text_output.clone());
            execution.extracted_data = extracted.clone();
            execution.token_usage = outcome.token_usage;
            execution.commit_sha = commit_sha.clone();
            execution.set_status(StageStatus::Success);
        });
        shared.notify_changed();
        Ok(())
    }

    fn load_system_prompt(
        &self,
        stage: &StageConfig,
        shared: &SharedState,
    ) -> anyhow::Result<String> {
        let raw = if stage.agent == INLINE_AGENT {
            stage.prompt.clone().unwrap_or_default()
        } else {
            let path = if std::path::Path::new(&stage.agent).is_absolute() {
                PathBuf::from(&stage.agent)
            } else {
                self.repo_path.join(&stage.agent)
            };
            std::fs::read_to_string(&path)
                .map_err(|source| StageRunError::PromptReadFailed { path, source })?
        };
        Ok(shared.with(|state| prompt::interpolate(&raw, stage, state)))
    }

    /// Commit a dirty tree under the per-run git mutex.
    ///
    /// Git problems here are recoverable: the stage result stands, the
    /// commit is just missing.
    async fn commit_stage_changes(&self, stage: &StageConfig) -> Option<String> {
        let _guard = self.git_lock.lock().await;
        let git = GitManager::new(&self.repo_path);
        match git.create_pipeline_commit(
            &stage.name,
            &self.run_id,
            stage.commit_message.as_deref(),
        ) {
            Ok(sha) if sha.is_empty() => None,
            Ok(sha) => {
                debug!(stage = %stage.name, sha = %sha, "committed stage changes");
                Some(sha)
            }
            Err(e) => {
                warn!(stage = %stage.name, "could not commit stage changes: {e}");
                None
            }
        }
    }

    fn mark_aborted(&self, stage: &StageConfig, shared: &SharedState) -> AbortedError {
        shared.update_stage(&stage.name, |execution| {
            execution.fail(StageErrorInfo::new("Agent execution aborted"));
        });
        shared.notify_changed();
        AbortedError
    }

    fn finished_entry(&self, stage: &StageConfig, shared: &SharedState) -> StageExecution {
        shared
            .snapshot()
            .stage(&stage.name)
            .cloned()
            .unwrap_or_else(|| StageExecution::skipped(&stage.name))
    }
}
