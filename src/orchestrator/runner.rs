//! Top-level pipeline orchestration.
//!
//! `PipelineRunner` drives one run group by group: initialisation (worktree,
//! trigger, handover), condition-gated group execution with the configured
//! failure strategy, the context-reduction hook between groups, and a
//! finalisation phase that always runs — final commit, optional pull
//! request, handover copy-back, state persistence, terminal notification.
//! Loop mode delegates to [`crate::looping::LoopExecutor`], which drives
//! `start_run` / `finalize_run` per iteration so the loop agent can run
//! between the last group and finalisation.

use super::group::{GroupOrchestrator, aggregate_results};
use super::init::{PipelineInitializer, RunContext, RunOptions};
use super::reducer::ContextReducer;
use crate::condition;
use crate::config::{BranchStrategy, FailureAction, PipelineConfig, PullRequestSettings, StageConfig};
use crate::dag::build_execution_plan;
use crate::errors::PipelineError;
use crate::git::{GitManager, WorktreeManager};
use crate::handover::copy_dir_recursive;
use crate::looping::{LOOP_STAGE, LoopExecutor, loop_stage_config};
use crate::notify::{LogNotifier, NotificationEvent, Notifications, Notifier};
use crate::runtime::RuntimeRegistry;
use crate::stage::StageExecutor;
use crate::state::{
    LoopContext, PipelineState, PipelineStatus, PullRequestInfo, StageExecution, StageStatus,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// How the group phase of a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupsOutcome {
    /// Every group ran (stages may still have failed under continue/warn).
    Ran,
    /// A failure with a stop policy ended the run early.
    Stopped,
    Aborted,
}

/// A run that has finished its groups but not yet been finalised.
pub struct ActiveRun {
    pub(crate) ctx: RunContext,
    pub(crate) start: Instant,
    pub(crate) outcome: GroupsOutcome,
}

impl ActiveRun {
    pub fn execution_repo(&self) -> &Path {
        &self.ctx.execution_repo
    }

    pub fn shared(&self) -> &crate::state::SharedState {
        &self.ctx.shared
    }

    pub fn run_id(&self) -> &str {
        &self.ctx.run_id
    }

    pub fn worktree_used(&self) -> bool {
        self.ctx.worktree.is_some()
    }

    pub fn main_repo(&self) -> &Path {
        &self.ctx.main_repo
    }
}

pub struct PipelineRunner {
    project_dir: PathBuf,
    registry: Arc<RuntimeRegistry>,
    notifications: Notifications,
    options: RunOptions,
}

impl PipelineRunner {
    pub fn new(project_dir: PathBuf, registry: Arc<RuntimeRegistry>, options: RunOptions) -> Self {
        Self {
            project_dir,
            registry,
            notifications: Notifications::new().with_channel(Arc::new(LogNotifier)),
            options,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifications = self.notifications.with_channel(notifier);
        self
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn registry(&self) -> &Arc<RuntimeRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub(crate) fn notifications(&self) -> &Notifications {
        &self.notifications
    }

    /// Run a pipeline to completion, looping when loop mode is active.
    pub async fn run_pipeline(
        &self,
        config: &PipelineConfig,
    ) -> Result<PipelineState, PipelineError> {
        let loop_enabled = self.options.loop_enabled
            || config.looping.as_ref().map(|l| l.enabled).unwrap_or(false);
        if loop_enabled {
            LoopExecutor::new(self).run(config).await
        } else {
            let active = self.start_run(config, None, false).await?;
            Ok(self.finalize_run(active, false).await)
        }
    }

    /// Initialise a run and execute every group.
    ///
    /// Kept separate from finalisation so the loop executor can run the
    /// loop agent in between.
    pub(crate) async fn start_run(
        &self,
        config: &PipelineConfig,
        loop_context: Option<LoopContext>,
        suppress_notifications: bool,
    ) -> Result<ActiveRun, PipelineError> {
        // Plan against the effective stage list: loop mode injects the
        // synthetic loop-agent node at the final level for visibility.
        let mut plan_config = config.clone();
        if loop_context.is_some() {
            plan_config.stages.push(loop_stage_config(config));
        }
        let plan = build_execution_plan(&plan_config)?;
        for warning in &plan.warnings {
            warn!(pipeline = %config.name, "{warning}");
        }
        info!(pipeline = %config.name, "{}", plan.describe());

        let abort = self.options.abort.clone().unwrap_or_default();
        let ctx = PipelineInitializer::new(self.project_dir.clone())
            .initialize(config, &self.options, abort)
            .await?;

        if let Some(loop_context) = loop_context {
            ctx.shared.with(|state| state.loop_context = Some(loop_context));
        }

        let notifications = if suppress_notifications {
            Notifications::new()
        } else {
            self.notifications.clone()
        };
        notifications.dispatch(&NotificationEvent::PipelineStarted {
            pipeline: config.name.clone(),
            run_id: ctx.run_id.clone(),
        });

        let executor = Arc::new(
            StageExecutor::new(
                self.registry.clone(),
                ctx.execution_repo.clone(),
                ctx.run_id.clone(),
                ctx.abort.clone(),
            )
            .with_handover(ctx.handover.clone()),
        );
        let orchestrator =
            GroupOrchestrator::new(executor, notifications, config.name.clone());

        let reducer = config
            .settings
            .context_reduction
            .as_ref()
            .filter(|settings| settings.enabled)
            .and_then(|settings| {
                let selection = config.runtime.as_ref().map(|r| r.runtime_type.as_str());
                match self.registry.resolve(selection) {
                    Ok(runtime) => Some(ContextReducer::new(
                        settings.clone(),
                        runtime,
                        ctx.execution_repo.clone(),
                        ctx.abort.clone(),
                    )),
                    Err(e) => {
                        warn!("context reduction disabled: {e}");
                        None
                    }
                }
            });

        let start = Instant::now();
        let mut outcome = GroupsOutcome::Ran;

        'groups: for (group_index, group) in plan.groups.iter().enumerate() {
            if ctx.abort.is_aborted() {
                outcome = GroupsOutcome::Aborted;
                break;
            }

            let runnable = self.gate_group_stages(&ctx, &group.stages);
            if runnable.is_empty() {
                self.persist(&ctx);
                continue;
            }

            if let Some(ref reducer) = reducer {
                reducer.maybe_reduce(&ctx.shared, group, group_index).await;
            }

            let parallel = config.settings.parallel && runnable.len() > 1;
            let result = if parallel {
                orchestrator
                    .execute_parallel_group(&runnable, &ctx.shared, None)
                    .await
            } else {
                orchestrator
                    .execute_sequential_group(&runnable, &ctx.shared, None)
                    .await
            };

            let group_result = match result {
                Ok(group_result) => group_result,
                Err(_) => {
                    outcome = GroupsOutcome::Aborted;
                    self.persist(&ctx);
                    break;
                }
            };

            info!(level = group.level, "{}", aggregate_results(&group_result));
            self.annotate_conditions(&ctx, &runnable);
            self.persist(&ctx);

            for execution in &group_result.executions {
                if execution.status != StageStatus::Failed {
                    continue;
                }
                let action = config
                    .stages
                    .iter()
                    .find(|s| s.name == execution.stage_name)
                    .map(|s| config.failure_action_for(s))
                    .unwrap_or(config.settings.failure_strategy);
                match action {
                    FailureAction::Stop => {
                        warn!(stage = %execution.stage_name, "stage failed with stop policy, halting run");
                        outcome = GroupsOutcome::Stopped;
                        break 'groups;
                    }
                    FailureAction::Warn => {
                        warn!(stage = %execution.stage_name, "stage failed (warn policy), continuing");
                    }
                    FailureAction::Continue => {
                        debug!(stage = %execution.stage_name, "stage failed (continue policy)");
                    }
                }
            }

            if ctx.abort.is_aborted() {
                outcome = GroupsOutcome::Aborted;
                break;
            }
        }

        Ok(ActiveRun {
            ctx,
            start,
            outcome,
        })
    }

    /// Apply enabled/condition gating; returns the stages that should run.
    ///
    /// Skipped stages get terminal `skipped` entries immediately, without
    /// ever passing through `running`.
    fn gate_group_stages(&self, ctx: &RunContext, stages: &[StageConfig]) -> Vec<StageConfig> {
        let mut runnable = Vec::new();
        for stage in stages {
            // The synthetic loop stage is visible in the plan but driven by
            // the loop executor, never the stage executor.
            if stage.name == LOOP_STAGE {
                continue;
            }
            if !stage.enabled {
                ctx.shared
                    .with(|state| state.stages.push(StageExecution::skipped(&stage.name)));
                ctx.shared.notify_changed();
                continue;
            }
            if let Some(ref source) = stage.condition {
                let snapshot = ctx.shared.snapshot();
                let passed = match condition::evaluate_condition(source, &snapshot) {
                    Ok(passed) => passed,
                    Err(e) => {
                        warn!(stage = %stage.name, "condition failed to parse at runtime: {e}");
                        false
                    }
                };
                if !passed {
                    ctx.shared.with(|state| {
                        let mut skipped = StageExecution::skipped(&stage.name);
                        skipped.condition_evaluated = Some(source.clone());
                        skipped.condition_result = Some(false);
                        state.stages.push(skipped);
                    });
                    ctx.shared.notify_changed();
                    info!(stage = %stage.name, "condition false, skipping");
                    continue;
                }
            }
            runnable.push(stage.clone());
        }
        runnable
    }

    /// Record passed conditions on the finished executions.
    fn annotate_conditions(&self, ctx: &RunContext, runnable: &[StageConfig]) {
        for stage in runnable {
            if let Some(ref source) = stage.condition {
                let source = source.clone();
                ctx.shared.update_stage(&stage.name, |execution| {
                    execution.condition_evaluated = Some(source);
                    execution.condition_result = Some(true);
                });
            }
        }
    }

    fn persist(&self, ctx: &RunContext) {
        if let Err(e) = ctx.store.save_run(&ctx.shared.snapshot()) {
            warn!("could not persist run state: {e}");
        }
    }

    /// Finalisation always runs: terminal status, final commit, optional
    /// pull request, handover copy-back, worktree cleanup, persistence,
    /// terminal notification.
    pub(crate) async fn finalize_run(
        &self,
        active: ActiveRun,
        suppress_notifications: bool,
    ) -> PipelineState {
        let ActiveRun { ctx, start, outcome } = active;
        let config = ctx.shared.with(|state| state.pipeline_config.clone());

        let status = ctx.shared.with(|state| {
            let status = match outcome {
                GroupsOutcome::Aborted => PipelineStatus::Aborted,
                GroupsOutcome::Stopped => PipelineStatus::Failed,
                GroupsOutcome::Ran => {
                    // The loop agent's outcome is advisory and never demotes
                    // the run.
                    if state
                        .stages
                        .iter()
                        .any(|e| e.status == StageStatus::Failed && e.stage_name != LOOP_STAGE)
                    {
                        PipelineStatus::Partial
                    } else {
                        PipelineStatus::Completed
                    }
                }
            };
            state.status = status;
            state.artifacts.final_commit = None;
            state.artifacts.total_duration_ms = start.elapsed().as_millis() as u64;
            status
        });

        if let Ok(Some(final_commit)) = GitManager::new(&ctx.execution_repo)
            .current_commit()
            .map_err(|e| warn!("could not read final commit: {e}"))
        {
            ctx.shared
                .with(|state| state.artifacts.final_commit = Some(final_commit));
        }

        if status != PipelineStatus::Aborted && !self.options.dry_run {
            self.maybe_create_pull_request(&ctx, &config).await;
        }

        if let Some(ref mirror) = ctx.handover_mirror
            && let Err(e) = copy_dir_recursive(ctx.handover.handover_dir(), mirror)
        {
            warn!("could not copy handover directory back: {e}");
        }

        if let Some(ref worktree) = ctx.worktree
            && config
                .git
                .as_ref()
                .map(|g| g.branch_strategy == BranchStrategy::UniquePerRun)
                .unwrap_or(false)
        {
            let manager = WorktreeManager::new(
                &ctx.main_repo,
                config.git.as_ref().and_then(|g| g.worktree.directory.clone()),
            );
            if let Err(e) = manager.remove_worktree(&worktree.worktree_path).await {
                warn!("could not remove pipeline worktree: {e}");
            }
        }

        self.persist(&ctx);

        if !suppress_notifications {
            self.notifications.dispatch(&NotificationEvent::PipelineFinished {
                pipeline: config.name.clone(),
                run_id: ctx.run_id.clone(),
                status,
            });
        }

        info!(
            pipeline = %config.name,
            run_id = %ctx.run_id,
            status = status.as_str(),
            "pipeline run finished"
        );
        ctx.shared.snapshot()
    }

    async fn maybe_create_pull_request(&self, ctx: &RunContext, config: &PipelineConfig) {
        let Some(ref git_settings) = config.git else {
            return;
        };
        if !git_settings.pull_request.auto_create {
            return;
        }
        let Some(branch) = ctx.shared.with(|state| state.artifacts.branch_name.clone()) else {
            return;
        };

        match create_pull_request(
            &ctx.execution_repo,
            &branch,
            &git_settings.pull_request,
            config,
            &ctx.shared.snapshot(),
        )
        .await
        {
            Ok(pr) => {
                info!(url = %pr.url, "created pull request");
                ctx.shared
                    .with(|state| state.artifacts.pull_request = Some(pr));
            }
            Err(e) => warn!("could not create pull request: {e}"),
        }
    }
}

/// Push the pipeline branch and open a PR through the GitHub CLI.
async fn create_pull_request(
    execution_repo: &Path,
    branch: &str,
    settings: &PullRequestSettings,
    config: &PipelineConfig,
    state: &PipelineState,
) -> anyhow::Result<PullRequestInfo> {
    run_command(execution_repo, "git", &["push", "-u", "origin", branch]).await?;

    let title = settings
        .title
        .clone()
        .unwrap_or_else(|| format!("[pipeline] {}", config.name));
    let body = settings.body.clone().unwrap_or_else(|| {
        let mut body = format!("Automated pipeline run `{}`.\n\n", state.run_id);
        for execution in &state.stages {
            body.push_str(&format!(
                "- {}: {}\n",
                execution.stage_name,
                execution.status.as_str()
            ));
        }
        body
    });

    let mut args: Vec<String> = vec![
        "pr".into(),
        "create".into(),
        "--head".into(),
        branch.into(),
        "--title".into(),
        title,
        "--body".into(),
        body,
    ];
    if settings.draft {
        args.push("--draft".into());
    }
    for reviewer in &settings.reviewers {
        args.push("--reviewer".into());
        args.push(reviewer.clone());
    }
    for label in &settings.labels {
        args.push("--label".into());
        args.push(label.clone());
    }
    if settings.web {
        args.push("--web".into());
    }

    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let stdout = run_command(execution_repo, "gh", &arg_refs).await?;
    let url = stdout
        .split_whitespace()
        .rev()
        .find(|token| token.starts_with("http"))
        .unwrap_or("")
        .to_string();
    let number = url
        .rsplit('/')
        .next()
        .and_then(|tail| tail.parse::<u64>().ok());

    Ok(PullRequestInfo { url, number })
}

async fn run_command(cwd: &Path, program: &str, args: &[&str]) -> anyhow::Result<String> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|e| anyhow::anyhow!("failed to spawn {program}: {e}"))?;
    if !output.status.success() {
        anyhow::bail!(
            "{program} {} failed: {}",
            args.first().unwrap_or(&""),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{INLINE_AGENT, PipelineSettings};
    use crate::runtime::testing::MockRuntime;
    use tempfile::tempdir;

    fn inline_stage(name: &str) -> StageConfig {
        let mut stage = StageConfig::new(name, INLINE_AGENT);
        stage.prompt = Some(format!("stage {name}"));
        stage
    }

    fn runner_with(dir: &Path, runtime: MockRuntime) -> PipelineRunner {
        let mut registry = RuntimeRegistry::empty();
        registry.register(Arc::new(runtime));
        registry.set_default("mock");
        PipelineRunner::new(
            dir.to_path_buf(),
            Arc::new(registry),
            RunOptions::default(),
        )
    }

    fn no_commit_settings() -> PipelineSettings {
        PipelineSettings {
            auto_commit: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn completed_run_has_all_stage_records() {
        let dir = tempdir().unwrap();
        let runner = runner_with(dir.path(), MockRuntime::succeeding("ok"));
        let mut config = PipelineConfig::new(
            "seq",
            vec![
                inline_stage("a"),
                inline_stage("b").with_depends_on(&["a"]),
            ],
        );
        config.settings = no_commit_settings();

        let state = runner.run_pipeline(&config).await.unwrap();
        assert_eq!(state.status, PipelineStatus::Completed);
        assert_eq!(state.stages.len(), 2);
        assert_eq!(state.stages[0].stage_name, "a");
        assert_eq!(state.stages[1].stage_name, "b");
    }

    #[tokio::test]
    async fn stop_policy_halts_dependent_groups() {
        let dir = tempdir().unwrap();
        let runtime = MockRuntime::succeeding("ok");
        runtime.push_step(crate::runtime::testing::MockStep::Fail(
            "parse error in agent".to_string(),
        ));
        let runner = runner_with(dir.path(), runtime);
        let mut config = PipelineConfig::new(
            "stop",
            vec![
                inline_stage("a"),
                inline_stage("b").with_depends_on(&["a"]),
            ],
        );
        config.settings = no_commit_settings();

        let state = runner.run_pipeline(&config).await.unwrap();
        assert_eq!(state.status, PipelineStatus::Failed);
        assert_eq!(state.stages.len(), 1);
        assert_eq!(state.stages[0].status, StageStatus::Failed);
    }

    #[tokio::test]
    async fn continue_policy_yields_partial() {
        let dir = tempdir().unwrap();
        let runtime = MockRuntime::succeeding("ok");
        runtime.push_step(crate::runtime::testing::MockStep::Fail(
            "parse error in agent".to_string(),
        ));
        let runner = runner_with(dir.path(), runtime);
        let mut config = PipelineConfig::new(
            "cont",
            vec![
                inline_stage("a"),
                inline_stage("b").with_depends_on(&["a"]),
            ],
        );
        config.settings = no_commit_settings();
        config.settings.failure_strategy = FailureAction::Continue;

        let state = runner.run_pipeline(&config).await.unwrap();
        assert_eq!(state.status, PipelineStatus::Partial);
        assert_eq!(state.stages.len(), 2);
        assert_eq!(state.stages[0].status, StageStatus::Failed);
        assert_eq!(state.stages[1].status, StageStatus::Success);
    }

    #[tokio::test]
    async fn disabled_stage_is_skipped() {
        let dir = tempdir().unwrap();
        let runner = runner_with(dir.path(), MockRuntime::succeeding("ok"));
        let mut disabled = inline_stage("off");
        disabled.enabled = false;
        let mut config =
            PipelineConfig::new("skip", vec![inline_stage("on"), disabled]);
        config.settings = no_commit_settings();

        let state = runner.run_pipeline(&config).await.unwrap();
        assert_eq!(state.status, PipelineStatus::Completed);
        let off = state.stage("off").unwrap();
        assert_eq!(off.status, StageStatus::Skipped);
    }

    #[tokio::test]
    async fn false_condition_skips_with_result_recorded() {
        let dir = tempdir().unwrap();
        let runner = runner_with(dir.path(), MockRuntime::succeeding("ok"));
        let mut gated = inline_stage("gated").with_depends_on(&["a"]);
        gated.condition = Some("stages.a.status == \"failed\"".to_string());
        let mut config = PipelineConfig::new("cond", vec![inline_stage("a"), gated]);
        config.settings = no_commit_settings();

        let state = runner.run_pipeline(&config).await.unwrap();
        let gated = state.stage("gated").unwrap();
        assert_eq!(gated.status, StageStatus::Skipped);
        assert_eq!(gated.condition_result, Some(false));
        assert!(gated.condition_evaluated.is_some());
    }

    #[tokio::test]
    async fn true_condition_runs_and_is_annotated() {
        let dir = tempdir().unwrap();
        let runner = runner_with(dir.path(), MockRuntime::succeeding("ok"));
        let mut gated = inline_stage("gated").with_depends_on(&["a"]);
        gated.condition = Some("stages.a.status == \"success\"".to_string());
        let mut config = PipelineConfig::new("cond", vec![inline_stage("a"), gated]);
        config.settings = no_commit_settings();

        let state = runner.run_pipeline(&config).await.unwrap();
        let gated = state.stage("gated").unwrap();
        assert_eq!(gated.status, StageStatus::Success);
        assert_eq!(gated.condition_result, Some(true));
    }

    #[tokio::test]
    async fn invalid_pipeline_is_rejected_before_any_execution() {
        let dir = tempdir().unwrap();
        let runner = runner_with(dir.path(), MockRuntime::succeeding("ok"));
        let config = PipelineConfig::new(
            "bad",
            vec![inline_stage("a").with_depends_on(&["ghost"])],
        );

        let err = runner.run_pipeline(&config).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidPipeline { .. }));
    }

    #[tokio::test]
    async fn abort_before_start_yields_aborted_status() {
        let dir = tempdir().unwrap();
        let abort = crate::abort::AbortController::new();
        abort.abort();

        let mut registry = RuntimeRegistry::empty();
        registry.register(Arc::new(MockRuntime::succeeding("ok")));
        registry.set_default("mock");
        let runner = PipelineRunner::new(
            dir.path().to_path_buf(),
            Arc::new(registry),
            RunOptions {
                abort: Some(abort),
                ..Default::default()
            },
        );
        let mut config = PipelineConfig::new("ab", vec![inline_stage("a")]);
        config.settings = no_commit_settings();

        let state = runner.run_pipeline(&config).await.unwrap();
        assert_eq!(state.status, PipelineStatus::Aborted);
        assert!(state.stages.is_empty());
    }

    #[tokio::test]
    async fn run_state_is_persisted_at_finalisation() {
        let dir = tempdir().unwrap();
        let runner = runner_with(dir.path(), MockRuntime::succeeding("ok"));
        let mut config = PipelineConfig::new("persist", vec![inline_stage("a")]);
        config.settings = no_commit_settings();

        let state = runner.run_pipeline(&config).await.unwrap();
        let loaded = crate::state::StateManager::new(dir.path())
            .load_run(&state.run_id)
            .unwrap();
        assert_eq!(loaded.status, PipelineStatus::Completed);
    }
}
