//! Run initialisation: identity, worktree, trigger capture, handover wiring.

use crate::abort::AbortController;
use crate::config::PipelineConfig;
use crate::errors::PipelineError;
use crate::git::{GitManager, WorktreeManager, WorktreeSetup};
use crate::handover::HandoverManager;
use crate::state::{
    PipelineState, SharedState, StateManager, TriggerInfo,
};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Options for one `run_pipeline` invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub interactive: bool,
    pub verbose: bool,
    /// Skip worktree setup and PR creation.
    pub dry_run: bool,
    /// Force loop mode even when the config leaves it disabled.
    pub loop_enabled: bool,
    pub max_loop_iterations: Option<u32>,
    pub abort: Option<AbortController>,
}

/// Everything a run needs, assembled once up front.
pub struct RunContext {
    pub run_id: String,
    /// The user's repository.
    pub main_repo: PathBuf,
    /// Where stages actually execute: the worktree when one is active.
    pub execution_repo: PathBuf,
    pub worktree: Option<WorktreeSetup>,
    pub handover: Arc<HandoverManager>,
    /// Main-repo path the handover dir is copied back to in worktree mode.
    pub handover_mirror: Option<PathBuf>,
    pub shared: SharedState,
    pub store: StateManager,
    pub abort: AbortController,
}

pub struct PipelineInitializer {
    project_dir: PathBuf,
}

impl PipelineInitializer {
    pub fn new(project_dir: PathBuf) -> Self {
        Self { project_dir }
    }

    /// Set up a run: generate the run id, create the worktree when git
    /// integration is configured, capture the trigger commit, initialise the
    /// handover workspace, and persist the initial state.
    ///
    /// Worktree setup failures are fatal for the run.
    pub async fn initialize(
        &self,
        config: &PipelineConfig,
        options: &RunOptions,
        abort: AbortController,
    ) -> Result<RunContext, PipelineError> {
        let run_id = Uuid::new_v4().to_string();
        info!(pipeline = %config.name, run_id = %run_id, "initializing pipeline run");

        let worktree = if let Some(ref git_settings) = config.git
            && git_settings.worktree.enabled
            && !options.dry_run
        {
            let manager = WorktreeManager::new(
                &self.project_dir,
                git_settings.worktree.directory.clone(),
            );
            let setup = manager
                .setup_pipeline_worktree(
                    &config.name,
                    &run_id,
                    git_settings.base_branch.as_deref(),
                    git_settings.branch_strategy,
                    &git_settings.branch_prefix,
                )
                .await?;
            Some(setup)
        } else {
            None
        };

        let execution_repo = worktree
            .as_ref()
            .map(|w| w.worktree_path.clone())
            .unwrap_or_else(|| self.project_dir.clone());

        // Trigger commit and its changed files, when the repo has history.
        let git = GitManager::new(&execution_repo);
        let trigger_commit = git.current_commit().ok().flatten();
        let changed_files = match trigger_commit.as_deref() {
            Some(sha) => git.changed_files(sha).unwrap_or_default(),
            None => Vec::new(),
        };

        let handover_settings = config.handover.clone().unwrap_or_default();
        let handover = Arc::new(HandoverManager::new(
            &execution_repo,
            &run_id,
            &config.name,
            handover_settings.directory.as_deref(),
            handover_settings.custom_instructions_path.clone(),
        ));
        if let Err(e) = handover.initialize() {
            warn!("could not initialize handover directory: {e}");
        }
        // In worktree mode the handover lives inside the worktree (agent
        // sandboxes scope to the working directory); remember where it gets
        // copied back to.
        let handover_mirror = worktree.as_ref().map(|_| {
            self.project_dir
                .join(".agent-pipeline")
                .join("runs")
                .join(&run_id)
        });

        let trigger = TriggerInfo {
            trigger: config.trigger,
            commit_sha: trigger_commit.clone(),
            timestamp: Utc::now(),
        };

        let mut state = PipelineState::new(run_id.clone(), config.clone(), trigger);
        state.artifacts.initial_commit = trigger_commit;
        state.artifacts.changed_files = changed_files;
        state.artifacts.handover_dir = Some(handover.handover_dir().to_path_buf());
        state.artifacts.worktree_path = worktree.as_ref().map(|w| w.worktree_path.clone());
        state.artifacts.branch_name = worktree.as_ref().map(|w| w.branch_name.clone());
        state.artifacts.log_path = Some(
            self.project_dir
                .join(".agent-pipeline")
                .join("logs")
                .join(format!("{}.log", config.name)),
        );

        let store = StateManager::new(&self.project_dir);
        if let Err(e) = store.save_run(&state) {
            warn!("could not persist initial run state: {e}");
        }

        debug!(
            execution_repo = %execution_repo.display(),
            worktree = worktree.is_some(),
            "run initialized"
        );

        Ok(RunContext {
            run_id,
            main_repo: self.project_dir.clone(),
            execution_repo,
            worktree,
            handover,
            handover_mirror,
            shared: SharedState::new(state),
            store,
            abort,
        })
    }
}
