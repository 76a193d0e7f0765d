//! Iteration driver for loop mode.

use super::LOOP_STAGE;
use super::queue::LoopQueue;
use super::session::{IterationStatus, LoopStateManager};
use crate::config::{LoopSettings, PipelineConfig, load_pipeline_config};
use crate::errors::PipelineError;
use crate::handover::{InstructionKind, InstructionLoader, copy_dir_recursive, interpolate};
use crate::notify::NotificationEvent;
use crate::orchestrator::{ActiveRun, PipelineRunner};
use crate::runtime::{ExecuteOptions, ExecuteRequest};
use crate::state::{
    LoopContext, PipelineSource, PipelineState, PipelineStatus, StageStatus, StateManager,
    TerminationReason,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Hard deadline on the loop agent itself.
const LOOP_AGENT_TIMEOUT: Duration = Duration::from_secs(300);

pub struct LoopExecutor<'a> {
    runner: &'a PipelineRunner,
}

impl<'a> LoopExecutor<'a> {
    pub fn new(runner: &'a PipelineRunner) -> Self {
        Self { runner }
    }

    /// Drive iterations until a termination condition fires.
    ///
    /// Returns the state of the last completed run. Per-iteration
    /// notifications are suppressed; one terminal notification fires when
    /// the loop ends.
    pub async fn run(&self, seed: &PipelineConfig) -> Result<PipelineState, PipelineError> {
        let settings = seed.looping.clone().unwrap_or(LoopSettings {
            enabled: true,
            ..Default::default()
        });
        let max_iterations = self
            .runner
            .options()
            .max_loop_iterations
            .unwrap_or(settings.max_iterations)
            .max(1);
        let session_id = Uuid::new_v4().to_string();
        info!(session = %session_id, max_iterations, "starting loop session");

        let mut sessions = LoopStateManager::new(
            StateManager::new(self.runner.project_dir()),
            session_id.clone(),
            max_iterations,
        );
        let main_queue = queue_for(self.runner.project_dir(), &settings, &session_id);
        main_queue
            .ensure_directories()
            .map_err(PipelineError::Other)?;

        let mut current_config = seed.clone();
        let mut current_source = PipelineSource::Seed;
        // Claimed queue file (in `running/`) for the current iteration.
        let mut claimed: Option<PathBuf> = None;
        let mut last_state: Option<PipelineState> = None;
        let mut reason = TerminationReason::Natural;

        for iteration in 1..=max_iterations {
            sessions.begin_iteration(iteration, &current_config.name);
            let loop_context = LoopContext {
                enabled: true,
                current_iteration: iteration,
                max_iterations,
                session_id: session_id.clone(),
                pipeline_source: current_source.clone(),
                termination_reason: None,
            };

            let active = match self
                .runner
                .start_run(&current_config, Some(loop_context), true)
                .await
            {
                Ok(active) => active,
                Err(e) => {
                    if iteration == 1 {
                        // The seed pipeline never started; surface the error.
                        sessions.terminate(TerminationReason::Failure).ok();
                        return Err(e);
                    }
                    warn!(iteration, "loop iteration failed to start: {e}");
                    sessions.finish_iteration(None, IterationStatus::Failed, None, false);
                    reason = TerminationReason::Failure;
                    break;
                }
            };

            // Queue directories live in the execution repo so the sandboxed
            // loop agent can write into them.
            let exec_queue = queue_for(active.execution_repo(), &settings, &session_id);
            if let Err(e) = exec_queue.ensure_directories() {
                warn!("could not create loop queue directories: {e}");
            }

            self.run_loop_agent(&active, &current_config, &settings, &exec_queue, iteration, max_iterations)
                .await;

            if active.worktree_used() && exec_queue.root() != main_queue.root() {
                if let Err(e) = copy_dir_recursive(exec_queue.root(), main_queue.root()) {
                    warn!("could not mirror loop queue back to main repo: {e}");
                }
            }

            let state = self.runner.finalize_run(active, true).await;

            // A pipeline that came from pending/ lands in finished/ or
            // failed/ depending on how its run ended; seed pipelines are
            // never moved.
            if let Some(path) = claimed.take() {
                let succeeded = matches!(
                    state.status,
                    PipelineStatus::Completed | PipelineStatus::Partial
                );
                if let Err(e) = main_queue.complete(&path, succeeded) {
                    warn!("could not move completed loop pipeline: {e}");
                }
            }

            let duration = Some(state.artifacts.total_duration_ms);
            let run_id = Some(state.run_id.clone());

            if state.status == PipelineStatus::Aborted {
                sessions.finish_iteration(run_id, IterationStatus::Aborted, duration, false);
                last_state = Some(state);
                reason = TerminationReason::Aborted;
                break;
            }

            if state.status == PipelineStatus::Failed
                && current_config.settings.failure_strategy == crate::config::FailureAction::Stop
            {
                sessions.finish_iteration(run_id, IterationStatus::Failed, duration, false);
                last_state = Some(state);
                reason = TerminationReason::Failure;
                break;
            }

            let iteration_status = if state.status == PipelineStatus::Failed {
                IterationStatus::Failed
            } else {
                IterationStatus::Completed
            };

            let has_pending = !main_queue.scan_pending().unwrap_or_default().is_empty();
            if !has_pending {
                sessions.finish_iteration(run_id, iteration_status, duration, false);
                last_state = Some(state);
                reason = TerminationReason::Natural;
                break;
            }

            sessions.finish_iteration(run_id, iteration_status, duration, true);
            last_state = Some(state);

            if iteration == max_iterations {
                // The final allowed iteration queued more work.
                reason = TerminationReason::LimitReached;
                break;
            }

            match self.claim_next(&main_queue) {
                Some((config, path)) => {
                    info!(pipeline = %config.name, "loaded next pipeline from queue");
                    current_config = config;
                    current_source = PipelineSource::LoopPending;
                    claimed = Some(path);
                }
                None => {
                    reason = TerminationReason::Natural;
                    break;
                }
            }
        }

        if let Err(e) = sessions.terminate(reason) {
            warn!("could not persist loop session: {e}");
        }
        info!(session = %session_id, reason = ?reason, "loop session finished");

        let mut state = match last_state {
            Some(state) => state,
            None => {
                return Err(PipelineError::Other(anyhow::anyhow!(
                    "loop session {session_id} produced no completed runs"
                )));
            }
        };
        if let Some(ref mut loop_context) = state.loop_context {
            loop_context.termination_reason = Some(reason);
        }
        if let Err(e) = StateManager::new(self.runner.project_dir()).save_run(&state) {
            warn!("could not persist final loop run state: {e}");
        }

        self.runner
            .notifications()
            .dispatch(&NotificationEvent::PipelineFinished {
                pipeline: state.pipeline_config.name.clone(),
                run_id: state.run_id.clone(),
                status: state.status,
            });

        Ok(state)
    }

    /// Claim pending pipelines until one parses; malformed files land in
    /// `failed/`.
    fn claim_next(&self, queue: &LoopQueue) -> Option<(PipelineConfig, PathBuf)> {
        loop {
            let path = queue.claim_oldest().ok().flatten()?;
            match load_pipeline_config(&path) {
                Ok(config) => return Some((config, path)),
                Err(e) => {
                    warn!(pipeline = %path.display(), "skipping malformed pending pipeline: {e}");
                    queue.complete(&path, false).ok();
                }
            }
        }
    }

    /// Run the loop agent directly (not through the stage executor) and
    /// append its execution to the run state. Failure is non-fatal.
    async fn run_loop_agent(
        &self,
        active: &ActiveRun,
        config: &PipelineConfig,
        settings: &LoopSettings,
        queue: &LoopQueue,
        iteration: u32,
        max_iterations: u32,
    ) {
        // An aborted run skips the loop agent entirely.
        if active.shared().with(|state| {
            state
                .stages
                .iter()
                .any(|e| e.error.as_ref().is_some_and(|err| err.message == "Agent execution aborted"))
        }) {
            return;
        }

        let selection = config.runtime.as_ref().map(|r| r.runtime_type.as_str());
        let runtime = match self.runner.registry().resolve(selection) {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("loop agent skipped, no runtime: {e}");
                return;
            }
        };

        let loader =
            InstructionLoader::new(active.execution_repo(), settings.instructions.clone());
        let template = loader.load(InstructionKind::Loop);
        let pipeline_yaml = serde_yaml::to_string(config).unwrap_or_default();
        let pending_dir = queue.pending_dir().display().to_string();

        let mut context = HashMap::new();
        context.insert("pipelineName", config.name.clone());
        context.insert("pipelineYaml", pipeline_yaml.clone());
        context.insert("pendingDir", pending_dir.clone());
        context.insert("currentIteration", iteration.to_string());
        context.insert("maxIterations", max_iterations.to_string());
        let system_prompt = interpolate(&template, &context);

        let user_prompt = format!(
            "Current pipeline definition:\n\n```yaml\n{pipeline_yaml}```\n\n\
             Pending queue directory: {pending_dir}\n"
        );

        let mut options = ExecuteOptions::new(
            active.execution_repo().to_path_buf(),
            LOOP_AGENT_TIMEOUT.as_secs(),
        );
        options.permission_mode = crate::config::PermissionMode::AcceptEdits;
        let request = ExecuteRequest {
            system_prompt,
            user_prompt,
            options,
        };

        let shared = active.shared();
        shared.begin_stage(LOOP_STAGE, 0);
        shared.notify_changed();

        match runtime.execute(request, None).await {
            Ok(outcome) => {
                shared.update_stage(LOOP_STAGE, |execution| {
                    execution.agent_output = Some(outcome.text_output.clone());
                    execution.token_usage = outcome.token_usage;
                    execution.set_status(StageStatus::Success);
                });
                info!(iteration, "loop agent finished");
            }
            Err(e) => {
                // Non-fatal: the iteration's outcome stands either way.
                warn!(iteration, "loop agent failed: {e}");
                shared.update_stage(LOOP_STAGE, |execution| {
                    execution.fail(crate::state::StageErrorInfo::new(e.to_string()));
                });
            }
        }
        shared.notify_changed();
    }
}

fn queue_for(repo: &Path, settings: &LoopSettings, session_id: &str) -> LoopQueue {
    match settings.directories {
        Some(ref root) => LoopQueue::at(root.join(session_id)),
        None => LoopQueue::new(repo, session_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{INLINE_AGENT, StageConfig};
    use crate::orchestrator::RunOptions;
    use crate::runtime::RuntimeRegistry;
    use crate::runtime::testing::MockRuntime;
    use crate::state::StateManager;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn inline_stage(name: &str) -> StageConfig {
        let mut stage = StageConfig::new(name, INLINE_AGENT);
        stage.prompt = Some(format!("stage {name}"));
        stage
    }

    fn loop_config(name: &str, max_iterations: u32) -> PipelineConfig {
        let mut config = PipelineConfig::new(name, vec![inline_stage("work")]);
        config.settings.auto_commit = false;
        config.looping = Some(LoopSettings {
            enabled: true,
            max_iterations,
            ..Default::default()
        });
        config
    }

    fn runner(dir: &Path, runtime: MockRuntime) -> PipelineRunner {
        let mut registry = RuntimeRegistry::empty();
        registry.register(Arc::new(runtime));
        registry.set_default("mock");
        PipelineRunner::new(dir.to_path_buf(), Arc::new(registry), RunOptions::default())
    }

    fn session_of(dir: &Path) -> super::super::LoopSession {
        let store = StateManager::new(dir);
        let sessions = store.list_loop_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        store.load_loop_session(&sessions[0]).unwrap()
    }

    #[tokio::test]
    async fn natural_termination_when_queue_stays_empty() {
        let dir = tempdir().unwrap();
        // The loop agent writes no pending files.
        let runner = runner(dir.path(), MockRuntime::succeeding("nothing left to do"));
        let config = loop_config("loop", 5);

        let state = runner.run_pipeline(&config).await.unwrap();
        assert_eq!(state.status, PipelineStatus::Completed);
        let loop_context = state.loop_context.unwrap();
        assert_eq!(loop_context.termination_reason, Some(TerminationReason::Natural));
        assert_eq!(loop_context.current_iteration, 1);

        let session = session_of(dir.path());
        assert_eq!(session.status, super::super::LoopSessionStatus::Completed);
        assert_eq!(session.total_iterations, 1);
        assert_eq!(session.iterations[0].triggered_next, Some(false));
        assert_eq!(
            session.iterations[0].status,
            IterationStatus::Completed
        );
    }

    #[tokio::test]
    async fn loop_agent_execution_is_appended_to_state() {
        let dir = tempdir().unwrap();
        let runner = runner(dir.path(), MockRuntime::succeeding("done"));
        let config = loop_config("loop", 3);

        let state = runner.run_pipeline(&config).await.unwrap();
        let loop_exec = state.stage(LOOP_STAGE).unwrap();
        assert_eq!(loop_exec.status, StageStatus::Success);
        assert_eq!(loop_exec.agent_output.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn loop_agent_failure_is_non_fatal() {
        let dir = tempdir().unwrap();
        // Stage succeeds; only the loop agent call (second execute) fails.
        let runtime = MockRuntime::failing("503 service unavailable");
        runtime.push_step(crate::runtime::testing::MockStep::Succeed("ok".to_string()));
        let runner = runner(dir.path(), runtime);
        let config = loop_config("loop", 2);

        let state = runner.run_pipeline(&config).await.unwrap();
        assert_eq!(state.status, PipelineStatus::Completed);
        let loop_exec = state.stage(LOOP_STAGE).unwrap();
        assert_eq!(loop_exec.status, StageStatus::Failed);

        let session = session_of(dir.path());
        assert_eq!(session.status, super::super::LoopSessionStatus::Completed);
    }

    #[tokio::test]
    async fn failure_with_stop_policy_terminates_loop() {
        let dir = tempdir().unwrap();
        let runner = runner(dir.path(), MockRuntime::failing("parse error in agent"));
        let config = loop_config("loop", 4);

        let state = runner.run_pipeline(&config).await.unwrap();
        assert_eq!(state.status, PipelineStatus::Failed);
        assert_eq!(
            state.loop_context.unwrap().termination_reason,
            Some(TerminationReason::Failure)
        );

        let session = session_of(dir.path());
        assert_eq!(session.status, super::super::LoopSessionStatus::Failed);
        assert_eq!(session.total_iterations, 1);
    }

    #[tokio::test]
    async fn pending_pipeline_is_consumed_and_finished() {
        let dir = tempdir().unwrap();
        // The first stage dawdles so the planted pending file is in place
        // before the first queue scan.
        let runtime = MockRuntime::succeeding("ok");
        runtime.push_step(crate::runtime::testing::MockStep::DelayThenSucceed(
            Duration::from_millis(300),
            "ok".to_string(),
        ));
        let runner = runner(dir.path(), runtime);
        let config = loop_config("seed", 5);

        // Pre-seed a pending pipeline: the session id is generated inside
        // run(), so plant the file through a notifier-free side channel —
        // the loop agent would normally write it. Instead, run with a mock
        // that writes a pending file on its second call (the loop agent).
        // Simpler: drive the queue directly.
        let settings = config.looping.clone().unwrap();
        // Run once with a custom directories override so the queue location
        // is known up front.
        let queue_root = dir.path().join("queue-root");
        let mut config = config;
        config.looping = Some(LoopSettings {
            directories: Some(queue_root.clone()),
            ..settings
        });

        // The pending pipeline the "loop agent" will have produced.
        let follow_up = r#"
name: follow-up
stages:
  - name: work
    agent: __inline__
    prompt: follow-up work
settings:
  autoCommit: false
"#;

        // Plant the file as soon as the session directory appears.
        let planter_root = queue_root.clone();
        let planter = tokio::spawn(async move {
            for _ in 0..200 {
                if let Ok(entries) = std::fs::read_dir(&planter_root) {
                    for entry in entries.flatten() {
                        let pending = entry.path().join("pending");
                        if pending.is_dir() {
                            let marker = entry.path().join(".planted");
                            if !marker.exists() {
                                std::fs::write(&marker, "x").unwrap();
                                std::fs::write(pending.join("follow-up.yml"), follow_up)
                                    .unwrap();
                            }
                            return;
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let state = runner.run_pipeline(&config).await.unwrap();
        planter.await.unwrap();

        // The second iteration ran the follow-up pipeline and the queue file
        // ended up in finished/.
        assert_eq!(state.pipeline_config.name, "follow-up");
        let loop_context = state.loop_context.unwrap();
        assert_eq!(loop_context.current_iteration, 2);
        assert_eq!(loop_context.pipeline_source, PipelineSource::LoopPending);
        assert_eq!(loop_context.termination_reason, Some(TerminationReason::Natural));

        let session = session_of(dir.path());
        assert_eq!(session.total_iterations, 2);
        assert_eq!(session.iterations[0].triggered_next, Some(true));
        assert_eq!(session.iterations[1].triggered_next, Some(false));

        let session_dir = queue_root
            .join(&session.session_id);
        assert!(session_dir.join("finished/follow-up.yml").exists());
        assert!(session_dir.join("pending").read_dir().unwrap().next().is_none());
    }

    #[tokio::test]
    async fn iteration_cap_reports_limit_reached() {
        let dir = tempdir().unwrap();
        let runtime = MockRuntime::succeeding("ok");
        runtime.push_step(crate::runtime::testing::MockStep::DelayThenSucceed(
            Duration::from_millis(300),
            "ok".to_string(),
        ));
        let runner = runner(dir.path(), runtime);
        let queue_root = dir.path().join("queue-root");
        let mut config = loop_config("seed", 1);
        config.looping = Some(LoopSettings {
            enabled: true,
            max_iterations: 1,
            directories: Some(queue_root.clone()),
            instructions: None,
        });

        let follow_up = "name: more\nstages:\n  - name: w\n    agent: __inline__\n    prompt: p\n";
        let planter_root = queue_root.clone();
        let planter = tokio::spawn(async move {
            for _ in 0..200 {
                if let Ok(entries) = std::fs::read_dir(&planter_root) {
                    for entry in entries.flatten() {
                        let pending = entry.path().join("pending");
                        if pending.is_dir() {
                            std::fs::write(pending.join("more.yml"), follow_up).unwrap();
                            return;
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let state = runner.run_pipeline(&config).await.unwrap();
        planter.await.unwrap();

        // One iteration ran, and it would have queued another.
        assert_eq!(
            state.loop_context.unwrap().termination_reason,
            Some(TerminationReason::LimitReached)
        );
        let session = session_of(dir.path());
        assert_eq!(session.status, super::super::LoopSessionStatus::LimitReached);
        assert_eq!(session.total_iterations, 1);
        assert_eq!(session.iterations[0].triggered_next, Some(true));
    }
}
