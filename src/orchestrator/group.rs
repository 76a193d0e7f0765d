//! Drive one DAG level: all stages of a group, in parallel or sequence.
//!
//! Parallel mode batch-inserts every `running` entry (one state
//! notification), spawns one task per stage, and always waits for every task
//! — there is no short-circuit on failure, so state stays consistent. Tasks
//! that panic or error convert to synthetic failed executions carrying the
//! original message. Results come back in input order regardless of
//! completion order, and stage-level notifications dispatch only after the
//! whole group has finished, in input order.

use crate::config::StageConfig;
use crate::errors::AbortedError;
use crate::notify::{NotificationEvent, Notifications};
use crate::runtime::OutputCallback;
use crate::stage::StageExecutor;
use crate::state::{SharedState, StageErrorInfo, StageExecution, StageStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Aggregate outcome of one group.
#[derive(Debug, Clone)]
pub struct GroupResult {
    /// In input order, one entry per stage.
    pub executions: Vec<StageExecution>,
    pub all_succeeded: bool,
    pub any_failed: bool,
    pub duration: Duration,
}

impl GroupResult {
    fn from_executions(executions: Vec<StageExecution>, duration: Duration) -> Self {
        let all_succeeded = !executions.is_empty()
            && executions.iter().all(|e| e.status == StageStatus::Success);
        let any_failed = executions.iter().any(|e| e.status == StageStatus::Failed);
        Self {
            executions,
            all_succeeded,
            any_failed,
            duration,
        }
    }
}

/// One-line summary: `Completed 3 stages in 4.2s (2 succeeded, 1 failed)`.
pub fn aggregate_results(result: &GroupResult) -> String {
    let succeeded = result
        .executions
        .iter()
        .filter(|e| e.status == StageStatus::Success)
        .count();
    let failed = result
        .executions
        .iter()
        .filter(|e| e.status == StageStatus::Failed)
        .count();
    format!(
        "Completed {} stages in {:.1}s ({} succeeded, {} failed)",
        result.executions.len(),
        result.duration.as_secs_f64(),
        succeeded,
        failed
    )
}

pub struct GroupOrchestrator {
    executor: Arc<StageExecutor>,
    notifications: Notifications,
    pipeline_name: String,
}

impl GroupOrchestrator {
    pub fn new(
        executor: Arc<StageExecutor>,
        notifications: Notifications,
        pipeline_name: String,
    ) -> Self {
        Self {
            executor,
            notifications,
            pipeline_name,
        }
    }

    /// Launch every stage concurrently and wait for all of them.
    pub async fn execute_parallel_group(
        &self,
        stages: &[StageConfig],
        shared: &SharedState,
        on_output: Option<OutputCallback>,
    ) -> Result<GroupResult, AbortedError> {
        let start = Instant::now();
        if stages.is_empty() {
            return Ok(GroupResult::from_executions(Vec::new(), start.elapsed()));
        }
        debug!(
            stages = ?stages.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            "executing parallel group"
        );

        // One batch of running entries, one notification.
        let mut inserted = false;
        for stage in stages {
            let max_retries = stage
                .retry
                .as_ref()
                .map(|r| r.max_attempts.saturating_sub(1))
                .unwrap_or_else(|| {
                    crate::retry::RetryPolicy::default()
                        .max_attempts
                        .saturating_sub(1)
                });
            inserted |= shared.begin_stage(&stage.name, max_retries);
        }
        if inserted {
            shared.notify_changed();
        }

        let mut handles = Vec::with_capacity(stages.len());
        for stage in stages {
            let executor = self.executor.clone();
            let shared = shared.clone();
            let stage = stage.clone();
            let on_output = on_output.clone();
            handles.push(tokio::spawn(async move {
                executor.execute_stage(&stage, &shared, on_output).await
            }));
        }

        // Always wait for every task; convert panics and aborts in place.
        // Results come back in input order regardless of completion order.
        let joined = futures::future::join_all(handles).await;

        let mut aborted = false;
        let mut executions = Vec::with_capacity(stages.len());
        for (stage, join_result) in stages.iter().zip(joined) {
            match join_result {
                Ok(Ok(execution)) => executions.push(execution),
                Ok(Err(AbortedError)) => {
                    aborted = true;
                    executions.push(self.entry_for(stage, shared));
                }
                Err(join_error) => {
                    warn!(stage = %stage.name, "stage task died: {join_error}");
                    shared.update_stage(&stage.name, |execution| {
                        execution.fail(
                            StageErrorInfo::new(join_error.to_string())
                                .with_agent_path(&stage.agent)
                                .with_stack(format!("{join_error:?}")),
                        );
                    });
                    shared.notify_changed();
                    executions.push(self.entry_for(stage, shared));
                }
            }
        }

        let result = GroupResult::from_executions(executions, start.elapsed());
        self.dispatch_stage_notifications(&result);

        if aborted {
            return Err(AbortedError);
        }
        Ok(result)
    }

    /// Run stages one at a time: insert, launch, wait, update, notify.
    pub async fn execute_sequential_group(
        &self,
        stages: &[StageConfig],
        shared: &SharedState,
        on_output: Option<OutputCallback>,
    ) -> Result<GroupResult, AbortedError> {
        let start = Instant::now();
        let mut executions = Vec::with_capacity(stages.len());

        for stage in stages {
            match self
                .executor
                .execute_stage(stage, shared, on_output.clone())
                .await
            {
                Ok(execution) => executions.push(execution),
                Err(AbortedError) => {
                    executions.push(self.entry_for(stage, shared));
                    let result = GroupResult::from_executions(executions, start.elapsed());
                    self.dispatch_stage_notifications(&result);
                    return Err(AbortedError);
                }
            }
        }

        let result = GroupResult::from_executions(executions, start.elapsed());
        self.dispatch_stage_notifications(&result);
        Ok(result)
    }

    fn entry_for(&self, stage: &StageConfig, shared: &SharedState) -> StageExecution {
        shared
            .snapshot()
            .stage(&stage.name)
            .cloned()
            .unwrap_or_else(|| StageExecution::skipped(&stage.name))
    }

    /// Completed/failed events, after the whole group, in input order.
    fn dispatch_stage_notifications(&self, result: &GroupResult) {
        for execution in &result.executions {
            if matches!(execution.status, StageStatus::Success | StageStatus::Failed) {
                self.notifications.dispatch(&NotificationEvent::StageFinished {
                    pipeline: self.pipeline_name.clone(),
                    stage: execution.stage_name.clone(),
                    status: execution.status,
                });
            }
        }
    }
}
