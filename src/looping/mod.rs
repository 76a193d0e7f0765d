//! Loop mode: queue-driven multi-iteration pipeline runs.
//!
//! When looping is enabled, each iteration finishes by running a dedicated
//! loop agent that may write new pipeline definitions into the session's
//! `pending/` queue; the executor then consumes the oldest pending pipeline
//! and runs it as the next iteration, until the queue runs dry, a failure
//! with a stop policy fires, the run aborts, or the iteration cap is hit.

mod executor;
mod queue;
mod session;

pub use executor::LoopExecutor;
pub use queue::LoopQueue;
pub use session::{
    IterationStatus, LoopIteration, LoopSession, LoopSessionStatus, LoopStateManager,
};

use crate::config::{INLINE_AGENT, PipelineConfig, StageConfig};

/// Name of the synthetic loop-agent stage.
///
/// The node is injected into the execution plan (depending on every real
/// stage, so it lands at the final DAG level and shows up in plan output)
/// but is driven by the loop executor directly, never the stage executor.
pub const LOOP_STAGE: &str = "loop-agent";

/// Build the synthetic loop stage for a pipeline's plan.
pub fn loop_stage_config(config: &PipelineConfig) -> StageConfig {
    let mut stage = StageConfig::new(LOOP_STAGE, INLINE_AGENT);
    stage.depends_on = config.stages.iter().map(|s| s.name.clone()).collect();
    stage.prompt = Some(String::new());
    stage
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::build_execution_plan;

    #[test]
    fn loop_stage_lands_at_final_level() {
        let mut config = PipelineConfig::new(
            "p",
            vec![
                StageConfig::new("a", "a.md"),
                StageConfig::new("b", "b.md").with_depends_on(&["a"]),
                StageConfig::new("c", "c.md"),
            ],
        );
        config.stages.push(loop_stage_config(&config));

        let plan = build_execution_plan(&config).unwrap();
        let last_group = plan.groups.last().unwrap();
        assert_eq!(last_group.stage_names(), vec![LOOP_STAGE]);
        assert_eq!(
            plan.level_of(LOOP_STAGE).unwrap(),
            plan.groups.len() - 1
        );
    }
}
