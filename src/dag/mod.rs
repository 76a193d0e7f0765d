//! DAG planner for parallel stage execution.
//!
//! Stages declare dependencies by name; the planner validates the graph
//! (duplicates, unknown deps, self-deps, cycles), assigns each stage a level
//! (longest path from a root), and partitions the stages into execution
//! groups — all stages within one group are mutually independent and run
//! concurrently under parallel mode.
//!
//! ## Example
//!
//! ```no_run
//! use agent_pipeline::config::{PipelineConfig, StageConfig};
//! use agent_pipeline::dag::build_execution_plan;
//!
//! # fn example() -> anyhow::Result<()> {
//! let config = PipelineConfig::new(
//!     "ci",
//!     vec![
//!         StageConfig::new("analyze", "agents/analyze.md"),
//!         StageConfig::new("fix", "agents/fix.md").with_depends_on(&["analyze"]),
//!         StageConfig::new("test", "agents/test.md").with_depends_on(&["analyze"]),
//!         StageConfig::new("report", "agents/report.md").with_depends_on(&["fix", "test"]),
//!     ],
//! );
//!
//! let plan = build_execution_plan(&config)?;
//! // Group 0: [analyze]   Group 1: [fix, test]   Group 2: [report]
//! assert_eq!(plan.groups.len(), 3);
//! assert_eq!(plan.max_parallelism(), 2);
//! # Ok(())
//! # }
//! ```

mod builder;
mod planner;

pub use builder::{ExecutionGraph, GraphBuilder, GraphFindings, NodeIndex};
pub use planner::{ExecutionGroup, ExecutionPlan, build_execution_plan, validate_dag};
