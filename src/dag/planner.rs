//! Execution planning: validation, level assignment, group partitioning.
//!
//! Levels satisfy `level(n) = 0` for roots and `1 + max(level(dep))`
//! otherwise; an execution group is all stages at one level, which are by
//! construction independent of each other and may run concurrently.

use super::builder::{ExecutionGraph, GraphBuilder, NodeIndex};
use crate::config::{PipelineConfig, STAGE_TIMEOUT_SOFT_CAP_SECS, StageConfig, ValidationReport};
use crate::errors::PipelineError;
use std::collections::VecDeque;
use tracing::debug;

/// Dependency chains deeper than this earn a warning.
const DEEP_CHAIN_THRESHOLD: usize = 5;

/// All stages at one DAG level.
#[derive(Debug, Clone)]
pub struct ExecutionGroup {
    pub level: usize,
    pub stages: Vec<StageConfig>,
}

impl ExecutionGroup {
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }
}

/// A validated, level-scheduled execution plan.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub graph: ExecutionGraph,
    /// Per-node level, parallel to the graph arena.
    pub levels: Vec<usize>,
    /// Groups ordered by level ascending; source order within a level.
    pub groups: Vec<ExecutionGroup>,
    pub warnings: Vec<String>,
}

impl ExecutionPlan {
    /// Largest group size.
    pub fn max_parallelism(&self) -> usize {
        self.groups.iter().map(ExecutionGroup::len).max().unwrap_or(0)
    }

    /// True when every group contains a single stage.
    pub fn is_sequential(&self) -> bool {
        self.groups.iter().all(|g| g.len() == 1)
    }

    pub fn level_of(&self, name: &str) -> Option<usize> {
        self.graph.index_of(name).and_then(|i| self.levels.get(i).copied())
    }

    /// One-line shape summary for logs and the plan command.
    pub fn describe(&self) -> String {
        let shape: Vec<String> = self
            .groups
            .iter()
            .map(|g| format!("[{}]", g.stage_names().join(", ")))
            .collect();
        format!(
            "{} stages in {} groups (max parallelism {}): {}",
            self.graph.len(),
            self.groups.len(),
            self.max_parallelism(),
            shape.join(" -> ")
        )
    }
}

/// Pure DAG validation: never fails, collects every finding.
pub fn validate_dag(config: &PipelineConfig) -> ValidationReport {
    let (graph, findings) = GraphBuilder::new(config.stages.clone()).build();
    let mut report = ValidationReport::default();
    for message in findings.messages() {
        report.error(message);
    }

    // Level computation is only safe on an acyclic graph.
    if findings.is_clean() && !graph.is_empty() {
        let levels = assign_levels(&graph);
        let depth = levels.iter().copied().max().unwrap_or(0) + 1;
        if depth > DEEP_CHAIN_THRESHOLD {
            report.warning(format!(
                "deep dependency chain: {depth} levels (consider flattening)"
            ));
        }
    }

    for stage in &config.stages {
        if stage.timeout > STAGE_TIMEOUT_SOFT_CAP_SECS {
            report.warning(format!(
                "stage '{}' timeout {}s exceeds the {}s soft cap",
                stage.name, stage.timeout, STAGE_TIMEOUT_SOFT_CAP_SECS
            ));
        }
    }

    report
}

/// Build the execution plan for a pipeline.
///
/// Fails with `PipelineError::InvalidPipeline` when validation finds errors;
/// warnings are carried on the returned plan.
pub fn build_execution_plan(config: &PipelineConfig) -> Result<ExecutionPlan, PipelineError> {
    let report = validate_dag(config);
    if !report.valid() {
        return Err(PipelineError::InvalidPipeline {
            errors: report.errors,
        });
    }

    let (graph, _) = GraphBuilder::new(config.stages.clone()).build();
    let levels = assign_levels(&graph);
    let groups = partition_groups(&graph, &levels);

    let plan = ExecutionPlan {
        graph,
        levels,
        groups,
        warnings: report.warnings,
    };
    debug!(pipeline = %config.name, "{}", plan.describe());
    Ok(plan)
}

/// Memoised level assignment. Caller guarantees the graph is acyclic.
fn assign_levels(graph: &ExecutionGraph) -> Vec<usize> {
    fn level_of(
        graph: &ExecutionGraph,
        node: NodeIndex,
        memo: &mut Vec<Option<usize>>,
    ) -> usize {
        if let Some(level) = memo[node] {
            return level;
        }
        let level = graph
            .dependencies(node)
            .iter()
            .map(|&dep| level_of(graph, dep, memo))
            .max()
            .map(|max| max + 1)
            .unwrap_or(0);
        memo[node] = Some(level);
        level
    }

    let mut memo = vec![None; graph.len()];
    (0..graph.len())
        .map(|i| level_of(graph, i, &mut memo))
        .collect()
}

/// Stable bucket-by-level sweep over Kahn's topological order.
///
/// The FIFO queue seeds in arena (source) order and appends dependents in
/// discovery order, so stages within a level keep their source ordering.
fn partition_groups(graph: &ExecutionGraph, levels: &[usize]) -> Vec<ExecutionGroup> {
    let mut in_degree: Vec<usize> = (0..graph.len())
        .map(|i| graph.dependencies(i).len())
        .collect();

    let mut queue: VecDeque<NodeIndex> = (0..graph.len())
        .filter(|&i| in_degree[i] == 0)
        .collect();

    let mut topo_order = Vec::with_capacity(graph.len());
    while let Some(node) = queue.pop_front() {
        topo_order.push(node);
        for &dependent in graph.dependents(node) {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }

    let level_count = levels.iter().copied().max().map(|m| m + 1).unwrap_or(0);
    let mut groups: Vec<ExecutionGroup> = (0..level_count)
        .map(|level| ExecutionGroup {
            level,
            stages: Vec::new(),
        })
        .collect();

    for node in topo_order {
        if let Some(stage) = graph.stage(node) {
            groups[levels[node]].stages.push(stage.clone());
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str, deps: Vec<&str>) -> StageConfig {
        StageConfig::new(name, &format!("agents/{name}.md")).with_depends_on(&deps)
    }

    fn pipeline(stages: Vec<StageConfig>) -> PipelineConfig {
        PipelineConfig::new("test", stages)
    }

    #[test]
    fn linear_chain_levels() {
        let plan = build_execution_plan(&pipeline(vec![
            stage("a", vec![]),
            stage("b", vec!["a"]),
            stage("c", vec!["b"]),
        ]))
        .unwrap();

        assert_eq!(plan.groups.len(), 3);
        assert_eq!(plan.groups[0].stage_names(), vec!["a"]);
        assert_eq!(plan.groups[1].stage_names(), vec!["b"]);
        assert_eq!(plan.groups[2].stage_names(), vec!["c"]);
        assert!(plan.is_sequential());
        assert_eq!(plan.max_parallelism(), 1);
    }

    #[test]
    fn diamond_levels_and_parallelism() {
        let plan = build_execution_plan(&pipeline(vec![
            stage("a", vec![]),
            stage("b", vec!["a"]),
            stage("c", vec!["a"]),
            stage("d", vec!["b", "c"]),
        ]))
        .unwrap();

        assert_eq!(plan.groups.len(), 3);
        assert_eq!(plan.groups[1].stage_names(), vec!["b", "c"]);
        assert_eq!(plan.max_parallelism(), 2);
        assert!(!plan.is_sequential());
    }

    #[test]
    fn fan_in_from_two_roots() {
        let plan = build_execution_plan(&pipeline(vec![
            stage("a", vec![]),
            stage("b", vec![]),
            stage("c", vec!["a", "b"]),
        ]))
        .unwrap();

        assert_eq!(plan.groups.len(), 2);
        assert_eq!(plan.groups[0].stage_names(), vec!["a", "b"]);
        assert_eq!(plan.groups[1].stage_names(), vec!["c"]);
        assert_eq!(plan.max_parallelism(), 2);
    }

    #[test]
    fn every_stage_in_exactly_one_group() {
        let plan = build_execution_plan(&pipeline(vec![
            stage("a", vec![]),
            stage("b", vec!["a"]),
            stage("c", vec![]),
            stage("d", vec!["b", "c"]),
            stage("e", vec!["a"]),
        ]))
        .unwrap();

        let mut seen: Vec<&str> = plan
            .groups
            .iter()
            .flat_map(|g| g.stage_names())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec!["a", "b", "c", "d", "e"]);
        let total: usize = plan.groups.iter().map(ExecutionGroup::len).sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn dependencies_sit_in_strictly_smaller_groups() {
        let plan = build_execution_plan(&pipeline(vec![
            stage("a", vec![]),
            stage("b", vec!["a"]),
            stage("c", vec!["a", "b"]),
            stage("d", vec!["c"]),
        ]))
        .unwrap();

        for stage in plan.graph.stages() {
            let level = plan.level_of(&stage.name).unwrap();
            for dep in &stage.depends_on {
                assert!(plan.level_of(dep).unwrap() < level);
            }
        }
    }

    #[test]
    fn groups_keep_source_order_within_level() {
        let plan = build_execution_plan(&pipeline(vec![
            stage("zeta", vec![]),
            stage("alpha", vec![]),
            stage("mid", vec![]),
        ]))
        .unwrap();
        assert_eq!(plan.groups[0].stage_names(), vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn cycle_is_rejected_with_endpoints() {
        let err = build_execution_plan(&pipeline(vec![
            stage("a", vec!["c"]),
            stage("b", vec!["a"]),
            stage("c", vec!["b"]),
        ]))
        .unwrap_err();

        match err {
            PipelineError::InvalidPipeline { errors } => {
                assert!(errors.iter().any(|e| e.contains("cycle") && e.contains("->")));
            }
            other => panic!("expected InvalidPipeline, got {other}"),
        }
    }

    #[test]
    fn self_dependency_is_its_own_error() {
        let report = validate_dag(&pipeline(vec![stage("a", vec!["a"])]));
        assert!(!report.valid());
        assert!(report.errors.iter().any(|e| e.contains("depends on itself")));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let report = validate_dag(&pipeline(vec![stage("a", vec!["ghost"])]));
        assert!(!report.valid());
        assert!(report.errors.iter().any(|e| e.contains("ghost")));
    }

    #[test]
    fn validate_collects_multiple_errors() {
        let report = validate_dag(&pipeline(vec![
            stage("a", vec![]),
            stage("a", vec![]),
            stage("b", vec!["ghost"]),
        ]));
        assert!(report.errors.len() >= 2);
    }

    #[test]
    fn deep_chain_warns() {
        let stages = vec![
            stage("s0", vec![]),
            stage("s1", vec!["s0"]),
            stage("s2", vec!["s1"]),
            stage("s3", vec!["s2"]),
            stage("s4", vec!["s3"]),
            stage("s5", vec!["s4"]),
        ];
        let report = validate_dag(&pipeline(stages));
        assert!(report.valid());
        assert!(report.warnings.iter().any(|w| w.contains("deep dependency chain")));
    }

    #[test]
    fn cyclic_graph_never_reaches_level_computation() {
        // Would recurse forever if levels were computed on a cyclic graph;
        // validate_dag must guard on findings first.
        let report = validate_dag(&pipeline(vec![
            stage("a", vec!["b"]),
            stage("b", vec!["a"]),
        ]));
        assert!(!report.valid());
    }
}
