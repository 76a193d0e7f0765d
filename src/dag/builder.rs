//! Graph construction for stage dependencies.
//!
//! The builder takes the stage list of a pipeline and constructs a directed
//! graph over arena indices (no pointer cycles): nodes live in a `Vec`, a
//! name→index map resolves `dependsOn` entries, and forward/reverse edge
//! lists are built in one pass each.

use crate::config::StageConfig;
use std::collections::{HashMap, HashSet};

/// Index into the stage arena.
pub type NodeIndex = usize;

/// A directed graph of pipeline stages.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    stages: Vec<StageConfig>,
    index_map: HashMap<String, NodeIndex>,
    /// index -> stages that depend on it
    forward_edges: Vec<Vec<NodeIndex>>,
    /// index -> stages it depends on
    reverse_edges: Vec<Vec<NodeIndex>>,
}

impl ExecutionGraph {
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, index: NodeIndex) -> Option<&StageConfig> {
        self.stages.get(index)
    }

    pub fn stages(&self) -> &[StageConfig] {
        &self.stages
    }

    pub fn index_of(&self, name: &str) -> Option<NodeIndex> {
        self.index_map.get(name).copied()
    }

    /// Stages that depend on the given stage.
    pub fn dependents(&self, index: NodeIndex) -> &[NodeIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Stages the given stage depends on.
    pub fn dependencies(&self, index: NodeIndex) -> &[NodeIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Entry points: stages with no dependencies.
    pub fn roots(&self) -> Vec<NodeIndex> {
        self.reverse_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn dependencies_satisfied(&self, index: NodeIndex, completed: &HashSet<NodeIndex>) -> bool {
        self.dependencies(index)
            .iter()
            .all(|dep| completed.contains(dep))
    }
}

/// Structural validation findings, collected rather than bailed on so the
/// report can cite every problem at once.
#[derive(Debug, Default)]
pub struct GraphFindings {
    pub duplicate_names: Vec<String>,
    pub unknown_dependencies: Vec<(String, String)>,
    pub self_dependencies: Vec<String>,
    /// One `(from, to)` pair per back-edge discovered by DFS.
    pub cycle_edges: Vec<(String, String)>,
}

impl GraphFindings {
    pub fn is_clean(&self) -> bool {
        self.duplicate_names.is_empty()
            && self.unknown_dependencies.is_empty()
            && self.self_dependencies.is_empty()
            && self.cycle_edges.is_empty()
    }

    pub fn messages(&self) -> Vec<String> {
        let mut messages = Vec::new();
        for name in &self.duplicate_names {
            messages.push(format!("duplicate stage name: {name}"));
        }
        for (stage, dep) in &self.unknown_dependencies {
            messages.push(format!(
                "stage '{stage}' depends on unknown stage '{dep}'"
            ));
        }
        for name in &self.self_dependencies {
            messages.push(format!("stage '{name}' depends on itself"));
        }
        for (from, to) in &self.cycle_edges {
            messages.push(format!("dependency cycle: {from} -> {to}"));
        }
        messages
    }
}

/// Builder for stage graphs.
pub struct GraphBuilder {
    stages: Vec<StageConfig>,
}

impl GraphBuilder {
    pub fn new(stages: Vec<StageConfig>) -> Self {
        Self { stages }
    }

    /// Build the graph, reporting every structural problem found.
    ///
    /// On a clean result the returned graph is acyclic and safe for level
    /// computation. With findings present the graph still exists (minus
    /// unresolvable edges) so callers can render partial diagnostics, but
    /// level computation must not be attempted.
    pub fn build(self) -> (ExecutionGraph, GraphFindings) {
        let mut findings = GraphFindings::default();

        // Duplicate detection: single pass over a name set.
        let mut index_map: HashMap<String, NodeIndex> = HashMap::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if index_map.contains_key(&stage.name) {
                findings.duplicate_names.push(stage.name.clone());
            } else {
                index_map.insert(stage.name.clone(), i);
            }
        }

        let mut forward_edges: Vec<Vec<NodeIndex>> = vec![Vec::new(); self.stages.len()];
        let mut reverse_edges: Vec<Vec<NodeIndex>> = vec![Vec::new(); self.stages.len()];

        for (to_idx, stage) in self.stages.iter().enumerate() {
            for dep in &stage.depends_on {
                if dep == &stage.name {
                    findings.self_dependencies.push(stage.name.clone());
                    continue;
                }
                match index_map.get(dep) {
                    Some(&from_idx) => {
                        forward_edges[from_idx].push(to_idx);
                        reverse_edges[to_idx].push(from_idx);
                    }
                    None => findings
                        .unknown_dependencies
                        .push((stage.name.clone(), dep.clone())),
                }
            }
        }

        let graph = ExecutionGraph {
            stages: self.stages,
            index_map,
            forward_edges,
            reverse_edges,
        };

        Self::find_cycles(&graph, &mut findings);

        (graph, findings)
    }

    /// DFS with an explicit recursion stack; each back-edge is reported once.
    fn find_cycles(graph: &ExecutionGraph, findings: &mut GraphFindings) {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut colors = vec![Color::White; graph.len()];

        fn visit(
            graph: &ExecutionGraph,
            node: NodeIndex,
            colors: &mut Vec<Color>,
            findings: &mut GraphFindings,
        ) {
            colors[node] = Color::Gray;
            for &next in graph.dependents(node) {
                match colors[next] {
                    Color::White => visit(graph, next, colors, findings),
                    Color::Gray => {
                        // Back-edge: node -> next closes a cycle.
                        let from = graph.stage(node).map(|s| s.name.clone()).unwrap_or_default();
                        let to = graph.stage(next).map(|s| s.name.clone()).unwrap_or_default();
                        findings.cycle_edges.push((from, to));
                    }
                    Color::Black => {}
                }
            }
            colors[node] = Color::Black;
        }

        for start in 0..graph.len() {
            if colors[start] == Color::White {
                visit(graph, start, &mut colors, findings);
            }
        }
    }
}
