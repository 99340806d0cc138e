//! Stage dependency graph, cycle detection, and batch computation.
//!
//! Uses `petgraph` to model stage dependencies as a directed graph with an
//! edge from each dependency to its dependent. Nodes are inserted in
//! declaration order, so node index order doubles as the tie-break order for
//! every traversal and query result.
//!
//! Construction only checks that `depends_on` targets exist. Cycle detection
//! is a separate DFS pass (`detect_cycles`) so callers can report the cycle
//! path, and batch computation (`compute_execution_batches`) is Kahn's
//! algorithm layered by readiness.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use swdl_types::workflow::StageDefinition;

use super::definition::WorkflowError;

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// Immutable dependency graph over a workflow's stages.
#[derive(Debug, Clone)]
pub struct Dag {
    graph: DiGraph<StageDefinition, ()>,
    index: HashMap<String, NodeIndex>,
}

/// A maximal set of stages that may run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    pub index: usize,
    /// Declaration order.
    pub stage_ids: Vec<String>,
}

/// Build the graph: one node per stage, one edge per `depends_on` entry.
///
/// Fails with a validation error naming both stages when a dependency target
/// does not exist. Does not look for cycles.
pub fn build_dag(stages: &[StageDefinition]) -> Result<Dag, WorkflowError> {
    let mut graph = DiGraph::<StageDefinition, ()>::with_capacity(stages.len(), stages.len());
    let mut index = HashMap::with_capacity(stages.len());

    for stage in stages {
        if index.contains_key(&stage.id) {
            return Err(WorkflowError::Validation(format!(
                "duplicate stage id '{}'",
                stage.id
            )));
        }
        let node = graph.add_node(stage.clone());
        index.insert(stage.id.clone(), node);
    }

    for stage in stages {
        let to = index[&stage.id];
        for dep in &stage.depends_on {
            let from = index.get(dep).copied().ok_or_else(|| {
                WorkflowError::Validation(format!(
                    "stage '{}' depends on unknown stage '{}'",
                    stage.id, dep
                ))
            })?;
            graph.update_edge(from, to, ());
        }
    }

    Ok(Dag { graph, index })
}

impl Dag {
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    fn node(&self, stage_id: &str) -> Result<NodeIndex, WorkflowError> {
        self.index
            .get(stage_id)
            .copied()
            .ok_or_else(|| WorkflowError::StageNotFound(stage_id.to_string()))
    }

    fn id(&self, node: NodeIndex) -> &str {
        self.graph[node].id.as_str()
    }

    /// Neighbors sorted into declaration order.
    fn neighbors(&self, node: NodeIndex, dir: Direction) -> Vec<NodeIndex> {
        let mut out: Vec<NodeIndex> = self.graph.neighbors_directed(node, dir).collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    pub fn get_stage(&self, stage_id: &str) -> Result<&StageDefinition, WorkflowError> {
        Ok(&self.graph[self.node(stage_id)?])
    }

    /// Every stage id in declaration order.
    pub fn all_stage_ids(&self) -> Vec<&str> {
        self.graph.node_indices().map(|n| self.id(n)).collect()
    }

    /// Stages with no dependencies.
    pub fn get_roots(&self) -> Vec<&str> {
        self.graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|n| self.id(n))
            .collect()
    }

    /// Stages that directly depend on `stage_id`.
    pub fn get_successors(&self, stage_id: &str) -> Result<Vec<&str>, WorkflowError> {
        let node = self.node(stage_id)?;
        Ok(self
            .neighbors(node, Direction::Outgoing)
            .into_iter()
            .map(|n| self.id(n))
            .collect())
    }

    /// Stages `stage_id` directly depends on.
    pub fn get_predecessors(&self, stage_id: &str) -> Result<Vec<&str>, WorkflowError> {
        let node = self.node(stage_id)?;
        Ok(self
            .neighbors(node, Direction::Incoming)
            .into_iter()
            .map(|n| self.id(n))
            .collect())
    }

    /// Every stage reachable from `stage_id` along dependency edges, in
    /// declaration order, excluding `stage_id` itself.
    pub fn transitive_successors(&self, stage_id: &str) -> Result<Vec<&str>, WorkflowError> {
        let start = self.node(stage_id)?;
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if next != start && seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        let mut nodes: Vec<NodeIndex> = seen.into_iter().collect();
        nodes.sort_unstable();
        Ok(nodes.into_iter().map(|n| self.id(n)).collect())
    }
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnPath,
    Done,
}

/// Depth-first search for a dependency loop.
///
/// On finding one, the error carries the ids along the loop with the first
/// id repeated at the end (`[a, b, a]`).
pub fn detect_cycles(dag: &Dag) -> Result<(), WorkflowError> {
    let mut marks = vec![Mark::Unvisited; dag.len()];
    let mut path = Vec::new();

    for start in dag.graph.node_indices() {
        if marks[start.index()] == Mark::Unvisited {
            if let Some(cycle) = visit(dag, start, &mut marks, &mut path) {
                tracing::debug!(cycle = ?cycle, "dependency cycle detected");
                return Err(WorkflowError::Cycle { path: cycle });
            }
        }
    }
    Ok(())
}

fn visit(
    dag: &Dag,
    node: NodeIndex,
    marks: &mut [Mark],
    path: &mut Vec<NodeIndex>,
) -> Option<Vec<String>> {
    marks[node.index()] = Mark::OnPath;
    path.push(node);

    for next in dag.neighbors(node, Direction::Outgoing) {
        match marks[next.index()] {
            Mark::OnPath => {
                let start = path.iter().position(|&n| n == next).unwrap_or(0);
                let mut cycle: Vec<String> =
                    path[start..].iter().map(|&n| dag.id(n).to_string()).collect();
                cycle.push(dag.id(next).to_string());
                return Some(cycle);
            }
            Mark::Unvisited => {
                if let Some(cycle) = visit(dag, next, marks, path) {
                    return Some(cycle);
                }
            }
            Mark::Done => {}
        }
    }

    path.pop();
    marks[node.index()] = Mark::Done;
    None
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

/// Layer stages into batches with Kahn's algorithm.
///
/// Batch 0 holds every stage with no dependencies; each following batch holds
/// the stages whose dependencies all sit in earlier batches. Stages left over
/// mean the graph has a cycle.
pub fn compute_execution_batches(dag: &Dag) -> Result<Vec<Batch>, WorkflowError> {
    let mut pending: Vec<usize> = dag
        .graph
        .node_indices()
        .map(|n| dag.neighbors(n, Direction::Incoming).len())
        .collect();

    let mut ready: Vec<NodeIndex> = dag
        .graph
        .node_indices()
        .filter(|n| pending[n.index()] == 0)
        .collect();
    let mut batches = Vec::new();
    let mut placed = 0;

    while !ready.is_empty() {
        ready.sort_unstable();
        let mut next = Vec::new();
        for &node in &ready {
            for succ in dag.neighbors(node, Direction::Outgoing) {
                pending[succ.index()] -= 1;
                if pending[succ.index()] == 0 {
                    next.push(succ);
                }
            }
        }
        placed += ready.len();
        batches.push(Batch {
            index: batches.len(),
            stage_ids: ready.iter().map(|&n| dag.id(n).to_string()).collect(),
        });
        ready = next;
    }

    if placed < dag.len() {
        let stuck = dag
            .graph
            .node_indices()
            .filter(|n| pending[n.index()] > 0)
            .map(|n| dag.id(n).to_string())
            .collect();
        return Err(WorkflowError::Cycle { path: stuck });
    }
    Ok(batches)
}

/// Stage id -> batch index.
pub fn batch_index_map(batches: &[Batch]) -> HashMap<String, u32> {
    batches
        .iter()
        .flat_map(|b| b.stage_ids.iter().map(move |id| (id.clone(), b.index as u32)))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
