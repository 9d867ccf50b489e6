//! Dependency analysis: turn an ordered plan into topologically-ordered
//! batches of parallel-safe tasks.
//!
//! A task depends on another when its prompt template references the other
//! task's name, or references `prev_output` (which always binds to the
//! authored-order predecessor). Identifiers that match no task name and no
//! reserved name are external inputs and induce no dependency.

use std::collections::{HashMap, HashSet};

use petgraph::{Direction, graph::NodeIndex, prelude::StableGraph};

use crate::error::{EngineError, EngineResult};
use crate::task::TaskDefinition;
use crate::template::{self, PREV_OUTPUT, USER_REQUEST};

/// Tasks with no mutual dependencies, safe to execute concurrently.
/// Authored order is preserved within a batch for log determinism.
pub type Batch = Vec<TaskDefinition>;

#[derive(Debug, Default)]
pub struct DependencyAnalyzer;

impl DependencyAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Emit the ordered batch list for a plan. The flattened batches form a
    /// valid topological order of the dependency DAG; a cycle makes the plan
    /// invalid.
    pub fn analyze(&self, tasks: &[TaskDefinition]) -> EngineResult<Vec<Batch>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let mut seen = HashSet::new();
        for task in tasks {
            if task.task_name.trim().is_empty() {
                return Err(EngineError::invalid_input("task name must not be blank"));
            }
            if !seen.insert(task.task_name.as_str()) {
                return Err(EngineError::invalid_input(format!(
                    "duplicate task name '{}'",
                    task.task_name
                )));
            }
        }

        let mut graph: StableGraph<usize, ()> = StableGraph::new();
        let mut node_of: HashMap<&str, NodeIndex> = HashMap::with_capacity(tasks.len());
        for (index, task) in tasks.iter().enumerate() {
            let node = graph.add_node(index);
            node_of.insert(task.task_name.as_str(), node);
        }

        for (index, task) in tasks.iter().enumerate() {
            let node = node_of[task.task_name.as_str()];
            for variable in template::extract_variable_names(&task.prompt_template) {
                if variable == USER_REQUEST {
                    continue;
                }
                if variable == PREV_OUTPUT {
                    if index > 0 {
                        let predecessor = node_of[tasks[index - 1].task_name.as_str()];
                        graph.add_edge(predecessor, node, ());
                    }
                    continue;
                }
                if let Some(&dependency) = node_of.get(variable.as_str()) {
                    // A self-reference becomes a self-edge, caught below as
                    // a cycle.
                    graph.add_edge(dependency, node, ());
                }
            }
        }

        // Layered topological selection: repeatedly take every remaining
        // task whose dependencies are all completed. Zero progress with
        // tasks remaining means a cycle.
        let mut completed: HashSet<NodeIndex> = HashSet::with_capacity(tasks.len());
        let mut remaining: Vec<NodeIndex> = tasks
            .iter()
            .map(|task| node_of[task.task_name.as_str()])
            .collect();
        let mut batches = Vec::new();

        while !remaining.is_empty() {
            let ready: Vec<NodeIndex> = remaining
                .iter()
                .copied()
                .filter(|&node| {
                    graph
                        .neighbors_directed(node, Direction::Incoming)
                        .all(|dependency| completed.contains(&dependency))
                })
                .collect();

            if ready.is_empty() {
                let stuck: Vec<&str> = remaining
                    .iter()
                    .map(|&node| tasks[graph[node]].task_name.as_str())
                    .collect();
                return Err(EngineError::invalid_input(
                    "cycle detected in task dependencies",
                )
                .with_context(stuck.join(", ")));
            }

            completed.extend(ready.iter().copied());
            remaining.retain(|node| !completed.contains(node));
            batches.push(
                ready
                    .iter()
                    .map(|&node| tasks[graph[node]].clone())
                    .collect(),
            );
        }

        tracing::debug!(
            tasks = tasks.len(),
            batches = batches.len(),
            "dependency analysis complete"
        );
        Ok(batches)
    }
}
