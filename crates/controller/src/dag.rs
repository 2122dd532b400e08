//! Task dependency graph.
//!
//! The graph is never persisted. Each reconcile pass builds it from the task
//! list, queries it and drops it.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;

use crate::api::{Task, TaskPhase, TaskStatus, Workflow};
use crate::error::{ControllerError, ControllerResult};

/// How many succeeded dependencies a task needs before it can start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyPolicy {
    /// Every dependency has succeeded.
    #[default]
    All,
    /// At least one dependency has succeeded. Sibling dependencies may
    /// still be running when the task starts.
    Any,
}

/// One task in the graph. `prev` and `next` are positions in task order.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub prev: Vec<usize>,
    pub next: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct Dag {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl Dag {
    /// Build the graph from an ordered task list.
    ///
    /// A dependency must name a task that appears earlier in the list (or
    /// the task itself, which `validate` then reports as a cycle).
    pub fn build(tasks: &[Task]) -> ControllerResult<Self> {
        let mut dag = Dag::default();

        for task in tasks {
            let id = dag.nodes.len();
            dag.nodes.push(Node {
                name: task.name.clone(),
                prev: Vec::new(),
                next: Vec::new(),
            });
            dag.index.insert(task.name.clone(), id);

            for dependency in &task.dependencies {
                let dep = *dag
                    .index
                    .get(dependency)
                    .ok_or_else(|| ControllerError::DependencyNotFound(dependency.clone()))?;
                dag.nodes[id].prev.push(dep);
                dag.nodes[dep].next.push(id);
            }
        }

        Ok(dag)
    }

    /// True when the graph is acyclic and has exactly one root.
    pub fn validate(&self) -> bool {
        !self.has_cycle() && self.has_single_root()
    }

    #[cfg(test)]
    fn node(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&id| &self.nodes[id])
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The first node without dependencies.
    pub(crate) fn root(&self) -> Option<&Node> {
        self.nodes.iter().find(|node| node.prev.is_empty())
    }

    /// Names of the nodes `node` depends on.
    pub(crate) fn dependencies_of<'a>(&'a self, node: &'a Node) -> impl Iterator<Item = &'a str> + 'a {
        node.prev.iter().map(move |&id| self.nodes[id].name.as_str())
    }

    /// Names of the nodes that depend on `node`.
    #[cfg(test)]
    fn dependents_of<'a>(&'a self, node: &'a Node) -> impl Iterator<Item = &'a str> + 'a {
        node.next.iter().map(move |&id| self.nodes[id].name.as_str())
    }

    fn has_single_root(&self) -> bool {
        self.nodes.iter().filter(|node| node.prev.is_empty()).count() == 1
    }

    fn has_cycle(&self) -> bool {
        let mut on_path = vec![false; self.nodes.len()];
        (0..self.nodes.len()).any(|id| self.cycle_from(id, &mut on_path))
    }

    // Marks are cleared on the way out, so only the current path counts.
    fn cycle_from(&self, id: usize, on_path: &mut [bool]) -> bool {
        if on_path[id] {
            return true;
        }
        on_path[id] = true;
        let found = self.nodes[id]
            .prev
            .iter()
            .any(|&prev| self.cycle_from(prev, on_path));
        on_path[id] = false;
        found
    }
}

/// Nodes with no status record whose dependency condition holds.
pub fn find_schedulable_nodes<'a>(
    dag: &'a Dag,
    task_status: &BTreeMap<String, TaskStatus>,
    policy: DependencyPolicy,
) -> Vec<&'a Node> {
    let succeeded = |id: &usize| {
        task_status
            .get(&dag.nodes[*id].name)
            .is_some_and(|status| status.status == TaskPhase::Succeeded)
    };

    dag.nodes
        .iter()
        .filter(|node| !task_status.contains_key(&node.name))
        .filter(|node| {
            node.prev.is_empty()
                || match policy {
                    DependencyPolicy::All => node.prev.iter().all(succeeded),
                    DependencyPolicy::Any => node.prev.iter().any(succeeded),
                }
        })
        .collect()
}

/// Resolve nodes back to their task definitions, in node order.
pub fn find_schedulable_tasks(nodes: &[&Node], tasks: &[Task]) -> Vec<Task> {
    nodes
        .iter()
        .filter_map(|node| tasks.iter().find(|task| task.name == node.name))
        .cloned()
        .collect()
}

/// Names of tasks whose last observed phase is Succeeded or Failed.
pub fn find_completed_tasks(workflow: &Workflow) -> Vec<String> {
    workflow
        .task_status()
        .into_iter()
        .flat_map(|statuses| statuses.values())
        .filter(|status| status.status.is_terminal())
        .map(|status| status.name.clone())
        .collect()
}
