//! Staleness-annotated dependency graphs.
//!
//! The graph is rebuilt from scratch for every run: each node reads the
//! current timestamp of its cache entry and is marked stale (`timestamp` set
//! to `None`) when the entry is missing, older than the factory's source
//! fingerprint, or not strictly newer than every upstream entry. Staleness
//! therefore propagates downstream on its own: once a node is stale, every
//! node reading from it is stale too.
//!
//! A task reachable along several paths is visited once per build. Its
//! subgraph is shared between all of its dependents.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::connect::get_upstream;
use crate::core::Timestamp;
use crate::error::CheckpointError;
use crate::task::{TaskKey, TaskRef};

/// A task, its freshness and the graphs of everything it reads from.
#[derive(Debug, Clone)]
pub struct Graph {
    pub root: TaskRef,
    /// `None` when the root must be recomputed.
    pub timestamp: Option<Timestamp>,
    /// The task this graph was first reached from, `None` for the top-level
    /// task.
    pub downstream: Option<TaskRef>,
    pub upstream_graphs: Vec<Arc<Graph>>,
}

impl Graph {
    pub fn build(task: &TaskRef, downstream: Option<&TaskRef>) -> Result<Self, CheckpointError> {
        Builder::default().node(task, downstream)
    }

    pub fn is_stale(&self) -> bool {
        self.timestamp.is_none()
    }
}

#[derive(Default)]
struct Builder {
    seen: HashMap<TaskKey, Arc<Graph>>,
}

impl Builder {
    fn shared(
        &mut self,
        task: &TaskRef,
        downstream: &TaskRef,
    ) -> Result<Arc<Graph>, CheckpointError> {
        let key = task.to_tuple();

        if let Some(graph) = self.seen.get(&key) {
            let declared: HashSet<_> = get_upstream(task).iter().map(TaskRef::to_tuple).collect();
            let known: HashSet<_> = graph
                .upstream_graphs
                .iter()
                .map(|graph| graph.root.to_tuple())
                .collect();

            if declared != known {
                return Err(CheckpointError::InconsistentDependencies(key));
            }
            return Ok(graph.clone());
        }

        let graph = Arc::new(self.node(task, Some(downstream))?);
        self.seen.insert(key, graph.clone());
        Ok(graph)
    }

    fn node(
        &mut self,
        task: &TaskRef,
        downstream: Option<&TaskRef>,
    ) -> Result<Graph, CheckpointError> {
        let upstream_graphs = get_upstream(task)
            .iter()
            .map(|upstream| self.shared(upstream, task))
            .collect::<Result<Vec<_>, _>>()?;

        let mut timestamp = task.peek_timestamp()?;

        if let Some(own) = timestamp {
            let outdated_source = task.source_timestamp().is_some_and(|source| own < source);
            let outdated_upstream = upstream_graphs
                .iter()
                .any(|graph| graph.timestamp.is_none_or(|upstream| upstream >= own));

            if outdated_source || outdated_upstream {
                tracing::trace!("{} is stale", task.name());
                timestamp = None;
            }
        }

        Ok(Graph {
            root: task.clone(),
            timestamp,
            downstream: downstream.cloned(),
            upstream_graphs,
        })
    }
}

/// Collects every stale subgraph reachable from `graph` through stale nodes.
///
/// Fresh subtrees are never entered. Each task is returned once, however many
/// paths lead to it.
pub fn walk_subgraph_to_update(graph: &Graph) -> Vec<&Graph> {
    let mut acc = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![graph];

    while let Some(graph) = stack.pop() {
        if graph.is_stale() && seen.insert(graph.root.to_tuple()) {
            acc.push(graph);
            stack.extend(graph.upstream_graphs.iter().map(Arc::as_ref));
        }
    }

    acc
}
