mod diagnostics;

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::error::CheckpointError;
use crate::executor::Executor;
use crate::graph::{Graph, walk_subgraph_to_update};
use crate::io::{RUN_STYLE, TASK_STYLE, as_overhead};
use crate::key::CallKey;
use crate::task::{TaskKey, TaskRef};

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Summary of a single [`run_task_graph`] call.
#[derive(Debug, Clone, Default)]
pub struct RunInfo {
    /// Number of recomputed tasks per store path.
    pub stats: BTreeMap<Utf8PathBuf, usize>,
    /// Timing of every recomputed task.
    pub executions: HashMap<TaskKey, TaskExecution>,
    /// `(upstream, downstream)` pairs among the recomputed tasks.
    pub edges: Vec<(TaskKey, TaskKey)>,
}

impl RunInfo {
    /// Total number of recomputed tasks.
    pub fn total(&self) -> usize {
        self.stats.values().sum()
    }
}

/// Message sent by a worker when a task finishes, successfully or not.
struct Completion {
    key: TaskKey,
    outcome: Result<(), CheckpointError>,
    start: Instant,
    duration: Duration,
}

/// Stale part of a graph, flattened into lookup tables.
#[derive(Default)]
struct Plan {
    nodes: HashMap<TaskKey, TaskRef>,
    /// Stale tasks waiting for the key.
    descendants: HashMap<TaskKey, HashSet<TaskKey>>,
    /// Stale tasks the key is waiting for.
    precedents: HashMap<TaskKey, HashSet<TaskKey>>,
    groups: BTreeMap<Utf8PathBuf, Vec<CallKey>>,
}

impl Plan {
    fn new(active: &[&Graph]) -> Result<Self, CheckpointError> {
        let mut plan = Plan::default();

        for graph in active {
            let key = graph.root.to_tuple();
            plan.nodes.entry(key).or_insert_with(|| graph.root.clone());
        }

        for graph in active {
            let key = graph.root.to_tuple();

            let upstream: HashSet<_> = graph
                .upstream_graphs
                .iter()
                .map(|graph| graph.root.to_tuple())
                .filter(|key| plan.nodes.contains_key(key))
                .collect();

            match plan.precedents.entry(key.clone()) {
                Entry::Vacant(entry) => {
                    for up in &upstream {
                        plan.descendants
                            .entry(up.clone())
                            .or_default()
                            .insert(key.clone());
                    }
                    entry.insert(upstream);
                    plan.groups
                        .entry(key.store.clone())
                        .or_default()
                        .push(key.key);
                }
                Entry::Occupied(entry) => {
                    if *entry.get() != upstream {
                        return Err(CheckpointError::InconsistentDependencies(key));
                    }
                }
            }
        }

        Ok(plan)
    }

    fn edges(&self) -> Vec<(TaskKey, TaskKey)> {
        let mut edges: Vec<_> = self
            .precedents
            .iter()
            .flat_map(|(key, upstream)| upstream.iter().map(|up| (up.clone(), key.clone())))
            .collect();
        edges.sort();
        edges
    }

    fn leaves(&self) -> BTreeMap<Utf8PathBuf, Vec<CallKey>> {
        let mut leaves = BTreeMap::new();

        for (store, keys) in &self.groups {
            let ready: Vec<_> = keys
                .iter()
                .filter(|key| {
                    let task = TaskKey {
                        store: store.clone(),
                        key: (*key).clone(),
                    };
                    self.precedents.get(&task).is_none_or(HashSet::is_empty)
                })
                .cloned()
                .collect();

            if !ready.is_empty() {
                leaves.insert(store.clone(), ready);
            }
        }

        leaves
    }
}

/// Recomputes every stale task of `graph` on `executor`.
///
/// A task is submitted only once all of its stale upstream tasks have been
/// stored, and never while its factory already has `max_concurrency` tasks
/// running. The first failing task aborts the run; tasks already running are
/// allowed to finish, nothing else is submitted.
pub fn run_task_graph(graph: &Graph, executor: &Executor) -> Result<RunInfo, CheckpointError> {
    let s = Instant::now();

    let active = walk_subgraph_to_update(graph);
    let mut plan = Plan::new(&active)?;

    let stats: BTreeMap<_, _> = plan
        .groups
        .iter()
        .map(|(store, keys)| (store.clone(), keys.len()))
        .collect();
    let edges = plan.edges();
    let total_tasks = plan.nodes.len();

    if total_tasks == 0 {
        tracing::debug!("nothing to update for {}", graph.root.name());
        return Ok(RunInfo::default());
    }

    tracing::info!("following tasks will be called: {stats:?}");

    // Read concurrency budgets
    let mut budgets: HashMap<Utf8PathBuf, NonZeroUsize> = HashMap::new();
    for task in plan.nodes.values() {
        if let Some(limit) = task.max_concurrency() {
            budgets.insert(task.to_tuple().store, limit);
        }
    }
    let mut occupied: HashMap<Utf8PathBuf, usize> =
        budgets.keys().map(|store| (store.clone(), 0)).collect();

    let mut leaves = plan.leaves();
    let mut executions = HashMap::new();

    let root_span = tracing::span!(Level::INFO, "running_tasks");
    root_span.pb_set_length(total_tasks as u64);
    root_span.pb_set_style(&RUN_STYLE);
    root_span.pb_set_message("Running tasks...");
    let _enter = root_span.enter();

    executor.pool().in_place_scope(|scope| -> Result<(), CheckpointError> {
        let (result_sender, result_receiver) = channel::<Completion>();
        let mut in_process = 0usize;

        while !leaves.is_empty() || in_process > 0 {
            tracing::debug!(
                "desc: {}, prec: {}, leaves: {}, in_process: {}",
                plan.descendants.len(),
                plan.precedents.len(),
                leaves.len(),
                in_process
            );

            // Submit all leaf tasks the budgets allow
            let mut leftover = BTreeMap::new();
            for (store, mut keys) in std::mem::take(&mut leaves) {
                if let Some(budget) = budgets.get(&store) {
                    let occupied = occupied.entry(store.clone()).or_default();
                    let free = budget.get().saturating_sub(*occupied).min(keys.len());
                    let to_hold = keys.split_off(free);
                    *occupied += keys.len();
                    if !to_hold.is_empty() {
                        leftover.insert(store.clone(), to_hold);
                    }
                }

                for key in keys {
                    let key = TaskKey {
                        store: store.clone(),
                        key,
                    };
                    let task = plan.nodes.get(&key).cloned().ok_or_else(|| {
                        CheckpointError::Invariant(format!("{key:?} is not part of the plan"))
                    })?;

                    let sender = result_sender.clone();
                    scope.spawn(move |_| {
                        let span = tracing::span!(Level::INFO, "task", name = %task.name());
                        span.pb_set_style(&TASK_STYLE);
                        span.pb_set_message(&format!("Running {}", task.name()));
                        let _enter = span.enter();

                        let start = Instant::now();

                        let outcome = match catch_unwind(AssertUnwindSafe(|| task.set_result())) {
                            Ok(result) => result.map(|_| ()),
                            Err(panic) => {
                                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                                    s.to_string()
                                } else if let Some(s) = panic.downcast_ref::<String>() {
                                    s.clone()
                                } else {
                                    String::from("unknown payload")
                                };

                                Err(CheckpointError::Panic(task.name(), msg))
                            }
                        };

                        // The scheduler may have bailed out already.
                        let _ = sender.send(Completion {
                            key,
                            outcome,
                            start,
                            duration: start.elapsed(),
                        });
                    });

                    in_process += 1;
                }
            }
            leaves = leftover;

            if in_process == 0 {
                return Err(CheckpointError::Invariant(format!(
                    "{} leaf groups are held back with nothing running",
                    leaves.len()
                )));
            }

            // Wait for the first completion, then take whatever else is ready
            let first = result_receiver
                .recv()
                .map_err(|_| CheckpointError::Invariant("result channel closed".into()))?;
            let mut done = vec![first];
            done.extend(result_receiver.try_iter());
            in_process -= done.len();

            for Completion {
                key,
                outcome,
                start,
                duration,
            } in done
            {
                if let Err(err) = &outcome {
                    tracing::error!("task {key:?} failed: {err}");
                }
                outcome?;

                tracing::debug!("finished {key:?} in {duration:.2?}");
                executions.insert(key.clone(), TaskExecution { start, duration });
                root_span.pb_inc(1);

                if let Some(occupied) = occupied.get_mut(&key.store) {
                    *occupied = occupied.checked_sub(1).ok_or_else(|| {
                        CheckpointError::Invariant(format!("budget of {} underflowed", key.store))
                    })?;
                }

                plan.nodes.remove(&key);

                if plan.precedents.remove(&key).is_some_and(|prec| !prec.is_empty()) {
                    return Err(CheckpointError::Invariant(format!(
                        "{key:?} finished before its upstream"
                    )));
                }

                // Unlock dependents
                for next in plan.descendants.remove(&key).unwrap_or_default() {
                    if let Some(prec) = plan.precedents.get_mut(&next) {
                        prec.remove(&key);
                        if prec.is_empty() {
                            leaves.entry(next.store).or_default().push(next.key);
                        }
                    }
                }
            }
        }

        Ok(())
    })?;

    if !plan.nodes.is_empty()
        || !plan.descendants.is_empty()
        || !plan.precedents.is_empty()
        || occupied.values().any(|&n| n != 0)
    {
        return Err(CheckpointError::Invariant(format!(
            "{} tasks were never run",
            plan.nodes.len()
        )));
    }

    tracing::info!("updated {total_tasks} tasks {}", as_overhead(s));

    Ok(RunInfo {
        stats,
        executions,
        edges,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use camino::Utf8Path;
    use tempfile::TempDir;

    use super::*;
    use crate::args;
    use crate::config::Config;
    use crate::connect::requires;
    use crate::task::{Runner, Task, TaskFactory};

    fn config(dir: &TempDir) -> Config {
        Config::default().with_cache_dir(Utf8Path::from_path(dir.path()).unwrap())
    }

    #[test]
    fn test_diamond_runs_shared_upstream_once() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let base: TaskFactory<i64> = TaskFactory::builder("tests.base")
            .build(&config, move |_| {
                let counter = counter.clone();
                Ok(Runner::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(2)
                }))
            })
            .unwrap();
        let base = base.call(args![]).unwrap();

        let upstream = base.clone();
        let scale: TaskFactory<i64> = TaskFactory::builder("tests.scale")
            .param("by")
            .build(&config, move |args| {
                let by: i64 = args.get("by")?;
                Ok(requires(upstream.clone()).then(move |x: i64| Ok(x * by)).runner())
            })
            .unwrap();

        let deps = vec![scale.call(args![3]).unwrap(), scale.call(args![5]).unwrap()];
        let sum: TaskFactory<i64> = TaskFactory::builder("tests.sum")
            .build(&config, move |_| {
                Ok(requires(deps.clone()).then(|xs: Vec<i64>| Ok(xs.iter().sum::<i64>())).runner())
            })
            .unwrap();

        let executor = Executor::new(4).unwrap();
        let (value, info) = sum.call(args![]).unwrap().run_with_info(Some(&executor)).unwrap();

        assert_eq!(value, 16);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(info.total(), 4);
        assert_eq!(info.stats[sum.store().path()], 1);
        assert_eq!(info.stats[scale.store().path()], 2);
        assert_eq!(info.edges.len(), 4);
        assert_eq!(info.executions.len(), 4);
    }

    #[test]
    fn test_fresh_graph_runs_nothing() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        let one: TaskFactory<i64> = TaskFactory::builder("tests.one")
            .build(&config, |_| Ok(Runner::new(|| Ok(1))))
            .unwrap();
        let task = one.call(args![]).unwrap();
        task.set_result().unwrap();

        let executor = Executor::new(1).unwrap();
        let info = run_task_graph(&task.graph().unwrap(), &executor).unwrap();
        assert_eq!(info.total(), 0);
        assert!(info.executions.is_empty());
    }

    #[test]
    fn test_panic_is_reported() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        let boom: TaskFactory<i64> = TaskFactory::builder("tests.boom")
            .build(&config, |_| Ok(Runner::new(|| panic!("kaboom"))))
            .unwrap();
        let task = boom.call(args![]).unwrap();

        let executor = Executor::new(1).unwrap();
        let err = task.run_with(&executor).unwrap_err();

        assert!(matches!(err, CheckpointError::Panic(_, ref msg) if msg == "kaboom"));
        assert!(!boom.store().contains(task.key()));
    }

    #[test]
    fn test_inconsistent_dependencies() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        let leaf: TaskFactory<i64> = TaskFactory::builder("tests.leaf")
            .param("x")
            .build(&config, |args| {
                let x: i64 = args.get("x")?;
                Ok(Runner::new(move || Ok(x)))
            })
            .unwrap();

        // Same factory path and arguments, different upstream tasks.
        let pick = |dep: Task<i64>| -> Task<i64> {
            let factory: TaskFactory<i64> = TaskFactory::builder("tests.pick")
                .build(&config, move |_| {
                    Ok(requires(dep.clone()).then(|x: i64| Ok(x)).runner())
                })
                .unwrap();
            factory.call(args![]).unwrap()
        };
        let x = pick(leaf.call(args![1]).unwrap());
        let y = pick(leaf.call(args![2]).unwrap());
        assert_eq!(x.to_tuple(), y.to_tuple());

        let top: TaskFactory<(i64, i64)> = TaskFactory::builder("tests.top")
            .build(&config, move |_| {
                Ok(requires((x.clone(), y.clone()))
                    .then(|pair: (i64, i64)| Ok(pair))
                    .runner())
            })
            .unwrap();

        let executor = Executor::new(2).unwrap();
        let err = top.call(args![]).unwrap().run_with(&executor).unwrap_err();
        assert!(matches!(err, CheckpointError::InconsistentDependencies(_)));
    }

    #[test]
    fn test_mermaid() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        let one: TaskFactory<i64> = TaskFactory::builder("tests.one")
            .build(&config, |_| Ok(Runner::new(|| Ok(1))))
            .unwrap();
        let upstream = one.call(args![]).unwrap();
        let two: TaskFactory<i64> = TaskFactory::builder("tests.two")
            .build(&config, move |_| {
                Ok(requires(upstream.clone()).then(|x: i64| Ok(x + 1)).runner())
            })
            .unwrap();

        let executor = Executor::new(2).unwrap();
        let (_, info) = two.call(args![]).unwrap().run_with_info(Some(&executor)).unwrap();
        let chart = info.render_mermaid();

        assert!(chart.starts_with("graph LR"));
        assert!(chart.contains("tests.one"));
        assert!(chart.contains("tests.two"));
        assert!(chart.contains("-->"));
    }
}
