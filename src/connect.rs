//! Connectors: declaring which upstream tasks a runner reads from.
//!
//! A runner which needs the results of other tasks is built with
//! [`requires`]:
//!
//! ```rust,ignore
//! requires((left, right)).then(|(l, r): (i64, i64)| Ok(l + r))
//! ```
//!
//! The connector records the upstream tasks, so the graph builder can find
//! them, and loads their cached results right before the continuation runs.
//! Connectors nest with [`Connector::connect`]: the inner layer's resolved
//! values are passed *in front of* the outer layer's values.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::hash::Hash;

use camino::Utf8PathBuf;

use crate::error::CheckpointError;
use crate::task::{Cacheable, Run, Runner, Task, TaskContext, TaskRef};

/// A collection of upstream tasks with a known shape.
///
/// The shape of the collection determines the shape of the resolved value:
/// a single task resolves to its result, a `Vec` of tasks to a `Vec` of
/// results, a map to a map with the same keys and a tuple to a tuple.
pub trait Dependencies: Send + Sync {
    /// The resolved values, mirroring the shape of `Self`.
    type Output;

    /// Every task in the collection, in no particular order.
    fn tasks(&self) -> Vec<TaskRef>;

    /// Loads the cached result of every task in the collection.
    fn resolve(&self) -> Result<Self::Output, CheckpointError>;
}

impl Dependencies for () {
    type Output = ();

    fn tasks(&self) -> Vec<TaskRef> {
        vec![]
    }

    fn resolve(&self) -> Result<Self::Output, CheckpointError> {
        Ok(())
    }
}

impl<T> Dependencies for Task<T>
where
    T: Cacheable,
{
    type Output = T;

    fn tasks(&self) -> Vec<TaskRef> {
        vec![self.erase()]
    }

    fn resolve(&self) -> Result<Self::Output, CheckpointError> {
        self.get_result()
    }
}

impl<T> Dependencies for Vec<Task<T>>
where
    T: Cacheable,
{
    type Output = Vec<T>;

    fn tasks(&self) -> Vec<TaskRef> {
        self.iter().map(Task::erase).collect()
    }

    fn resolve(&self) -> Result<Self::Output, CheckpointError> {
        self.iter().map(Task::get_result).collect()
    }
}

impl<K, T> Dependencies for BTreeMap<K, Task<T>>
where
    K: Ord + Clone + Send + Sync,
    T: Cacheable,
{
    type Output = BTreeMap<K, T>;

    fn tasks(&self) -> Vec<TaskRef> {
        self.values().map(Task::erase).collect()
    }

    fn resolve(&self) -> Result<Self::Output, CheckpointError> {
        self.iter()
            .map(|(k, task)| Ok((k.clone(), task.get_result()?)))
            .collect()
    }
}

impl<K, T> Dependencies for HashMap<K, Task<T>>
where
    K: Eq + Hash + Clone + Send + Sync,
    T: Cacheable,
{
    type Output = HashMap<K, T>;

    fn tasks(&self) -> Vec<TaskRef> {
        self.values().map(Task::erase).collect()
    }

    fn resolve(&self) -> Result<Self::Output, CheckpointError> {
        self.iter()
            .map(|(k, task)| Ok((k.clone(), task.get_result()?)))
            .collect()
    }
}

macro_rules! impl_deps {
    ($($D:ident),*) => {
        #[allow(non_snake_case)]
        impl<$($D),*> Dependencies for ($($D,)*)
        where
            $($D: Dependencies),* {
            type Output = ($($D::Output,)*);

            fn tasks(&self) -> Vec<TaskRef> {
                let ($($D,)*) = self;
                let mut acc = Vec::new();
                $(acc.extend($D.tasks());)*
                acc
            }

            fn resolve(&self) -> Result<Self::Output, CheckpointError> {
                let ($($D,)*) = self;
                Ok(($($D.resolve()?,)*))
            }
        }
    };
}

impl_deps!(A);
impl_deps!(A, B);
impl_deps!(A, B, C);
impl_deps!(A, B, C, D);
impl_deps!(A, B, C, D, E);
impl_deps!(A, B, C, D, E, F);
impl_deps!(A, B, C, D, E, F, G);
impl_deps!(A, B, C, D, E, F, G, H);

/// A function of the resolved upstream values, possibly nesting further
/// connectors.
pub trait Continuation<A>: Send + Sync {
    type Output;

    fn call(&self, context: &TaskContext, input: A) -> anyhow::Result<Self::Output>;

    fn upstream(&self, _: &mut Vec<TaskRef>) {}
}

/// A plain closure used as a runner or as the last continuation of a chain.
pub struct Func<F>(pub(crate) F);

impl<F, R> Run<R> for Func<F>
where
    F: Fn() -> anyhow::Result<R> + Send + Sync,
{
    fn call(&self, _: &TaskContext) -> anyhow::Result<R> {
        (self.0)()
    }
}

impl<F, A, R> Continuation<A> for Func<F>
where
    F: Fn(A) -> anyhow::Result<R> + Send + Sync,
{
    type Output = R;

    fn call(&self, _: &TaskContext, input: A) -> anyhow::Result<R> {
        (self.0)(input)
    }
}

/// A closure which additionally receives the task's scratch directory.
///
/// The directory is wiped and recreated right before every invocation.
pub struct WithDirectory<F>(F);

/// Hands the task's data directory to `func` as its first argument.
///
/// Used on its own as a runner, `func` receives just the directory. Used as
/// the continuation of a connector, it receives `(directory, values)`.
pub fn with_directory<F>(func: F) -> WithDirectory<F> {
    WithDirectory(func)
}

fn fresh_directory(context: &TaskContext) -> anyhow::Result<Utf8PathBuf> {
    let directory = context.directory.to_owned();
    if directory.exists() {
        fs::remove_dir_all(&directory)?;
    }
    fs::create_dir_all(&directory)?;
    Ok(directory)
}

impl<F, R> Run<R> for WithDirectory<F>
where
    F: Fn(Utf8PathBuf) -> anyhow::Result<R> + Send + Sync,
{
    fn call(&self, context: &TaskContext) -> anyhow::Result<R> {
        (self.0)(fresh_directory(context)?)
    }
}

impl<F, A, R> Continuation<A> for WithDirectory<F>
where
    F: Fn((Utf8PathBuf, A)) -> anyhow::Result<R> + Send + Sync,
{
    type Output = R;

    fn call(&self, context: &TaskContext, input: A) -> anyhow::Result<R> {
        (self.0)((fresh_directory(context)?, input))
    }
}

/// Upstream tasks waiting for a continuation, see [`requires`].
pub struct Connector<D> {
    deps: D,
}

/// Declares the upstream tasks of a runner.
pub fn requires<D>(deps: D) -> Connector<D>
where
    D: Dependencies,
{
    Connector { deps }
}

impl<D> Connector<D>
where
    D: Dependencies,
{
    /// Finishes the chain with a closure of the resolved values.
    pub fn then<F>(self, func: F) -> Connected<D, Func<F>> {
        Connected {
            deps: self.deps,
            next: Func(func),
        }
    }

    /// Continues with another layer, typically [`Connected`] or
    /// [`WithDirectory`].
    pub fn connect<C>(self, next: C) -> Connected<D, C> {
        Connected {
            deps: self.deps,
            next,
        }
    }
}

/// Upstream tasks bound to the continuation consuming their results.
pub struct Connected<D, C> {
    deps: D,
    next: C,
}

impl<D, C> Connected<D, C> {
    /// Erases the chain into a [`Runner`].
    pub fn runner<R>(self) -> Runner<R>
    where
        Self: Run<R> + 'static,
    {
        Runner::from_run(self)
    }
}

impl<D, C, R> Run<R> for Connected<D, C>
where
    D: Dependencies,
    C: Continuation<D::Output, Output = R>,
{
    fn call(&self, context: &TaskContext) -> anyhow::Result<R> {
        let resolved = self.deps.resolve()?;
        self.next.call(context, resolved)
    }

    fn upstream(&self, acc: &mut Vec<TaskRef>) {
        acc.extend(self.deps.tasks());
        self.next.upstream(acc);
    }
}

impl<D, C, A> Continuation<A> for Connected<D, C>
where
    D: Dependencies,
    C: Continuation<(D::Output, A)>,
{
    type Output = C::Output;

    fn call(&self, context: &TaskContext, input: A) -> anyhow::Result<Self::Output> {
        let resolved = self.deps.resolve()?;
        self.next.call(context, (resolved, input))
    }

    fn upstream(&self, acc: &mut Vec<TaskRef>) {
        acc.extend(self.deps.tasks());
        self.next.upstream(acc);
    }
}

impl<D, C, R> From<Connected<D, C>> for Runner<R>
where
    Connected<D, C>: Run<R> + 'static,
{
    fn from(value: Connected<D, C>) -> Self {
        Runner::from_run(value)
    }
}

impl<F, R> From<WithDirectory<F>> for Runner<R>
where
    WithDirectory<F>: Run<R> + 'static,
{
    fn from(value: WithDirectory<F>) -> Self {
        Runner::from_run(value)
    }
}

/// Every upstream task of `task`, across all nested connector layers.
///
/// Plain runners have none.
pub fn get_upstream(task: &TaskRef) -> Vec<TaskRef> {
    task.upstream()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use camino::Utf8Path;
    use tempfile::TempDir;

    use super::*;
    use crate::args;
    use crate::config::Config;
    use crate::task::{TaskFactory, TaskKey};

    fn config(dir: &TempDir) -> Config {
        Config::default().with_cache_dir(Utf8Path::from_path(dir.path()).unwrap())
    }

    fn value(config: &Config) -> TaskFactory<i64> {
        TaskFactory::builder("tests.value")
            .param("x")
            .build(config, |args| {
                let x: i64 = args.get("x")?;
                Ok(Runner::new(move || Ok(x)))
            })
            .unwrap()
    }

    fn keys(tasks: &[TaskRef]) -> BTreeSet<TaskKey> {
        tasks.iter().map(TaskRef::to_tuple).collect()
    }

    #[test]
    fn test_plain_runner_has_no_upstream() {
        let dir = TempDir::new().unwrap();
        let value = value(&config(&dir));
        let task = value.call(args![1]).unwrap();

        assert!(get_upstream(&task.erase()).is_empty());
    }

    #[test]
    fn test_shapes_resolve() {
        let dir = TempDir::new().unwrap();
        let value = value(&config(&dir));

        let tasks: Vec<_> = (0..3).map(|x| value.call(args![x]).unwrap()).collect();
        for task in &tasks {
            task.set_result().unwrap();
        }

        assert_eq!(tasks[1].resolve().unwrap(), 1);
        assert_eq!(tasks.clone().resolve().unwrap(), vec![0, 1, 2]);

        let map: BTreeMap<_, _> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (format!("k{i}"), t.clone()))
            .collect();
        let resolved = map.resolve().unwrap();
        assert_eq!(resolved["k2"], 2);

        let hashed: HashMap<_, _> = tasks.iter().cloned().enumerate().collect();
        assert_eq!(hashed.resolve().unwrap()[&0], 0);

        let tuple = (tasks[0].clone(), (tasks[1].clone(), tasks[2].clone()));
        assert_eq!(tuple.resolve().unwrap(), (0, (1, 2)));
        assert_eq!(tuple.tasks().len(), 3);
    }

    #[test]
    fn test_nested_upstream_and_argument_order() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let value = value(&config);

        let outer = value.call(args![10]).unwrap();
        let inner = value.call(args![20]).unwrap();
        outer.set_result().unwrap();
        inner.set_result().unwrap();

        let (o, i) = (outer.clone(), inner.clone());
        let diff: TaskFactory<i64> = TaskFactory::builder("tests.diff")
            .build(&config, move |_| {
                Ok(requires(o.clone())
                    .connect(requires(i.clone()).then(|(inner, outer): (i64, i64)| {
                        Ok(inner - outer)
                    }))
                    .runner())
            })
            .unwrap();

        let task = diff.call(args![]).unwrap();
        let upstream = get_upstream(&task.erase());
        assert_eq!(
            keys(&upstream),
            BTreeSet::from([outer.to_tuple(), inner.to_tuple()])
        );

        // The inner layer's value comes first.
        task.set_result().unwrap();
        assert_eq!(task.get_result().unwrap(), 10);
    }

    #[test]
    fn test_with_directory() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        let writer: TaskFactory<String> = TaskFactory::builder("tests.writer")
            .param("name")
            .build(&config, |args| {
                let name: String = args.get("name")?;
                Ok(with_directory(move |dir: Utf8PathBuf| -> anyhow::Result<String> {
                    let entries = fs::read_dir(&dir)?.count();
                    fs::write(dir.join(&name), "data")?;
                    Ok(format!("{entries}"))
                })
                .into())
            })
            .unwrap();

        let task = writer.call(args!["file.txt"]).unwrap();
        task.set_result().unwrap();
        assert!(task.directory().join("file.txt").exists());

        // Recomputing starts from an empty directory.
        task.set_result().unwrap();
        assert_eq!(task.get_result().unwrap(), "0");
    }

    #[test]
    fn test_missing_upstream_fails_the_task() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let value = value(&config);

        let upstream = value.call(args![1]).unwrap();
        let consumer: TaskFactory<i64> = TaskFactory::builder("tests.consumer")
            .build(&config, move |_| {
                Ok(requires(upstream.clone()).then(|x: i64| Ok(x + 1)).runner())
            })
            .unwrap();

        let task = consumer.call(args![]).unwrap();
        let err = task.set_result().unwrap_err();
        assert!(err.task_error().is_some());
        assert!(!consumer.store().contains(task.key()));
    }
}
