//! Task factories and tasks.
//!
//! A [`TaskFactory`] turns a user function into a producer of cacheable
//! [`Task`]s. The user function is a *runner factory*: it receives the bound
//! [`Arguments`] of a call and returns a [`Runner`], the delayed computation
//! that will produce the result. Runners built from
//! [connectors](crate::connect) carry the upstream tasks they read from,
//! which is how the dependency graph is discovered.

use std::fmt::Debug;
use std::fs;
use std::num::NonZeroUsize;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::Config;
use crate::connect::Func;
use crate::core::{Hash32, Timestamp};
use crate::error::{BindError, CheckpointError, StoreError};
use crate::executor::Executor;
use crate::graph::Graph;
use crate::key::{Args, Arguments, CallKey, Signature};
use crate::scheduler::{RunInfo, run_task_graph};
use crate::store::Store;

/// Values which can be returned by a task and kept in the cache.
pub trait Cacheable: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Globally unique identity of a cached computation: the store of the
/// factory plus the call key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskKey {
    pub store: Utf8PathBuf,
    pub key: CallKey,
}

impl Debug for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.store, self.key)
    }
}

/// Per-invocation information handed to a runner.
#[derive(Debug, Clone, Copy)]
pub struct TaskContext<'a> {
    /// Key of the task being computed.
    pub key: &'a CallKey,
    /// Scratch directory dedicated to the task, see [`Task::directory`].
    pub directory: &'a Utf8Path,
}

/// A delayed computation.
///
/// Implemented by plain closures (through [`Runner::new`]) and by the
/// connector types, which additionally report the tasks they depend on.
pub trait Run<R>: Send + Sync {
    fn call(&self, context: &TaskContext) -> anyhow::Result<R>;

    /// Collects every task this runner reads from, through all nested
    /// connector layers.
    fn upstream(&self, _: &mut Vec<TaskRef>) {}
}

/// Type-erased [`Run`] producing `R`.
pub struct Runner<R>(Arc<dyn Run<R>>);

impl<R> Runner<R> {
    /// Wraps a closure without dependencies.
    pub fn new<F>(func: F) -> Self
    where
        F: Fn() -> anyhow::Result<R> + Send + Sync + 'static,
        R: 'static,
    {
        Self(Arc::new(Func(func)))
    }

    /// Wraps any [`Run`] implementation, e.g. a
    /// [`Connected`](crate::Connected).
    pub fn from_run<T>(run: T) -> Self
    where
        T: Run<R> + 'static,
    {
        Self(Arc::new(run))
    }

    pub(crate) fn upstream(&self) -> Vec<TaskRef> {
        let mut acc = Vec::new();
        self.0.upstream(&mut acc);
        acc
    }
}

impl<R> Clone for Runner<R> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

type RunnerFactory<R> = dyn Fn(&Arguments) -> anyhow::Result<Runner<R>> + Send + Sync;

struct FactoryInner<R> {
    name: String,
    signature: Signature,
    runner_factory: Box<RunnerFactory<R>>,
    store: Store,
    max_concurrency: Option<NonZeroUsize>,
    source_timestamp: Option<Timestamp>,
    config: Config,
}

/// Converts a function into a cache-aware producer of [`Task`]s.
///
/// ```rust,no_run
/// use checkpoint::{Config, Runner, TaskFactory, args};
///
/// let config = Config::from_env();
/// let square = TaskFactory::builder("demo.square")
///     .param("x")
///     .build(&config, |args| {
///         let x: i64 = args.get("x")?;
///         Ok(Runner::new(move || Ok(x * x)))
///     })?;
///
/// assert_eq!(square.call(args![3])?.run()?, 9);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct TaskFactory<R> {
    inner: Arc<FactoryInner<R>>,
}

impl<R> Clone for TaskFactory<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl TaskFactory<()> {
    /// Starts configuring a factory. `name` should be the fully-qualified
    /// name of the wrapped function, it determines the on-disk location of
    /// the cache.
    pub fn builder(name: impl Into<String>) -> FactoryBuilder {
        FactoryBuilder::new(name.into())
    }
}

impl<R> TaskFactory<R>
where
    R: Cacheable,
{
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn max_concurrency(&self) -> Option<NonZeroUsize> {
        self.inner.max_concurrency
    }

    /// Binds `args`, derives the call key and creates the task.
    ///
    /// A missing cache entry is not an error, the task is simply created
    /// without a timestamp.
    pub fn call(&self, args: Args) -> Result<Task<R>, CheckpointError> {
        let inner = &self.inner;

        let arguments = inner
            .signature
            .bind(args)
            .map_err(|err| CheckpointError::Bind(inner.name.clone(), err))?;

        let key = arguments.to_key();
        let timestamp = inner.store.peek_timestamp(&key)?;

        let runner = (inner.runner_factory)(&arguments)
            .map_err(|err| CheckpointError::Factory(inner.name.clone(), err))?;

        Ok(Task {
            factory: self.inner.clone(),
            key,
            timestamp,
            runner,
        })
    }

    /// Drops every cached result of this factory.
    pub fn clear(&self) -> Result<(), CheckpointError> {
        self.inner.store.clear()?;
        Ok(())
    }
}

impl<R> Debug for TaskFactory<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFactory")
            .field("name", &self.inner.name)
            .field("store", &self.inner.store.path())
            .field("max_concurrency", &self.inner.max_concurrency)
            .finish()
    }
}

/// Settings of a [`TaskFactory`] under construction.
pub struct FactoryBuilder {
    name: String,
    signature: Signature,
    compress_level: u32,
    max_concurrency: Option<NonZeroUsize>,
    source: Option<String>,
    error: Option<BindError>,
}

impl FactoryBuilder {
    fn new(name: String) -> Self {
        Self {
            name,
            signature: Signature::new(),
            compress_level: 0,
            max_concurrency: None,
            source: None,
            error: None,
        }
    }

    /// Appends a required parameter.
    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.signature = self.signature.param(name);
        self
    }

    /// Appends a parameter with a default value.
    pub fn param_default<T>(mut self, name: impl Into<String>, default: T) -> Self
    where
        T: Serialize,
    {
        let name = name.into();
        match self.signature.clone().param_default(name, default) {
            Ok(signature) => self.signature = signature,
            Err(err) => {
                self.error.get_or_insert(err);
            }
        }
        self
    }

    /// Replaces the whole parameter list.
    pub fn signature(mut self, signature: Signature) -> Self {
        self.signature = signature;
        self
    }

    /// zlib level (0-9) used for stored results. Defaults to 0.
    pub fn compress_level(mut self, level: u32) -> Self {
        self.compress_level = level;
        self
    }

    /// Maximum number of this factory's tasks running at the same time.
    pub fn max_concurrency(mut self, limit: NonZeroUsize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    /// Fingerprint of the function's implementation (a version string, a
    /// hash of the source, ...). With source-change detection enabled, a
    /// changed fingerprint invalidates all results cached before the change.
    pub fn source(mut self, fingerprint: impl Into<String>) -> Self {
        self.source = Some(fingerprint.into());
        self
    }

    pub fn build<R, F>(
        self,
        config: &Config,
        runner_factory: F,
    ) -> Result<TaskFactory<R>, CheckpointError>
    where
        R: Cacheable,
        F: Fn(&Arguments) -> anyhow::Result<Runner<R>> + Send + Sync + 'static,
    {
        if let Some(err) = self.error {
            return Err(CheckpointError::Bind(self.name, err));
        }

        let store = Store::open(config, &self.name, self.compress_level)?;

        let source_timestamp = match &self.source {
            Some(source) => Some(store.update_source_if_necessary(source)?),
            None => None,
        };

        tracing::debug!("registered task factory '{}' at {}", self.name, store.path());

        Ok(TaskFactory {
            inner: Arc::new(FactoryInner {
                name: self.name,
                signature: self.signature,
                runner_factory: Box::new(runner_factory),
                store,
                max_concurrency: self.max_concurrency,
                source_timestamp,
                config: config.clone(),
            }),
        })
    }
}

/// One concrete, cacheable invocation of a [`TaskFactory`].
pub struct Task<R> {
    factory: Arc<FactoryInner<R>>,
    key: CallKey,
    timestamp: Option<Timestamp>,
    runner: Runner<R>,
}

impl<R> Clone for Task<R> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            key: self.key.clone(),
            timestamp: self.timestamp,
            runner: self.runner.clone(),
        }
    }
}

impl<R> Task<R>
where
    R: Cacheable,
{
    /// Brings this task and every stale upstream task up to date on a fresh
    /// executor sized from the configuration, then returns the result.
    pub fn run(&self) -> Result<R, CheckpointError> {
        Ok(self.run_with_info(None)?.0)
    }

    /// Like [`run`](Self::run), on a caller-supplied executor.
    pub fn run_with(&self, executor: &Executor) -> Result<R, CheckpointError> {
        Ok(self.run_with_info(Some(executor))?.0)
    }

    /// Runs the task and also reports what was recomputed.
    pub fn run_with_info(
        &self,
        executor: Option<&Executor>,
    ) -> Result<(R, RunInfo), CheckpointError> {
        let graph = self.graph()?;

        let info = match executor {
            Some(executor) => run_task_graph(&graph, executor)?,
            None => {
                let executor = Executor::from_config(&self.factory.config)?;
                run_task_graph(&graph, &executor)?
            }
        };

        Ok((self.get_result()?, info))
    }

    /// Builds the staleness-annotated dependency graph rooted at this task.
    pub fn graph(&self) -> Result<Graph, CheckpointError> {
        Graph::build(&self.erase(), None)
    }

    /// Reads the cached result without checking whether it is up to date.
    pub fn get_result(&self) -> Result<R, CheckpointError> {
        Ok(self.factory.store.load(&self.key)?)
    }

    /// Computes the result on the current thread and stores it.
    pub fn set_result(&self) -> Result<Timestamp, CheckpointError> {
        let directory = self.directory();
        let context = TaskContext {
            key: &self.key,
            directory: &directory,
        };

        let output = self
            .runner
            .0
            .call(&context)
            .map_err(|err| CheckpointError::Task(self.name(), err))?;

        Ok(self.factory.store.save(&self.key, &output)?)
    }

    /// Removes the cached entry of this call and its data directory.
    pub fn clear(&self) -> Result<(), CheckpointError> {
        self.factory.store.delete(&self.key)?;

        let directory = self.directory();
        if directory.exists() {
            fs::remove_dir_all(&directory).map_err(StoreError::from)?;
        }

        Ok(())
    }

    pub fn to_tuple(&self) -> TaskKey {
        TaskKey {
            store: self.factory.store.path().to_owned(),
            key: self.key.clone(),
        }
    }

    pub fn key(&self) -> &CallKey {
        &self.key
    }

    /// Timestamp of the cached entry when this task was created.
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }

    /// Current timestamp of the cached entry.
    pub fn peek_timestamp(&self) -> Result<Option<Timestamp>, CheckpointError> {
        Ok(self.factory.store.peek_timestamp(&self.key)?)
    }

    /// Scratch directory dedicated to this call, inside the factory's data
    /// directory.
    pub fn directory(&self) -> Utf8PathBuf {
        self.factory
            .store
            .data_directory()
            .join(Hash32::hash(self.key.as_str()).to_hex())
    }

    pub fn name(&self) -> String {
        format!("{}{}", self.factory.name, self.key)
    }

    /// Type-erased handle used by the graph and the scheduler.
    pub fn erase(&self) -> TaskRef {
        TaskRef(Arc::new(self.clone()))
    }
}

impl<R> Debug for Task<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task({}{})", self.factory.name, self.key)
    }
}

/// The object-safe part of a [`Task`].
pub(crate) trait Node: Send + Sync {
    fn to_tuple(&self) -> TaskKey;

    fn name(&self) -> String;

    fn peek_timestamp(&self) -> Result<Option<Timestamp>, CheckpointError>;

    fn source_timestamp(&self) -> Option<Timestamp>;

    fn max_concurrency(&self) -> Option<NonZeroUsize>;

    fn upstream(&self) -> Vec<TaskRef>;

    fn set_result(&self) -> Result<Timestamp, CheckpointError>;
}

impl<R> Node for Task<R>
where
    R: Cacheable,
{
    fn to_tuple(&self) -> TaskKey {
        Task::to_tuple(self)
    }

    fn name(&self) -> String {
        Task::name(self)
    }

    fn peek_timestamp(&self) -> Result<Option<Timestamp>, CheckpointError> {
        Task::peek_timestamp(self)
    }

    fn source_timestamp(&self) -> Option<Timestamp> {
        if self.factory.config.detect_source_change {
            self.factory.source_timestamp
        } else {
            None
        }
    }

    fn max_concurrency(&self) -> Option<NonZeroUsize> {
        self.factory.max_concurrency
    }

    fn upstream(&self) -> Vec<TaskRef> {
        self.runner.upstream()
    }

    fn set_result(&self) -> Result<Timestamp, CheckpointError> {
        Task::set_result(self)
    }
}

/// A type-erased, cheaply clonable [`Task`].
///
/// This is the unit handed to worker threads: it owns the bound arguments
/// and a handle to the store the result is written into.
#[derive(Clone)]
pub struct TaskRef(Arc<dyn Node>);

impl TaskRef {
    pub fn to_tuple(&self) -> TaskKey {
        self.0.to_tuple()
    }

    pub fn name(&self) -> String {
        self.0.name()
    }

    pub fn peek_timestamp(&self) -> Result<Option<Timestamp>, CheckpointError> {
        self.0.peek_timestamp()
    }

    pub fn max_concurrency(&self) -> Option<NonZeroUsize> {
        self.0.max_concurrency()
    }

    pub(crate) fn source_timestamp(&self) -> Option<Timestamp> {
        self.0.source_timestamp()
    }

    pub(crate) fn upstream(&self) -> Vec<TaskRef> {
        self.0.upstream()
    }

    pub(crate) fn set_result(&self) -> Result<Timestamp, CheckpointError> {
        self.0.set_result()
    }
}

impl Debug for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskRef({})", self.0.name())
    }
}
