#![forbid(unsafe_code)]
//! Lightweight workflow engine with disk-backed memoization.
//!
//! Functions are registered as [`TaskFactory`]s. Calling a factory with
//! arguments yields a [`Task`], a cacheable unit of work whose result is
//! stored on disk under a key derived from its bound arguments. Tasks declare
//! the tasks they read from with [`requires`], and running a task brings the
//! whole dependency graph up to date: only entries which are missing or older
//! than one of their inputs are recomputed, in parallel, on a pool of worker
//! threads.
//!
//! ```rust,no_run
//! use checkpoint::{Config, Runner, TaskFactory, args, requires};
//!
//! let config = Config::from_env();
//!
//! let add: TaskFactory<i64> = TaskFactory::builder("demo.add")
//!     .param("a")
//!     .param("b")
//!     .build(&config, |args| {
//!         let (a, b): (i64, i64) = (args.get("a")?, args.get("b")?);
//!         Ok(Runner::new(move || Ok(a + b)))
//!     })?;
//!
//! let upstream = add.call(args![1, 2])?;
//! let double: TaskFactory<i64> = TaskFactory::builder("demo.double")
//!     .build(&config, move |_| {
//!         Ok(requires(upstream.clone()).then(|x: i64| Ok(2 * x)).runner())
//!     })?;
//!
//! assert_eq!(double.call(args![])?.run()?, 6);
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! The on-disk layout and the environment variables understood by
//! [`Config::from_env`] are documented on [`Config`] and [`Store`].

mod config;
pub mod connect;
mod core;
mod error;
mod executor;
mod graph;
mod io;
mod key;
mod scheduler;
mod store;
mod task;
mod utils;

pub use crate::config::{Config, ENV_CACHE_DIR, ENV_DETECT_SOURCE_CHANGE, ENV_MAX_WORKERS};
pub use crate::connect::{
    Connected, Connector, Continuation, Dependencies, Func, WithDirectory, get_upstream, requires,
    with_directory,
};
pub use crate::core::Timestamp;
pub use crate::error::*;
pub use crate::executor::Executor;
pub use crate::graph::{Graph, walk_subgraph_to_update};
pub use crate::key::{Args, Arguments, CallKey, Signature};
pub use crate::scheduler::{RunInfo, TaskExecution, run_task_graph};
pub use crate::store::Store;
pub use crate::task::{
    Cacheable, FactoryBuilder, Run, Runner, Task, TaskContext, TaskFactory, TaskKey, TaskRef,
};
pub use crate::utils::init_logging;
