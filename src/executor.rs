use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::Config;
use crate::error::CheckpointError;

/// A pool of worker threads executing task bodies.
///
/// Every [`Task::run`](crate::Task::run) without an explicit executor builds
/// a fresh one and tears it down afterwards; long-running programs running
/// many graphs may keep one around and use
/// [`Task::run_with`](crate::Task::run_with) instead.
pub struct Executor {
    pool: ThreadPool,
}

impl Executor {
    /// Creates a pool with `threads` workers. `0` lets rayon pick.
    pub fn new(threads: usize) -> Result<Self, CheckpointError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("checkpoint-worker-{i}"))
            .build()?;

        Ok(Self { pool })
    }

    pub fn from_config(config: &Config) -> Result<Self, CheckpointError> {
        Self::new(config.worker_count().get())
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub(crate) fn pool(&self) -> &ThreadPool {
        &self.pool
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("threads", &self.threads())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_count() {
        assert_eq!(Executor::new(3).unwrap().threads(), 3);

        let config = Config::default().with_max_workers(2);
        assert_eq!(Executor::from_config(&config).unwrap().threads(), 2);
    }
}
