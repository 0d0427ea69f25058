//! Process-level settings of the checkpoint engine.
//!
//! A [`Config`] is created once at startup and handed to every
//! [`TaskFactory`](crate::TaskFactory) on construction. Nothing in the crate
//! reads the environment behind the user's back: [`Config::from_env`] is the
//! only place where the `CP_*` variables are consulted.

use std::env;
use std::num::NonZeroUsize;

use camino::{Utf8Path, Utf8PathBuf};

pub const ENV_CACHE_DIR: &str = "CP_CACHE_DIR";
pub const ENV_MAX_WORKERS: &str = "CP_MAX_WORKERS";
pub const ENV_DETECT_SOURCE_CHANGE: &str = "CP_DETECT_SOURCE_CHANGE";

const DEFAULT_CACHE_DIR: &str = "./.cache";

#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the cache. Stores live under `<cache_dir>/checkpoint/<name>`.
    pub cache_dir: Utf8PathBuf,
    /// Requested worker count. Non-positive values are relative to the number
    /// of CPUs: `-1` means all CPUs, `-2` all but one, and so on.
    pub max_workers: isize,
    /// Invalidate cached results older than their factory's source
    /// fingerprint.
    pub detect_source_change: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: Utf8PathBuf::from(DEFAULT_CACHE_DIR),
            max_workers: -1,
            detect_source_change: false,
        }
    }
}

impl Config {
    /// Reads `CP_CACHE_DIR`, `CP_MAX_WORKERS` and `CP_DETECT_SOURCE_CHANGE`,
    /// falling back to the defaults for unset or unparsable values.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup(ENV_CACHE_DIR)
            && !dir.is_empty()
        {
            config.cache_dir = Utf8PathBuf::from(dir);
        }

        if let Some(workers) = lookup(ENV_MAX_WORKERS) {
            match workers.trim().parse() {
                Ok(workers) => config.max_workers = workers,
                Err(_) => tracing::warn!("ignoring invalid {ENV_MAX_WORKERS}={workers:?}"),
            }
        }

        if let Some(flag) = lookup(ENV_DETECT_SOURCE_CHANGE) {
            config.detect_source_change = parse_flag(&flag);
        }

        config
    }

    pub fn with_cache_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_max_workers(mut self, workers: isize) -> Self {
        self.max_workers = workers;
        self
    }

    pub fn with_detect_source_change(mut self, detect: bool) -> Self {
        self.detect_source_change = detect;
        self
    }

    /// Directory holding one sub-directory per task factory.
    pub fn checkpoint_dir(&self) -> Utf8PathBuf {
        self.cache_dir.join("checkpoint")
    }

    /// Directory of the store belonging to the factory called `name`.
    pub fn store_dir(&self, name: &str) -> Utf8PathBuf {
        self.checkpoint_dir().join(Utf8Path::new(name))
    }

    /// Resolves [`max_workers`](Self::max_workers) to a concrete thread count.
    pub fn worker_count(&self) -> NonZeroUsize {
        let cpus = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
        resolve_workers(self.max_workers, cpus)
    }
}

fn resolve_workers(requested: isize, cpus: usize) -> NonZeroUsize {
    let count = if requested > 0 {
        requested as usize
    } else {
        // -1 => cpus, -2 => cpus - 1, 0 => cpus + 1
        (cpus as isize + 1 + requested).max(1) as usize
    };

    NonZeroUsize::new(count).unwrap_or(NonZeroUsize::MIN)
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_workers() {
        assert_eq!(resolve_workers(4, 8).get(), 4);
        assert_eq!(resolve_workers(-1, 8).get(), 8);
        assert_eq!(resolve_workers(-2, 8).get(), 7);
        assert_eq!(resolve_workers(0, 8).get(), 9);
        // Never drops below a single worker.
        assert_eq!(resolve_workers(-100, 8).get(), 1);
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("1"));
        assert!(parse_flag("TRUE"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag(""));
    }

    #[test]
    fn test_store_dir() {
        let config = Config::default().with_cache_dir("/tmp/cp");
        assert_eq!(
            config.store_dir("demo::square"),
            Utf8PathBuf::from("/tmp/cp/checkpoint/demo::square")
        );
    }

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name: &str| {
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        }
    }

    #[test]
    fn test_from_lookup() {
        let config = Config::from_lookup(lookup(&[
            (ENV_CACHE_DIR, "/tmp/somewhere"),
            (ENV_MAX_WORKERS, "3"),
            (ENV_DETECT_SOURCE_CHANGE, "1"),
        ]));

        assert_eq!(config.cache_dir, Utf8PathBuf::from("/tmp/somewhere"));
        assert_eq!(config.worker_count().get(), 3);
        assert!(config.detect_source_change);
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = Config::from_lookup(lookup(&[(ENV_MAX_WORKERS, "many"), (ENV_CACHE_DIR, "")]));

        assert_eq!(config.cache_dir, Utf8PathBuf::from(DEFAULT_CACHE_DIR));
        assert_eq!(config.max_workers, -1);
        assert!(!config.detect_source_change);
    }
}
