use camino::Utf8PathBuf;
use thiserror::Error;

use crate::key::CallKey;
use crate::task::TaskKey;

pub use anyhow::Error as RuntimeError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Key not found in '{namespace}': {key}")]
    KeyNotFound {
        namespace: &'static str,
        key: CallKey,
    },

    #[error("Couldn't access the store.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode value.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Couldn't decode value.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("Record at {0} has an unexpected shape")]
    Corrupt(Utf8PathBuf),

    #[error("'{0}' can't be used as a store directory name")]
    InvalidName(String),
}

impl StoreError {
    /// Whether the error means "this key was never written".
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::KeyNotFound { .. })
    }
}

/// Failures while matching call arguments against a [`Signature`](crate::Signature).
#[derive(Debug, Error)]
pub enum BindError {
    #[error("Takes {expected} positional arguments but {given} were given")]
    TooManyPositional { expected: usize, given: usize },

    #[error("Got an unexpected keyword argument '{0}'")]
    UnknownKeyword(String),

    #[error("Got multiple values for argument '{0}'")]
    MultipleValues(String),

    #[error("Missing a required argument: '{0}'")]
    Missing(String),

    #[error("Argument contains a non-finite float")]
    NonFinite,

    #[error("Couldn't serialize argument.\n{0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Task factory '{0}': {1}")]
    Bind(String, BindError),

    #[error("Argument '{0}' has an unexpected shape.\n{1}")]
    Serialization(String, serde_json::Error),

    #[error("Task factory '{0}' failed to create a runner:\n{1}")]
    Factory(String, anyhow::Error),

    #[error("Task '{0}':\n{1}")]
    Task(String, anyhow::Error),

    #[error("Task '{0}' panicked: {1}")]
    Panic(String, String),

    #[error("Task {0:?} was declared with two different upstream sets")]
    InconsistentDependencies(TaskKey),

    #[error("Scheduler invariant violated: {0}")]
    Invariant(String),

    #[error("Failed to build the worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

impl CheckpointError {
    /// Whether the error originates from a missing cache entry.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CheckpointError::Store(err) if err.is_not_found())
    }

    /// Returns the user error raised inside a task body, if that is what
    /// failed.
    pub fn task_error(&self) -> Option<&anyhow::Error> {
        match self {
            CheckpointError::Task(_, err) => Some(err),
            _ => None,
        }
    }
}
