//! Error types for Cinder.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Store errors
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Concurrent modification of {id}: expected stamp {expected:?}, store has {actual:?}")]
    Conflict {
        id: String,
        expected: Option<chrono::DateTime<chrono::Utc>>,
        actual: Option<chrono::DateTime<chrono::Utc>>,
    },

    #[error("Store error: {0}")]
    Store(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unsupported record version {found}, newest known is {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    // Task config errors
    #[error("Invalid task config: {0}")]
    InvalidConfig(String),

    #[error("Unknown task dependency: {0}")]
    UnknownDependency(String),

    #[error("Cycle detected in task dependencies")]
    CycleDetected,

    #[error("Invalid dimension (expected \"key:value\"): {0}")]
    InvalidDimension(String),

    // External collaborator errors (transient by taxonomy)
    #[error("Repository mirror error: {0}")]
    RepoMirror(String),

    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    #[error("Input staging error: {0}")]
    Staging(String),

    // Job errors
    #[error("Job already finished: {0}")]
    JobAlreadyFinished(String),

    // Infrastructure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors the scheduler loop treats as transient: logged,
    /// skipped, retried on the next iteration without aborting anything.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::RepoMirror(_) | Error::WorkerPool(_) | Error::Staging(_)
        )
    }

    /// True iff this is a stale-stamp conflict, which callers resolve by
    /// re-reading, re-applying, and retrying the put.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
