//! Task entity: one execution attempt of a task spec at one commit.

use crate::ids::TaskId;
use crate::status::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One attempted execution of a task spec at a specific (repo, revision).
///
/// Tasks are persisted through the versioned record codec, so changes must
/// maintain backwards compatibility:
///   - new fields must deserialize to a meaningful value when absent
///     (`#[serde(default)]`),
///   - existing field types must never change,
///   - removed field names go on `cinder_db::codec::RETIRED_FIELDS` and
///     are never reused.
///
/// A task is immutable once terminal, except for `db_modified`, which the
/// store stamps on every successful put. History is append-only: a retry
/// is a new task, never a mutation of the failed one back to pending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier. Never changes after the initial insert.
    pub id: TaskId,

    /// Repository of the commit this task ran at. Never changes.
    pub repo: String,

    /// Commit this task ran at. Never changes.
    pub revision: String,

    /// Name of the task spec this task executes. Never changes.
    pub name: String,

    pub status: TaskStatus,

    /// Creation timestamp. Never changes.
    pub created: DateTime<Utc>,

    /// Set when the task is dispatched to a worker.
    pub started: Option<DateTime<Utc>>,

    /// Set exactly when the task reaches a terminal status.
    pub finished: Option<DateTime<Utc>>,

    /// Handle to the staged output bundle. Set only on success.
    pub isolated_output: Option<String>,

    /// Handle returned by the worker pool when the task was triggered.
    pub execution_id: Option<String>,

    /// Retry ordinal: 0 for the first attempt at this (repo, revision,
    /// name), incremented for each retry.
    #[serde(default)]
    pub attempt: u32,

    /// Time of the last successful store put, or `None` if never stored.
    /// Owned by the store; callers never set this themselves.
    pub db_modified: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(repo: impl Into<String>, revision: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            repo: repo.into(),
            revision: revision.into(),
            name: name.into(),
            status: TaskStatus::Pending,
            created: Utc::now(),
            started: None,
            finished: None,
            isolated_output: None,
            execution_id: None,
            attempt: 0,
            db_modified: None,
        }
    }

    pub fn done(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to a terminal status, setting the finish time. `finished` is
    /// set iff the status is terminal, so both change together.
    pub fn finish(&mut self, status: TaskStatus, at: DateTime<Utc>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.finished = Some(at);
    }
}
