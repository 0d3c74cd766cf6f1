//! Job entity: an aggregate outcome over a frozen set of task specs.

use crate::ids::JobId;
use crate::status::JobStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named aggregate over a frozen dependency set for one (repo,
/// revision). Created once per triggering commit and never re-created;
/// once terminal, never reopened.
///
/// Persisted through the versioned record codec; the same compatibility
/// rules as [`crate::task::Task`] apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier. Never changes after the initial insert.
    pub id: JobId,

    /// Repository of the triggering commit. Never changes.
    pub repo: String,

    /// The triggering commit. Never changes.
    pub revision: String,

    /// Human-friendly descriptive name. Never changes.
    pub name: String,

    /// Names of the task specs this job depends on, frozen at creation.
    pub dependencies: Vec<String>,

    /// Relative priority in (0, 1].
    pub priority: f64,

    /// Creation timestamp. Never changes.
    pub created: DateTime<Utc>,

    /// Set when every dependency task has reached a terminal status, or
    /// when the job is canceled.
    pub finished: Option<DateTime<Utc>>,

    /// Current status, default `InProgress`.
    pub status: JobStatus,

    /// Time of the last successful store put, or `None` if never stored.
    /// Owned by the store; callers never set this themselves.
    pub db_modified: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        repo: impl Into<String>,
        revision: impl Into<String>,
        name: impl Into<String>,
        dependencies: Vec<String>,
        priority: f64,
    ) -> Self {
        Self {
            id: JobId::new(),
            repo: repo.into(),
            revision: revision.into(),
            name: name.into(),
            dependencies,
            priority,
            created: Utc::now(),
            finished: None,
            status: JobStatus::InProgress,
            db_modified: None,
        }
    }

    pub fn done(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to a terminal status, setting the finish time.
    pub fn finish(&mut self, status: JobStatus, at: DateTime<Utc>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.finished = Some(at);
    }
}
