//! Task and job status enums and the rollup ordering.
//!
//! Job statuses are totally ordered by "badness". The ordering is part of
//! the external contract: a job with a still-running dependency reports
//! `InProgress` even if a sibling dependency was canceled.

use serde::{Deserialize, Serialize};

/// Status of a single task execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created but not yet dispatched to a worker.
    Pending,
    /// Dispatched and executing on a worker.
    Running,
    /// Completed successfully; the task has an output handle.
    Success,
    /// Completed with a test/build failure.
    Failure,
    /// Exited early with an error, died in progress, expired on the
    /// queue, or timed out.
    Mishap,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Mishap
        )
    }
}

/// Aggregated status of a job. Any status other than `InProgress` is
/// final; jobs are never retried, only their component tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// One or more of the job's task dependencies is not yet satisfied.
    InProgress,
    /// All task dependencies completed successfully.
    Success,
    /// One or more task dependencies failed.
    Failure,
    /// One or more task dependencies exited early, died, expired, or
    /// timed out.
    Mishap,
    /// The job was canceled by explicit external action.
    Canceled,
}

impl JobStatus {
    /// Position in the total order used for rollup. Injective across the
    /// five statuses.
    fn badness(self) -> u8 {
        match self {
            JobStatus::Success => 0,
            JobStatus::InProgress => 1,
            JobStatus::Canceled => 2,
            JobStatus::Failure => 3,
            JobStatus::Mishap => 4,
        }
    }

    /// True iff `self` is strictly worse than `other`.
    pub fn worse_than(self, other: JobStatus) -> bool {
        self.badness() > other.badness()
    }

    /// The worse of the two statuses.
    pub fn worse(a: JobStatus, b: JobStatus) -> JobStatus {
        if a.worse_than(b) { a } else { b }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::InProgress)
    }
}

impl From<TaskStatus> for JobStatus {
    fn from(s: TaskStatus) -> Self {
        match s {
            TaskStatus::Success => JobStatus::Success,
            TaskStatus::Failure => JobStatus::Failure,
            TaskStatus::Mishap => JobStatus::Mishap,
            TaskStatus::Pending | TaskStatus::Running => JobStatus::InProgress,
        }
    }
}
