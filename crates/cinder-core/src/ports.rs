//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the scheduler core and its
//! external collaborators: the source-repository mirror, the remote
//! execution worker pool, the content-addressed input stager, and the
//! durable task/job stores.

use crate::ids::{JobId, TaskId};
use crate::job::Job;
use crate::spec::CipdPackage;
use crate::task::Task;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Read-only view of a mirrored source repository.
#[async_trait]
pub trait RepoMirror: Send + Sync {
    /// List the commits of a repository, newest first.
    async fn list_commits(&self, repo: &str) -> Result<Vec<String>>;

    /// Read a file's contents at a commit.
    async fn read_file(&self, repo: &str, revision: &str, path: &str) -> Result<Vec<u8>>;
}

/// A remote execution worker and its capability set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    pub id: String,
    pub capabilities: HashMap<String, String>,
}

/// Everything the worker pool needs to start one task on one worker.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub worker_id: String,
    pub task_id: TaskId,
    pub task_name: String,
    pub repo: String,
    pub revision: String,
    /// Handle of the staged input bundle.
    pub input_bundle: String,
    pub dimensions: HashMap<String, String>,
    pub cipd_packages: Vec<CipdPackage>,
    pub priority: f64,
}

/// Terminal or in-flight state of a triggered execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::TimedOut
        )
    }
}

/// Result of polling a triggered execution.
#[derive(Debug, Clone)]
pub struct Execution {
    pub status: ExecutionStatus,
    /// Output handle; set only when the execution completed successfully.
    pub output: Option<String>,
}

/// Client for the remote execution worker fleet.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// List workers currently idle, with their capabilities.
    async fn list_idle_workers(&self) -> Result<Vec<Worker>>;

    /// Start a task on a named worker; returns an execution id to poll.
    async fn trigger(&self, req: &TriggerRequest) -> Result<String>;

    /// Poll a previously triggered execution.
    async fn poll(&self, execution_id: &str) -> Result<Execution>;
}

/// Client that hashes a task's inputs into an addressable bundle prior to
/// dispatch.
#[async_trait]
pub trait InputStager: Send + Sync {
    /// Stage the inputs named by an isolate file at a commit; returns the
    /// input bundle handle.
    async fn stage(&self, repo: &str, revision: &str, isolate: &str) -> Result<String>;
}

/// Durable store for tasks.
///
/// Write contract: every successful put stamps the entity's `db_modified`
/// with the store's commit time. Callers use optimistic concurrency: a put
/// whose `db_modified` does not match the store's current value for that
/// id fails with [`crate::Error::Conflict`], and the caller must re-read,
/// re-apply, and retry. Reads are snapshot reads and are never blocked by
/// writes. Records are never physically deleted.
#[async_trait]
pub trait TaskDb: Send + Sync {
    async fn put_task(&self, task: &mut Task) -> Result<()>;

    /// Put several tasks atomically: either every stamp matches and all
    /// are written, or nothing is.
    async fn put_tasks(&self, tasks: &mut [Task]) -> Result<()>;

    async fn get_task_by_id(&self, id: TaskId) -> Result<Option<Task>>;

    /// Tasks for a repo created within `[start, end)`.
    async fn get_tasks_from_date_range(
        &self,
        repo: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Task>>;

    /// Tasks whose `db_modified` is strictly after `since` (all tasks if
    /// `None`). Used by the indexed cache's incremental refresh.
    async fn modified_tasks_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Task>>;
}

/// Durable store for jobs. Same write contract as [`TaskDb`].
#[async_trait]
pub trait JobDb: Send + Sync {
    async fn put_job(&self, job: &mut Job) -> Result<()>;

    async fn put_jobs(&self, jobs: &mut [Job]) -> Result<()>;

    async fn get_job_by_id(&self, id: JobId) -> Result<Option<Job>>;

    async fn get_jobs_from_date_range(
        &self,
        repo: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Job>>;

    async fn modified_jobs_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Job>>;
}
