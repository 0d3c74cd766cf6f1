//! The scheduling loop.
//!
//! `run_once` performs one iteration: refresh the caches, ensure every
//! watched commit with a parseable config has a job, generate and rank
//! dispatch candidates, match them against idle workers, reconcile running
//! tasks against the worker pool, and roll completed dependency sets up
//! into job statuses. The external driver owns the continuous loop and the
//! tick policy; `run_once` only reports whether another iteration is worth
//! running immediately.
//!
//! Mirror, pool, and stager failures are transient: logged and retried
//! next iteration. Store failures abort the iteration.

use crate::candidates::{self, Candidate};
use crate::config::SchedulerConfig;
use crate::dag::{DagBuilder, SpecDag};
use crate::workers::WorkerAllocator;

use chrono::{Duration, Utc};
use cinder_core::ids::{JobId, TaskId};
use cinder_core::job::Job;
use cinder_core::ports::{
    ExecutionStatus, InputStager, JobDb, RepoMirror, TaskDb, TriggerRequest, Worker, WorkerPool,
};
use cinder_core::spec::{TASKS_CFG_FILE, TasksCfg};
use cinder_core::status::{JobStatus, TaskStatus};
use cinder_core::task::Task;
use cinder_core::{Error, Result};
use cinder_db::{JobCache, TaskCache};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Conflicting store writes are retried this many times before the
/// iteration gives up.
const PUT_RETRIES: u32 = 3;

/// One watched commit whose task config parsed and validated.
struct CommitState {
    repo: String,
    revision: String,
    /// Commits between this one and the newest watched commit.
    distance: usize,
    cfg: TasksCfg,
    dag: SpecDag,
}

pub struct Scheduler {
    config: SchedulerConfig,
    mirror: Arc<dyn RepoMirror>,
    pool: Arc<dyn WorkerPool>,
    stager: Arc<dyn InputStager>,
    task_db: Arc<dyn TaskDb>,
    job_db: Arc<dyn JobDb>,
    task_cache: TaskCache,
    job_cache: JobCache,
    dag_builder: DagBuilder,
    /// Candidates the last iteration could not match to a worker.
    queue: Vec<Candidate>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        mirror: Arc<dyn RepoMirror>,
        pool: Arc<dyn WorkerPool>,
        stager: Arc<dyn InputStager>,
        task_db: Arc<dyn TaskDb>,
        job_db: Arc<dyn JobDb>,
    ) -> Self {
        let window = Duration::seconds(config.cache_window_secs as i64);
        Self {
            config,
            mirror,
            pool,
            stager,
            task_db,
            job_db,
            task_cache: TaskCache::new(window),
            job_cache: JobCache::new(window),
            dag_builder: DagBuilder::new(),
            queue: Vec::new(),
        }
    }

    /// Candidates left unmatched by the last iteration.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// One scheduling iteration. Returns whether it produced candidates or
    /// changed any task or job status, meaning another iteration should
    /// follow without waiting for the tick.
    pub async fn run_once(&mut self) -> Result<bool> {
        self.task_cache.update(self.task_db.as_ref()).await?;
        self.job_cache.update(self.job_db.as_ref()).await?;

        let mut progress = false;
        let commits = self.scan_repos().await;
        progress |= self.ensure_jobs(&commits).await?;

        let mut queue = self.generate_candidates(&commits);
        candidates::rank(&mut queue);
        progress |= !queue.is_empty();
        self.dispatch(queue).await?;

        progress |= self.reconcile().await?;
        progress |= self.rollup().await?;
        Ok(progress)
    }

    /// Cancel a job. Terminal immediately; the commit's remaining
    /// unsatisfied specs never get tasks afterwards.
    pub async fn cancel_job(&self, id: JobId) -> Result<()> {
        for _ in 0..PUT_RETRIES {
            let Some(mut job) = self.job_db.get_job_by_id(id).await? else {
                return Err(Error::NotFound(id.to_string()));
            };
            if job.done() {
                if job.status == JobStatus::Canceled {
                    return Ok(());
                }
                return Err(Error::JobAlreadyFinished(id.to_string()));
            }
            job.finish(JobStatus::Canceled, Utc::now());
            match self.job_db.put_job(&mut job).await {
                Ok(()) => {
                    info!(job = %id, "job canceled");
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    debug!(job = %id, "conflicting job write, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::Store(format!(
            "gave up canceling {id} after {PUT_RETRIES} conflicting writes"
        )))
    }

    /// Walk every watched repo and return the commits whose task config
    /// parsed and validated. Unreadable or invalid configs are logged and
    /// skipped; the commit is retried next iteration.
    async fn scan_repos(&self) -> Vec<CommitState> {
        let mut commits = Vec::new();
        for repo in &self.config.repos {
            let revisions = match self.mirror.list_commits(repo).await {
                Ok(revisions) => revisions,
                Err(e) => {
                    warn!(repo = %repo, error = %e, "listing commits failed");
                    continue;
                }
            };
            for (distance, revision) in revisions.into_iter().enumerate() {
                let contents = match self.mirror.read_file(repo, &revision, TASKS_CFG_FILE).await {
                    Ok(contents) => contents,
                    Err(e) => {
                        warn!(repo = %repo, revision = %revision, error = %e, "reading task config failed");
                        continue;
                    }
                };
                let cfg = match TasksCfg::parse(&contents) {
                    Ok(cfg) => cfg,
                    Err(e) => {
                        warn!(repo = %repo, revision = %revision, error = %e, "invalid task config");
                        continue;
                    }
                };
                let dag = match self.dag_builder.build(&cfg) {
                    Ok(dag) => dag,
                    Err(e) => {
                        warn!(repo = %repo, revision = %revision, error = %e, "invalid task config");
                        continue;
                    }
                };
                commits.push(CommitState {
                    repo: repo.clone(),
                    revision,
                    distance,
                    cfg,
                    dag,
                });
            }
        }
        commits
    }

    /// Persist one job for every commit that does not have one yet. The
    /// job freezes the config's spec names as its dependency list.
    async fn ensure_jobs(&self, commits: &[CommitState]) -> Result<bool> {
        let mut progress = false;
        for commit in commits {
            if !self
                .job_cache
                .jobs_for_commit(&commit.repo, &commit.revision)
                .is_empty()
            {
                continue;
            }
            let name = commit
                .cfg
                .name
                .clone()
                .unwrap_or_else(|| commit.repo.clone());
            let mut dependencies: Vec<String> = commit.cfg.tasks.keys().cloned().collect();
            dependencies.sort();
            let priority = commit
                .cfg
                .tasks
                .values()
                .fold(0.0_f64, |acc, spec| acc.max(spec.priority));
            let mut job = Job::new(&commit.repo, &commit.revision, name, dependencies, priority);
            self.job_db.put_job(&mut job).await?;
            info!(job = %job.id, repo = %commit.repo, revision = %commit.revision, "created job");
            progress = true;
        }
        Ok(progress)
    }

    /// Candidates eligible for a new task attempt, per the cached task
    /// state. Commits with a canceled job are skipped entirely.
    fn generate_candidates(&self, commits: &[CommitState]) -> Vec<Candidate> {
        let mut queue = Vec::new();
        for commit in commits {
            let canceled = self
                .job_cache
                .jobs_for_commit(&commit.repo, &commit.revision)
                .iter()
                .any(|j| j.status == JobStatus::Canceled);
            if canceled {
                continue;
            }
            let revisions = vec![commit.revision.clone()];
            let tasks = self
                .task_cache
                .get_tasks_for_commits(&commit.repo, &revisions);
            let tasks_here = &tasks[&commit.revision];
            let completed: Vec<String> = tasks_here
                .iter()
                .filter(|t| t.status == TaskStatus::Success)
                .map(|t| t.name.clone())
                .collect();
            for (name, spec) in &commit.cfg.tasks {
                if !commit.dag.is_ready(name, &completed) {
                    continue;
                }
                let Some(attempt) =
                    candidates::next_attempt(name, tasks_here, self.config.retry_bound)
                else {
                    continue;
                };
                queue.push(Candidate {
                    repo: commit.repo.clone(),
                    revision: commit.revision.clone(),
                    name: name.clone(),
                    spec: spec.clone(),
                    commit_distance: commit.distance,
                    attempt,
                });
            }
        }
        queue
    }

    /// Match ranked candidates against idle workers and dispatch the
    /// matches. Unmatched candidates stay queued for the next iteration.
    async fn dispatch(&mut self, queue: Vec<Candidate>) -> Result<()> {
        let workers = match self.pool.list_idle_workers().await {
            Ok(workers) => workers,
            Err(e) => {
                warn!(error = %e, "listing idle workers failed");
                self.queue = queue;
                return Ok(());
            }
        };
        let mut allocator = WorkerAllocator::new(workers);
        let mut leftover = Vec::new();
        for candidate in queue {
            let dimensions = match candidate.spec.dimension_map() {
                Ok(dimensions) => dimensions,
                Err(e) => {
                    warn!(name = %candidate.name, error = %e, "dropping candidate");
                    continue;
                }
            };
            let Some(worker) = allocator.take_matching(&dimensions) else {
                leftover.push(candidate);
                continue;
            };
            self.dispatch_one(candidate, worker, dimensions).await?;
        }
        self.queue = leftover;
        Ok(())
    }

    /// Stage inputs and trigger one candidate on one worker. Staging or
    /// trigger failure becomes a terminal mishap task; the loop continues.
    async fn dispatch_one(
        &self,
        candidate: Candidate,
        worker: Worker,
        dimensions: std::collections::HashMap<String, String>,
    ) -> Result<()> {
        let mut task = Task::new(&candidate.repo, &candidate.revision, &candidate.name);
        task.attempt = candidate.attempt;

        let triggered = match self
            .stager
            .stage(&candidate.repo, &candidate.revision, &candidate.spec.isolate)
            .await
        {
            Ok(input_bundle) => {
                let request = TriggerRequest {
                    worker_id: worker.id.clone(),
                    task_id: task.id,
                    task_name: candidate.name.clone(),
                    repo: candidate.repo.clone(),
                    revision: candidate.revision.clone(),
                    input_bundle,
                    dimensions,
                    cipd_packages: candidate.spec.cipd_packages.clone(),
                    priority: candidate.spec.priority,
                };
                self.pool.trigger(&request).await
            }
            Err(e) => Err(e),
        };

        match triggered {
            Ok(execution_id) => {
                task.status = TaskStatus::Running;
                task.started = Some(Utc::now());
                task.execution_id = Some(execution_id);
                self.task_db.put_task(&mut task).await?;
                info!(task = %task.id, name = %task.name, worker = %worker.id, "dispatched task");
            }
            Err(e) => {
                warn!(name = %candidate.name, error = %e, "dispatch failed, recording mishap");
                task.finish(TaskStatus::Mishap, Utc::now());
                self.task_db.put_task(&mut task).await?;
            }
        }
        Ok(())
    }

    /// Poll running tasks and persist terminal results. Tasks running past
    /// the execution timeout become mishaps regardless of the pool.
    async fn reconcile(&self) -> Result<bool> {
        let timeout = Duration::seconds(self.config.task_timeout_secs as i64);
        let now = Utc::now();
        let mut progress = false;
        for task in self.task_cache.unfinished_tasks() {
            if task.status != TaskStatus::Running {
                continue;
            }
            let begun = task.started.unwrap_or(task.created);
            if now - begun > timeout {
                warn!(task = %task.id, name = %task.name, "task exceeded its execution timeout");
                progress |= self.finish_task(task.id, TaskStatus::Mishap, None).await?;
                continue;
            }
            let Some(execution_id) = task.execution_id.clone() else {
                warn!(task = %task.id, "running task has no execution handle");
                progress |= self.finish_task(task.id, TaskStatus::Mishap, None).await?;
                continue;
            };
            let execution = match self.pool.poll(&execution_id).await {
                Ok(execution) => execution,
                Err(e) => {
                    warn!(task = %task.id, error = %e, "polling execution failed");
                    continue;
                }
            };
            if !execution.status.is_terminal() {
                continue;
            }
            let status = match execution.status {
                ExecutionStatus::Completed => TaskStatus::Success,
                ExecutionStatus::Failed => TaskStatus::Failure,
                _ => TaskStatus::Mishap,
            };
            progress |= self.finish_task(task.id, status, execution.output).await?;
        }
        Ok(progress)
    }

    /// Finish every cached unfinished job whose dependency tasks have all
    /// resolved terminally: status is the worst mapped dependency status.
    async fn rollup(&self) -> Result<bool> {
        let mut progress = false;
        for job in self.job_cache.unfinished_jobs() {
            let revisions = vec![job.revision.clone()];
            let tasks = self.task_cache.get_tasks_for_commits(&job.repo, &revisions);
            let tasks_here = &tasks[&job.revision];

            let mut worst = JobStatus::Success;
            let mut resolved = true;
            for dep in &job.dependencies {
                match dep_outcome(dep, tasks_here, self.config.retry_bound) {
                    Some(status) => worst = JobStatus::worse(worst, JobStatus::from(status)),
                    None => {
                        resolved = false;
                        break;
                    }
                }
            }
            if !resolved {
                continue;
            }
            info!(job = %job.id, status = ?worst, "job finished");
            progress |= self.finish_job(job.id, worst).await?;
        }
        Ok(progress)
    }

    /// Finish a task through read-modify-write with bounded conflict
    /// retry. A task someone else already finished is left alone.
    async fn finish_task(
        &self,
        id: TaskId,
        status: TaskStatus,
        output: Option<String>,
    ) -> Result<bool> {
        for _ in 0..PUT_RETRIES {
            let Some(mut task) = self.task_db.get_task_by_id(id).await? else {
                return Ok(false);
            };
            if task.status.is_terminal() {
                return Ok(false);
            }
            if status == TaskStatus::Success {
                task.isolated_output = output.clone();
            }
            task.finish(status, Utc::now());
            match self.task_db.put_task(&mut task).await {
                Ok(()) => return Ok(true),
                Err(e) if e.is_conflict() => {
                    debug!(task = %id, "conflicting task write, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::Store(format!(
            "gave up on task {id} after {PUT_RETRIES} conflicting writes"
        )))
    }

    async fn finish_job(&self, id: JobId, status: JobStatus) -> Result<bool> {
        for _ in 0..PUT_RETRIES {
            let Some(mut job) = self.job_db.get_job_by_id(id).await? else {
                return Ok(false);
            };
            if job.done() {
                return Ok(false);
            }
            job.finish(status, Utc::now());
            match self.job_db.put_job(&mut job).await {
                Ok(()) => return Ok(true),
                Err(e) if e.is_conflict() => {
                    debug!(job = %id, "conflicting job write, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::Store(format!(
            "gave up on job {id} after {PUT_RETRIES} conflicting writes"
        )))
    }
}

/// The terminal outcome one dependency name contributes to its job, or
/// `None` while the name still has work coming: no task yet, a live task,
/// or a failed attempt that is still retry-eligible.
fn dep_outcome(name: &str, tasks_here: &[Task], retry_bound: u32) -> Option<TaskStatus> {
    let newest = tasks_here
        .iter()
        .filter(|t| t.name == name)
        .max_by(|a, b| (a.attempt, a.created).cmp(&(b.attempt, b.created)))?;
    if !newest.status.is_terminal() {
        return None;
    }
    if matches!(newest.status, TaskStatus::Failure | TaskStatus::Mishap)
        && candidates::next_attempt(name, tasks_here, retry_bound).is_some()
    {
        return None;
    }
    Some(newest.status)
}
