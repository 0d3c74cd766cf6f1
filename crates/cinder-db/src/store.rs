//! Append-only record log with an in-memory index.
//!
//! `LogDb` is the authoritative store for tasks and jobs. Every put
//! appends codec records to a log file and updates the index; opening a
//! store replays the log, keeping the newest record per id, so the
//! scheduler is restartable after a crash. Nothing is ever physically
//! deleted.
//!
//! Writers are serialized; readers take snapshot clones from the index
//! and are never blocked by a write in progress.

use crate::codec::Codec;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use cinder_core::ids::{JobId, TaskId};
use cinder_core::job::Job;
use cinder_core::ports::{JobDb, TaskDb};
use cinder_core::task::Task;
use cinder_core::{Error, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::info;

const TASK_LOG: &str = "tasks.log";
const JOB_LOG: &str = "jobs.log";

#[derive(Default)]
struct DbIndex {
    tasks: HashMap<TaskId, Task>,
    jobs: HashMap<JobId, Job>,
    last_stamp: Option<DateTime<Utc>>,
}

impl DbIndex {
    /// Commit time for the next put: wall clock, nudged forward if the
    /// clock has not advanced past the previous commit. Strictly
    /// monotonic per store, which is what the caches' modified-since
    /// refresh relies on.
    fn next_commit_stamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.last_stamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        }
    }
}

struct LogFiles {
    tasks: Option<File>,
    jobs: Option<File>,
}

/// Durable task/job store: append-only log + in-memory index.
pub struct LogDb {
    codec: Codec,
    index: RwLock<DbIndex>,
    // Held for the whole of a put: stamp validation, the append, and the
    // index merge must not interleave with another writer.
    writer: tokio::sync::Mutex<LogFiles>,
}

impl LogDb {
    /// Open (or create) a store in `dir`, replaying any existing logs.
    pub async fn open(dir: &Path, codec: Codec) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;

        let mut index = DbIndex::default();
        let task_blobs = read_log(&dir.join(TASK_LOG)).await?;
        for task in codec.decode_tasks(task_blobs).await? {
            merge_newest(&mut index.tasks, task.id, task, |t| t.db_modified);
        }
        let job_blobs = read_log(&dir.join(JOB_LOG)).await?;
        for job in codec.decode_jobs(job_blobs).await? {
            merge_newest(&mut index.jobs, job.id, job, |j| j.db_modified);
        }
        index.last_stamp = index
            .tasks
            .values()
            .filter_map(|t| t.db_modified)
            .chain(index.jobs.values().filter_map(|j| j.db_modified))
            .max();
        info!(
            tasks = index.tasks.len(),
            jobs = index.jobs.len(),
            dir = %dir.display(),
            "replayed record logs"
        );

        let files = LogFiles {
            tasks: Some(open_append(&dir.join(TASK_LOG)).await?),
            jobs: Some(open_append(&dir.join(JOB_LOG)).await?),
        };
        Ok(Self {
            codec,
            index: RwLock::new(index),
            writer: tokio::sync::Mutex::new(files),
        })
    }

    /// An ephemeral store with no backing log. Used by tests.
    pub fn in_memory(codec: Codec) -> Self {
        Self {
            codec,
            index: RwLock::new(DbIndex::default()),
            writer: tokio::sync::Mutex::new(LogFiles {
                tasks: None,
                jobs: None,
            }),
        }
    }

    fn index(&self) -> std::sync::RwLockReadGuard<'_, DbIndex> {
        self.index.read().unwrap_or_else(|e| e.into_inner())
    }

    fn index_mut(&self) -> std::sync::RwLockWriteGuard<'_, DbIndex> {
        self.index.write().unwrap_or_else(|e| e.into_inner())
    }
}

async fn open_append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?)
}

/// Read a newline-delimited record log; missing file means empty store.
async fn read_log(path: &Path) -> Result<Vec<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| line.to_vec())
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Keep the record with the newest modification stamp per id. Replay
/// order does not matter because stamps are monotonic per store.
fn merge_newest<K, V, F>(map: &mut HashMap<K, V>, key: K, value: V, stamp: F)
where
    K: std::hash::Hash + Eq,
    F: Fn(&V) -> Option<DateTime<Utc>>,
{
    match map.get(&key) {
        Some(existing) if stamp(existing) >= stamp(&value) => {}
        _ => {
            map.insert(key, value);
        }
    }
}

async fn append_records(file: &mut Option<File>, blobs: &[Vec<u8>]) -> Result<()> {
    if let Some(file) = file.as_mut() {
        for blob in blobs {
            file.write_all(blob).await?;
            file.write_all(b"\n").await?;
        }
        file.flush().await?;
    }
    Ok(())
}

#[async_trait]
impl TaskDb for LogDb {
    async fn put_task(&self, task: &mut Task) -> Result<()> {
        self.put_tasks(std::slice::from_mut(task)).await
    }

    async fn put_tasks(&self, tasks: &mut [Task]) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let mut files = self.writer.lock().await;

        // Validate every stamp before applying anything.
        let commit = {
            let index = self.index();
            for task in tasks.iter() {
                let current = index.tasks.get(&task.id).and_then(|t| t.db_modified);
                if task.db_modified != current {
                    return Err(Error::Conflict {
                        id: task.id.to_string(),
                        expected: task.db_modified,
                        actual: current,
                    });
                }
            }
            index.next_commit_stamp()
        };

        let mut stamped = tasks.to_vec();
        for task in &mut stamped {
            task.db_modified = Some(commit);
        }
        let blobs = self.codec.encode_tasks(&stamped).await?;
        append_records(&mut files.tasks, &blobs).await?;

        {
            let mut index = self.index_mut();
            for task in &stamped {
                index.tasks.insert(task.id, task.clone());
            }
            index.last_stamp = Some(commit);
        }
        for (task, stamped) in tasks.iter_mut().zip(&stamped) {
            task.db_modified = stamped.db_modified;
        }
        Ok(())
    }

    async fn get_task_by_id(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.index().tasks.get(&id).cloned())
    }

    async fn get_tasks_from_date_range(
        &self,
        repo: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .index()
            .tasks
            .values()
            .filter(|t| t.repo == repo && t.created >= start && t.created < end)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created);
        Ok(tasks)
    }

    async fn modified_tasks_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Task>> {
        Ok(self
            .index()
            .tasks
            .values()
            .filter(|t| since.is_none() || t.db_modified > since)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl JobDb for LogDb {
    async fn put_job(&self, job: &mut Job) -> Result<()> {
        self.put_jobs(std::slice::from_mut(job)).await
    }

    async fn put_jobs(&self, jobs: &mut [Job]) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let mut files = self.writer.lock().await;

        let commit = {
            let index = self.index();
            for job in jobs.iter() {
                let current = index.jobs.get(&job.id).and_then(|j| j.db_modified);
                if job.db_modified != current {
                    return Err(Error::Conflict {
                        id: job.id.to_string(),
                        expected: job.db_modified,
                        actual: current,
                    });
                }
            }
            index.next_commit_stamp()
        };

        let mut stamped = jobs.to_vec();
        for job in &mut stamped {
            job.db_modified = Some(commit);
        }
        let blobs = self.codec.encode_jobs(&stamped).await?;
        append_records(&mut files.jobs, &blobs).await?;

        {
            let mut index = self.index_mut();
            for job in &stamped {
                index.jobs.insert(job.id, job.clone());
            }
            index.last_stamp = Some(commit);
        }
        for (job, stamped) in jobs.iter_mut().zip(&stamped) {
            job.db_modified = stamped.db_modified;
        }
        Ok(())
    }

    async fn get_job_by_id(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.index().jobs.get(&id).cloned())
    }

    async fn get_jobs_from_date_range(
        &self,
        repo: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .index()
            .jobs
            .values()
            .filter(|j| j.repo == repo && j.created >= start && j.created < end)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created);
        Ok(jobs)
    }

    async fn modified_jobs_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Job>> {
        Ok(self
            .index()
            .jobs
            .values()
            .filter(|j| since.is_none() || j.db_modified > since)
            .cloned()
            .collect())
    }
}
