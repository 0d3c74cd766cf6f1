//! In-memory indexed caches over the durable store.
//!
//! The caches are read-mostly projections keyed by (repo, commit),
//! refreshed incrementally by pulling everything modified since the last
//! refresh. They reflect a store state no older than the last successful
//! `update()` and are explicitly not real-time; the store remains the
//! sole authority for write decisions.
//!
//! All mutation goes through one exclusive critical section, held only
//! for the merge itself, never across a store call. Readers get cloned
//! snapshots. Entries older than the retention window are evicted on
//! update; the window is a duration, not a count.

use chrono::{DateTime, Duration, Utc};
use cinder_core::Result;
use cinder_core::ids::{JobId, TaskId};
use cinder_core::job::Job;
use cinder_core::ports::{JobDb, TaskDb};
use cinder_core::task::Task;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::debug;

#[derive(Default)]
struct TaskCacheState {
    last_update: Option<DateTime<Utc>>,
    tasks: HashMap<TaskId, Task>,
    // repo -> revision -> ids of tasks touching that commit.
    by_commit: HashMap<String, HashMap<String, HashSet<TaskId>>>,
}

/// Time-windowed task index keyed by (repo, commit).
pub struct TaskCache {
    window: Duration,
    inner: Mutex<TaskCacheState>,
}

impl TaskCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            inner: Mutex::new(TaskCacheState::default()),
        }
    }

    /// Pull everything modified since the last refresh and merge it in,
    /// replacing prior versions of any id seen again.
    pub async fn update(&self, db: &dyn TaskDb) -> Result<()> {
        let since = self.lock().last_update;
        let modified = db.modified_tasks_since(since).await?;

        let horizon = Utc::now() - self.window;
        let mut state = self.lock();
        let mut newest = state.last_update;
        let merged = modified.len();
        for task in modified {
            newest = newest.max(task.db_modified);
            state
                .by_commit
                .entry(task.repo.clone())
                .or_default()
                .entry(task.revision.clone())
                .or_default()
                .insert(task.id);
            state.tasks.insert(task.id, task);
        }
        state.last_update = newest;

        let evicted: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|t| t.created < horizon)
            .map(|t| t.id)
            .collect();
        for id in &evicted {
            if let Some(task) = state.tasks.remove(id)
                && let Some(commits) = state.by_commit.get_mut(&task.repo)
            {
                if let Some(ids) = commits.get_mut(&task.revision) {
                    ids.remove(id);
                    if ids.is_empty() {
                        commits.remove(&task.revision);
                    }
                }
                if commits.is_empty() {
                    state.by_commit.remove(&task.repo);
                }
            }
        }
        debug!(merged, evicted = evicted.len(), "task cache updated");
        Ok(())
    }

    /// Tasks per requested commit. Every requested commit gets an entry,
    /// empty if nothing touches it.
    pub fn get_tasks_for_commits(
        &self,
        repo: &str,
        commits: &[String],
    ) -> HashMap<String, Vec<Task>> {
        let state = self.lock();
        let mut result = HashMap::with_capacity(commits.len());
        for commit in commits {
            let mut tasks: Vec<Task> = state
                .by_commit
                .get(repo)
                .and_then(|c| c.get(commit))
                .map(|ids| ids.iter().filter_map(|id| state.tasks.get(id)).cloned().collect())
                .unwrap_or_default();
            tasks.sort_by(|a, b| a.created.cmp(&b.created).then(a.name.cmp(&b.name)));
            result.insert(commit.clone(), tasks);
        }
        result
    }

    pub fn get_task(&self, id: TaskId) -> Option<Task> {
        self.lock().tasks.get(&id).cloned()
    }

    /// All cached tasks in a non-terminal status, across repos.
    pub fn unfinished_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .lock()
            .tasks
            .values()
            .filter(|t| !t.done())
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created);
        tasks
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TaskCacheState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Default)]
struct JobCacheState {
    last_update: Option<DateTime<Utc>>,
    jobs: HashMap<JobId, Job>,
    by_commit: HashMap<String, HashMap<String, HashSet<JobId>>>,
}

/// Time-windowed job index keyed by (repo, commit).
pub struct JobCache {
    window: Duration,
    inner: Mutex<JobCacheState>,
}

impl JobCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            inner: Mutex::new(JobCacheState::default()),
        }
    }

    pub async fn update(&self, db: &dyn JobDb) -> Result<()> {
        let since = self.lock().last_update;
        let modified = db.modified_jobs_since(since).await?;

        let horizon = Utc::now() - self.window;
        let mut state = self.lock();
        let mut newest = state.last_update;
        let merged = modified.len();
        for job in modified {
            newest = newest.max(job.db_modified);
            state
                .by_commit
                .entry(job.repo.clone())
                .or_default()
                .entry(job.revision.clone())
                .or_default()
                .insert(job.id);
            state.jobs.insert(job.id, job);
        }
        state.last_update = newest;

        let evicted: Vec<JobId> = state
            .jobs
            .values()
            .filter(|j| j.created < horizon)
            .map(|j| j.id)
            .collect();
        for id in &evicted {
            if let Some(job) = state.jobs.remove(id)
                && let Some(commits) = state.by_commit.get_mut(&job.repo)
            {
                if let Some(ids) = commits.get_mut(&job.revision) {
                    ids.remove(id);
                    if ids.is_empty() {
                        commits.remove(&job.revision);
                    }
                }
                if commits.is_empty() {
                    state.by_commit.remove(&job.repo);
                }
            }
        }
        debug!(merged, evicted = evicted.len(), "job cache updated");
        Ok(())
    }

    pub fn jobs_for_commit(&self, repo: &str, revision: &str) -> Vec<Job> {
        let state = self.lock();
        let mut jobs: Vec<Job> = state
            .by_commit
            .get(repo)
            .and_then(|c| c.get(revision))
            .map(|ids| ids.iter().filter_map(|id| state.jobs.get(id)).cloned().collect())
            .unwrap_or_default();
        jobs.sort_by_key(|j| j.created);
        jobs
    }

    pub fn get_job(&self, id: JobId) -> Option<Job> {
        self.lock().jobs.get(&id).cloned()
    }

    /// All cached jobs still in progress, across repos.
    pub fn unfinished_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .lock()
            .jobs
            .values()
            .filter(|j| !j.done())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created);
        jobs
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JobCacheState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use crate::store::LogDb;
    use cinder_core::status::{JobStatus, TaskStatus};

    fn week() -> Duration {
        Duration::days(7)
    }

    #[tokio::test]
    async fn cache_is_stale_until_updated() {
        let db = LogDb::in_memory(Codec::new(2));
        let cache = TaskCache::new(week());
        let mut task = Task::new("skia", "abc123", "Build-Release");
        db.put_task(&mut task).await.unwrap();

        // Not real-time: the put is invisible until update().
        let commits = vec!["abc123".to_string()];
        assert!(cache.get_tasks_for_commits("skia", &commits)["abc123"].is_empty());

        cache.update(&db).await.unwrap();
        let tasks = cache.get_tasks_for_commits("skia", &commits);
        assert_eq!(tasks["abc123"].len(), 1);
        assert_eq!(tasks["abc123"][0].id, task.id);
    }

    #[tokio::test]
    async fn update_replaces_prior_versions_of_the_same_id() {
        let db = LogDb::in_memory(Codec::new(2));
        let cache = TaskCache::new(week());
        let mut task = Task::new("skia", "abc123", "Build-Release");
        db.put_task(&mut task).await.unwrap();
        cache.update(&db).await.unwrap();

        task.finish(TaskStatus::Success, Utc::now());
        db.put_task(&mut task).await.unwrap();
        cache.update(&db).await.unwrap();

        let cached = cache.get_task(task.id).unwrap();
        assert_eq!(cached.status, TaskStatus::Success);
        assert_eq!(cache.unfinished_tasks().len(), 0);
    }

    #[tokio::test]
    async fn entries_outside_the_retention_window_are_evicted() {
        let db = LogDb::in_memory(Codec::new(2));
        let cache = TaskCache::new(Duration::hours(1));

        let mut old = Task::new("skia", "old000", "Build-Release");
        old.created = Utc::now() - Duration::hours(2);
        let fresh = Task::new("skia", "new111", "Build-Release");
        db.put_tasks(&mut [old, fresh]).await.unwrap();

        cache.update(&db).await.unwrap();
        let commits = vec!["old000".to_string(), "new111".to_string()];
        let tasks = cache.get_tasks_for_commits("skia", &commits);
        assert!(tasks["old000"].is_empty());
        assert_eq!(tasks["new111"].len(), 1);
    }

    #[tokio::test]
    async fn requested_commits_without_tasks_get_empty_entries() {
        let cache = TaskCache::new(week());
        let commits = vec!["nothere".to_string()];
        let tasks = cache.get_tasks_for_commits("skia", &commits);
        assert!(tasks.contains_key("nothere"));
        assert!(tasks["nothere"].is_empty());
    }

    #[tokio::test]
    async fn job_cache_tracks_unfinished_jobs() {
        let db = LogDb::in_memory(Codec::new(2));
        let cache = JobCache::new(week());

        let open = Job::new("skia", "abc123", "skia", vec!["A".into()], 0.9);
        let mut closed = Job::new("skia", "def456", "skia", vec!["A".into()], 0.9);
        closed.finish(JobStatus::Success, Utc::now());
        db.put_jobs(&mut [open, closed]).await.unwrap();

        cache.update(&db).await.unwrap();
        let unfinished = cache.unfinished_jobs();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].repo, "skia");
        assert_eq!(unfinished[0].revision, "abc123");
        assert_eq!(cache.jobs_for_commit("skia", "def456").len(), 1);
    }
}
