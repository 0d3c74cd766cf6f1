//! Versioned record codec with concurrent batch encode/decode.
//!
//! Every persisted entity is wrapped in an envelope carrying a format
//! version and a record kind. Schema evolution rules:
//!   - new payload fields must carry `#[serde(default)]` so old records
//!     decode with meaningful zero-values,
//!   - field types are never reinterpreted,
//!   - removed field names go on [`RETIRED_FIELDS`] and are never reused.
//!
//! Batch conversion fans work out across a fixed-size worker pool and
//! fans it back in through an unordered collector: callers get results in
//! arbitrary order and must not assume input/output alignment. The first
//! error aborts the whole batch; the input queue is drained so the
//! producer never deadlocks, and the partial result set is discarded.

use cinder_core::job::Job;
use cinder_core::task::Task;
use cinder_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};

/// Current record format version. Bump only for changes the evolution
/// rules above cannot express.
pub const RECORD_VERSION: u32 = 1;

/// Payload field names that were removed from Task/Job and must never be
/// reused for a new purpose.
pub const RETIRED_FIELDS: &[&str] = &[];

const DEFAULT_WORKERS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RecordKind {
    Task,
    Job,
}

/// The on-disk envelope around every persisted entity.
#[derive(Debug, Serialize, Deserialize)]
struct Record {
    version: u32,
    kind: RecordKind,
    payload: serde_json::Value,
}

fn encode_record<T: Serialize>(kind: RecordKind, entity: &T) -> Result<Vec<u8>> {
    let record = Record {
        version: RECORD_VERSION,
        kind,
        payload: serde_json::to_value(entity)?,
    };
    Ok(serde_json::to_vec(&record)?)
}

fn decode_record<T: DeserializeOwned>(kind: RecordKind, bytes: &[u8]) -> Result<T> {
    let record: Record = serde_json::from_slice(bytes)?;
    if record.version > RECORD_VERSION {
        return Err(Error::UnsupportedVersion {
            found: record.version,
            supported: RECORD_VERSION,
        });
    }
    if record.kind != kind {
        return Err(Error::Serialization(format!(
            "expected a {kind:?} record, found {:?}",
            record.kind
        )));
    }
    Ok(serde_json::from_value(record.payload)?)
}

/// Batch codec over a fixed-size worker pool.
#[derive(Debug, Clone)]
pub struct Codec {
    workers: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

impl Codec {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub async fn encode_tasks(&self, tasks: &[Task]) -> Result<Vec<Vec<u8>>> {
        self.run_batch(tasks.to_vec(), |t| encode_record(RecordKind::Task, &t))
            .await
    }

    /// Decode a batch of task records. Results are in arbitrary order.
    pub async fn decode_tasks(&self, blobs: Vec<Vec<u8>>) -> Result<Vec<Task>> {
        self.run_batch(blobs, |b| decode_record(RecordKind::Task, &b))
            .await
    }

    pub async fn encode_jobs(&self, jobs: &[Job]) -> Result<Vec<Vec<u8>>> {
        self.run_batch(jobs.to_vec(), |j| encode_record(RecordKind::Job, &j))
            .await
    }

    /// Decode a batch of job records. Results are in arbitrary order.
    pub async fn decode_jobs(&self, blobs: Vec<Vec<u8>>) -> Result<Vec<Job>> {
        self.run_batch(blobs, |b| decode_record(RecordKind::Job, &b))
            .await
    }

    /// Fan `inputs` out to the worker pool and collect results unordered.
    ///
    /// Cancellation is explicit: the first worker to hit an error flips
    /// the shared flag, and every worker keeps receiving (and discarding)
    /// inputs so the producer is never left blocked on a full channel.
    async fn run_batch<I, O, F>(&self, inputs: Vec<I>, op: F) -> Result<Vec<O>>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> Result<O> + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel::<I>(self.workers * 2);
        let rx = Arc::new(Mutex::new(rx));
        let canceled = Arc::new(AtomicBool::new(false));
        let op = Arc::new(op);

        let mut handles = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let rx = Arc::clone(&rx);
            let canceled = Arc::clone(&canceled);
            let op = Arc::clone(&op);
            handles.push(tokio::spawn(async move {
                let mut out = Vec::new();
                let mut first_err = None;
                loop {
                    let item = { rx.lock().await.recv().await };
                    let Some(item) = item else { break };
                    if canceled.load(Ordering::Relaxed) {
                        // Drain mode: keep the channel moving, drop the input.
                        continue;
                    }
                    match (*op)(item) {
                        Ok(v) => out.push(v),
                        Err(e) => {
                            canceled.store(true, Ordering::Relaxed);
                            first_err = Some(e);
                        }
                    }
                }
                (out, first_err)
            }));
        }

        let producer = tokio::spawn(async move {
            for item in inputs {
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        let mut results = Vec::new();
        let mut batch_err: Option<Error> = None;
        for joined in futures::future::join_all(handles).await {
            let (out, err) =
                joined.map_err(|e| Error::Internal(format!("codec worker panicked: {e}")))?;
            if batch_err.is_none() {
                batch_err = err;
            }
            results.extend(out);
        }
        producer
            .await
            .map_err(|e| Error::Internal(format!("codec producer panicked: {e}")))?;

        match batch_err {
            // A partial result set is never returned as best effort.
            Some(err) => Err(err),
            None => Ok(results),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::status::{JobStatus, TaskStatus};
    use std::collections::HashSet;

    fn make_task(name: &str) -> Task {
        let mut t = Task::new("skia", "abc123", name);
        t.status = TaskStatus::Running;
        t.started = Some(chrono::Utc::now());
        t
    }

    #[tokio::test]
    async fn task_roundtrip_preserves_every_field() {
        let codec = Codec::new(4);
        let mut task = make_task("Build-Release");
        task.finish(TaskStatus::Success, chrono::Utc::now());
        task.isolated_output = Some("abc123".to_string());
        task.execution_id = Some("exec-1".to_string());
        task.attempt = 2;

        let blobs = codec.encode_tasks(std::slice::from_ref(&task)).await.unwrap();
        let decoded = codec.decode_tasks(blobs).await.unwrap();
        assert_eq!(decoded, vec![task]);
    }

    #[tokio::test]
    async fn job_roundtrip_preserves_every_field() {
        let codec = Codec::new(4);
        let mut job = Job::new("skia", "abc123", "skia", vec!["Build-Release".into()], 0.9);
        job.finish(JobStatus::Failure, chrono::Utc::now());

        let blobs = codec.encode_jobs(std::slice::from_ref(&job)).await.unwrap();
        let decoded = codec.decode_jobs(blobs).await.unwrap();
        assert_eq!(decoded, vec![job]);
    }

    #[tokio::test]
    async fn batch_decode_returns_the_same_set_in_any_order() {
        let codec = Codec::new(3);
        let tasks: Vec<Task> = (0..50).map(|i| make_task(&format!("Task-{i}"))).collect();
        let mut blobs = codec.encode_tasks(&tasks).await.unwrap();
        blobs.reverse();

        let decoded = codec.decode_tasks(blobs).await.unwrap();
        assert_eq!(decoded.len(), tasks.len());
        let want: HashSet<_> = tasks.iter().map(|t| t.id).collect();
        let got: HashSet<_> = decoded.iter().map(|t| t.id).collect();
        assert_eq!(want, got);
    }

    #[tokio::test]
    async fn one_bad_record_aborts_the_whole_batch() {
        let codec = Codec::new(2);
        let tasks: Vec<Task> = (0..20).map(|i| make_task(&format!("Task-{i}"))).collect();
        let mut blobs = codec.encode_tasks(&tasks).await.unwrap();
        blobs.insert(10, b"not json".to_vec());

        // All inputs are consumed (no deadlock) and no partial set leaks.
        let err = codec.decode_tasks(blobs).await.unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[tokio::test]
    async fn job_record_does_not_decode_as_task() {
        let codec = Codec::new(2);
        let job = Job::new("skia", "abc123", "skia", vec![], 0.5);
        let blobs = codec.encode_jobs(std::slice::from_ref(&job)).await.unwrap();
        let err = codec.decode_tasks(blobs).await.unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[tokio::test]
    async fn newer_format_version_is_rejected() {
        let codec = Codec::new(1);
        let blob = serde_json::to_vec(&serde_json::json!({
            "version": RECORD_VERSION + 1,
            "kind": "task",
            "payload": {},
        }))
        .unwrap();
        let err = codec.decode_tasks(vec![blob]).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion { .. }));
    }

    #[tokio::test]
    async fn missing_added_field_decodes_to_its_default() {
        // `attempt` was added after v1 records shipped; old records omit it.
        let codec = Codec::new(1);
        let task = make_task("Build-Release");
        let blobs = codec.encode_tasks(std::slice::from_ref(&task)).await.unwrap();

        let mut record: serde_json::Value = serde_json::from_slice(&blobs[0]).unwrap();
        record["payload"]
            .as_object_mut()
            .unwrap()
            .remove("attempt");
        let old_blob = serde_json::to_vec(&record).unwrap();

        let decoded = codec.decode_tasks(vec![old_blob]).await.unwrap();
        assert_eq!(decoded[0].attempt, 0);
    }

    #[test]
    fn current_fields_never_collide_with_retired_names() {
        let task = serde_json::to_value(make_task("Build-Release")).unwrap();
        let job = serde_json::to_value(Job::new("skia", "abc", "skia", vec![], 0.5)).unwrap();
        for value in [task, job] {
            for field in value.as_object().unwrap().keys() {
                assert!(
                    !RETIRED_FIELDS.contains(&field.as_str()),
                    "field {field} reuses a retired name"
                );
            }
        }
    }
}
