//! End-to-end serialization tests: codec envelope, wire format stability,
//! and persistence through the record log.

use chrono::Utc;
use cinder_core::job::Job;
use cinder_core::ports::{JobDb, TaskDb};
use cinder_core::status::{JobStatus, TaskStatus};
use cinder_core::task::Task;
use cinder_db::{Codec, LogDb};

#[test]
fn test_task_status_serialization() {
    assert_eq!(
        serde_json::to_string(&TaskStatus::Pending).unwrap(),
        "\"pending\""
    );
    assert_eq!(
        serde_json::to_string(&TaskStatus::Running).unwrap(),
        "\"running\""
    );
    assert_eq!(
        serde_json::to_string(&TaskStatus::Success).unwrap(),
        "\"success\""
    );
    assert_eq!(
        serde_json::to_string(&TaskStatus::Failure).unwrap(),
        "\"failure\""
    );
    assert_eq!(
        serde_json::to_string(&TaskStatus::Mishap).unwrap(),
        "\"mishap\""
    );
}

#[test]
fn test_job_status_serialization() {
    assert_eq!(
        serde_json::to_string(&JobStatus::InProgress).unwrap(),
        "\"in_progress\""
    );
    assert_eq!(
        serde_json::to_string(&JobStatus::Canceled).unwrap(),
        "\"canceled\""
    );
    assert_eq!(
        serde_json::to_string(&JobStatus::Mishap).unwrap(),
        "\"mishap\""
    );
}

#[tokio::test]
async fn test_record_envelope_carries_version_and_kind() {
    let codec = Codec::new(1);
    let task = Task::new("skia", "abc123", "Build-Release");
    let blobs = codec
        .encode_tasks(std::slice::from_ref(&task))
        .await
        .expect("encode");

    let record: serde_json::Value = serde_json::from_slice(&blobs[0]).expect("parse envelope");
    assert_eq!(record["version"], 1);
    assert_eq!(record["kind"], "task");
    assert_eq!(record["payload"]["repo"], "skia");
    assert_eq!(record["payload"]["name"], "Build-Release");
}

#[tokio::test]
async fn test_task_wire_fields_are_stable() {
    // Renaming any of these breaks decoding of existing logs.
    let codec = Codec::new(1);
    let mut task = Task::new("skia", "abc123", "Build-Release");
    task.finish(TaskStatus::Success, Utc::now());
    task.isolated_output = Some("out".to_string());
    task.execution_id = Some("exec-1".to_string());

    let blobs = codec
        .encode_tasks(std::slice::from_ref(&task))
        .await
        .expect("encode");
    let record: serde_json::Value = serde_json::from_slice(&blobs[0]).expect("parse");
    let payload = record["payload"].as_object().expect("payload object");
    for field in [
        "id",
        "repo",
        "revision",
        "name",
        "status",
        "created",
        "started",
        "finished",
        "isolated_output",
        "execution_id",
        "attempt",
        "db_modified",
    ] {
        assert!(payload.contains_key(field), "missing field {field}");
    }
}

#[tokio::test]
async fn test_entities_survive_store_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");

    let mut task = Task::new("skia", "abc123", "Build-Release");
    let mut job = Job::new("skia", "abc123", "skia", vec!["Build-Release".into()], 0.9);
    {
        let db = LogDb::open(dir.path(), Codec::new(4)).await.expect("open");
        db.put_task(&mut task).await.expect("put task");
        task.finish(TaskStatus::Success, Utc::now());
        db.put_task(&mut task).await.expect("update task");
        db.put_job(&mut job).await.expect("put job");
    }

    let db = LogDb::open(dir.path(), Codec::new(4)).await.expect("reopen");
    let replayed = db
        .get_task_by_id(task.id)
        .await
        .expect("get task")
        .expect("task replayed");
    assert_eq!(replayed.status, TaskStatus::Success);
    assert_eq!(replayed.db_modified, task.db_modified);
    let replayed_job = db
        .get_job_by_id(job.id)
        .await
        .expect("get job")
        .expect("job replayed");
    assert_eq!(replayed_job.dependencies, vec!["Build-Release".to_string()]);
}

#[tokio::test]
async fn test_large_batch_roundtrips_through_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut tasks: Vec<Task> = (0..100)
        .map(|i| Task::new("skia", format!("commit{}", i % 10), format!("Task-{i}")))
        .collect();
    {
        let db = LogDb::open(dir.path(), Codec::new(8)).await.expect("open");
        db.put_tasks(&mut tasks).await.expect("put batch");
    }

    let db = LogDb::open(dir.path(), Codec::new(8)).await.expect("reopen");
    for task in &tasks {
        let got = db
            .get_task_by_id(task.id)
            .await
            .expect("get")
            .expect("task replayed");
        assert_eq!(&got, task);
    }
}
