//! Integration tests for the command-running handler.
#![cfg(unix)]

use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use workq::engine::{Queue, QueueConfig, Tick, Worker, WorkerConfig};
use workq::exec::{ExecConfig, ExecHandler};
use workq::model::*;
use workq::store::SqliteStore;

async fn test_queue() -> Queue {
    let store = SqliteStore::in_memory()
        .await
        .expect("failed to create in-memory store");
    Queue::new(Arc::new(store), QueueConfig::default())
}

fn exec_worker_with(queue: &Queue, work_dir: &Path, config: WorkerConfig) -> Worker {
    let handler = ExecHandler::new(ExecConfig {
        work_dir: work_dir.to_path_buf(),
    });
    Worker::new(
        0,
        queue.clone(),
        Arc::new(handler),
        config,
        CancellationToken::new(),
    )
}

fn exec_worker(queue: &Queue, work_dir: &Path) -> Worker {
    exec_worker_with(queue, work_dir, WorkerConfig::default())
}

fn shell(script: &str) -> serde_json::Value {
    json!({"command": "/bin/sh", "args": ["-c", script]})
}

async fn run_one(queue: &Queue, work_dir: &Path) -> Tick {
    let worker = exec_worker(queue, work_dir);
    let mut backoff = WorkerConfig::default().backoff();
    worker.tick(&mut backoff).await.unwrap()
}

#[tokio::test]
async fn zero_exit_completes_and_cleans_up() {
    let work_dir = tempfile::tempdir().unwrap();
    let queue = test_queue().await;
    let id = queue.enqueue(NewJob::new(shell("exit 0"))).await.unwrap();

    assert_eq!(
        run_one(&queue, work_dir.path()).await,
        Tick::Processed(Some(Finalization::Completed))
    );
    assert_eq!(queue.get(id).await.unwrap().status, Status::Complete);
    assert_eq!(std::fs::read_dir(work_dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn command_sees_job_file_and_environment() {
    let work_dir = tempfile::tempdir().unwrap();
    let queue = test_queue().await;
    let script = r#"grep -q "\"id\": $WORKQ_JOB_ID," job.json \
        && test "$WORKQ_ATTEMPTS_REMAINING" = "1" \
        && test "$(pwd -P)" = "$(cd "$WORKQ_JOB_DIR" && pwd -P)" \
        && test "$GREETING" = "hello""#;
    let payload = json!({
        "command": "/bin/sh",
        "args": ["-c", script],
        "env": {"GREETING": "hello"},
    });
    queue
        .enqueue(NewJob::new(payload).max_attempts(2))
        .await
        .unwrap();

    assert_eq!(
        run_one(&queue, work_dir.path()).await,
        Tick::Processed(Some(Finalization::Completed))
    );
}

#[tokio::test]
async fn nonzero_exit_fails_with_status() {
    let work_dir = tempfile::tempdir().unwrap();
    let queue = test_queue().await;
    let id = queue
        .enqueue(NewJob::new(shell("exit 3")).max_attempts(1))
        .await
        .unwrap();

    assert_eq!(
        run_one(&queue, work_dir.path()).await,
        Tick::Processed(Some(Finalization::Failed))
    );
    let job = queue.get(id).await.unwrap();
    assert_eq!(job.error.as_deref(), Some("command exited with status 3"));
    assert_eq!(std::fs::read_dir(work_dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn missing_command_fails_attempt() {
    let work_dir = tempfile::tempdir().unwrap();
    let queue = test_queue().await;
    let id = queue
        .enqueue(NewJob::new(json!({"command": "/nonexistent/workq-cmd"})).max_attempts(1))
        .await
        .unwrap();

    run_one(&queue, work_dir.path()).await;
    let job = queue.get(id).await.unwrap();
    assert_eq!(job.status, Status::Failed);
    assert!(job.error.unwrap().starts_with("failed to start"));
}

#[tokio::test]
async fn malformed_payload_fails_attempt() {
    let work_dir = tempfile::tempdir().unwrap();
    let queue = test_queue().await;
    let id = queue
        .enqueue(NewJob::new(json!({"args": ["no command"]})).max_attempts(1))
        .await
        .unwrap();

    run_one(&queue, work_dir.path()).await;
    assert_eq!(queue.get(id).await.unwrap().status, Status::Failed);
}

#[tokio::test]
async fn follow_ups_file_is_enqueued() {
    let work_dir = tempfile::tempdir().unwrap();
    let queue = test_queue().await;
    let script = r#"echo '[{"payload": {"step": 2}, "max_attempts": 4}, {"payload": {"step": 3}}]' > followups.json"#;
    let parent = queue.enqueue(NewJob::new(shell(script))).await.unwrap();

    assert_eq!(
        run_one(&queue, work_dir.path()).await,
        Tick::Processed(Some(Finalization::Completed))
    );
    assert_eq!(queue.get(parent).await.unwrap().status, Status::Complete);

    let pending = queue.list_jobs(Some(Status::Pending), 10).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].payload, json!({"step": 2}));
    assert_eq!(pending[0].max_attempts, 4);
    assert_eq!(pending[1].payload, json!({"step": 3}));
    assert_eq!(pending[1].max_attempts, DEFAULT_MAX_ATTEMPTS);
}

#[tokio::test]
async fn malformed_follow_ups_fail_the_attempt() {
    let work_dir = tempfile::tempdir().unwrap();
    let queue = test_queue().await;
    let id = queue
        .enqueue(NewJob::new(shell("echo 'not json' > followups.json")).max_attempts(1))
        .await
        .unwrap();

    run_one(&queue, work_dir.path()).await;
    let job = queue.get(id).await.unwrap();
    assert_eq!(job.status, Status::Failed);
    assert!(job.error.unwrap().contains("followups.json"));
}

#[tokio::test]
async fn aborted_attempt_removes_scratch_dir() {
    let work_dir = tempfile::tempdir().unwrap();
    let queue = test_queue().await;
    let id = queue
        .enqueue(
            NewJob::new(shell("sleep 30"))
                .max_attempts(1)
                .time_limit_seconds(1),
        )
        .await
        .unwrap();

    let config = WorkerConfig {
        abort_on_lease_expiry: true,
        ..WorkerConfig::default()
    };
    let worker = exec_worker_with(&queue, work_dir.path(), config.clone());
    let mut backoff = config.backoff();

    let tick = tokio::time::timeout(Duration::from_secs(10), worker.tick(&mut backoff))
        .await
        .expect("aborted command should not run to completion")
        .unwrap();
    assert_eq!(tick, Tick::Processed(Some(Finalization::Failed)));
    assert!(queue.get(id).await.unwrap().error.unwrap().contains("lease expired"));
    assert_eq!(std::fs::read_dir(work_dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn missing_work_dir_is_created() {
    let root = tempfile::tempdir().unwrap();
    let work_dir = root.path().join("nested").join("jobs");
    let queue = test_queue().await;
    queue.enqueue(NewJob::new(shell("exit 0"))).await.unwrap();

    assert_eq!(
        run_one(&queue, &work_dir).await,
        Tick::Processed(Some(Finalization::Completed))
    );
    assert_eq!(std::fs::read_dir(&work_dir).unwrap().count(), 0);
}
