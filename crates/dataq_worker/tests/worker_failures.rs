//! Worker behaviour with misbehaving or missing plugins.
#![cfg(unix)]

use dataq_cas::{MemoryStore, SharedStore};
use dataq_protocol::{Action, Config};
use dataq_queue::{MemoryQueue, SharedQueue, Task, TaskStatus};
use dataq_worker::{event_channel, DataqConfig, EventKind, PluginConfig, Worker};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn plugin(id: &str, binary: PathBuf) -> PluginConfig {
    PluginConfig {
        id: id.to_string(),
        name: id.to_string(),
        binary_path: binary,
        config: Config::new(),
        enabled: true,
    }
}

fn worker(tmp: &TempDir, plugins: Vec<PluginConfig>) -> (Worker, SharedQueue) {
    let config = DataqConfig {
        plugins,
        state_dir: Some(tmp.path().join("state")),
        poll_interval_ms: 10,
        ..DataqConfig::default()
    };
    let queue: SharedQueue = Arc::new(MemoryQueue::new());
    let cas: SharedStore = Arc::new(MemoryStore::new());
    (Worker::new(config, queue.clone(), cas), queue)
}

fn scan(plugin_id: &str, id: &str) -> Task {
    Task::extract(plugin_id, Config::new(), Action::new("scan")).with_id(id)
}

async fn run_idle(worker: &Worker) {
    tokio::time::timeout(Duration::from_secs(20), worker.run_until_idle())
        .await
        .expect("worker did not go idle")
        .unwrap();
}

#[tokio::test]
async fn test_nonzero_exit_fails_task_and_closes_session() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let binary = script(tmp.path(), "crash.sh", "exit 1");
    let (worker, queue) = worker(&tmp, vec![plugin("crashy", binary)]);
    let (events, mut stream) = event_channel();
    let worker = worker.with_events(events);

    queue.push(scan("crashy", "t1")).await?;
    queue.push(scan("crashy", "t2")).await?;
    run_idle(&worker).await;

    for id in ["t1", "t2"] {
        let task = queue.get(id).await?.expect("task");
        assert_eq!(task.status, TaskStatus::Failed, "{}", id);
        assert!(!task.error.is_empty());
    }

    let mut saw_error = false;
    while let Ok(event) = stream.try_recv() {
        saw_error |= event.kind == EventKind::Error;
    }
    assert!(saw_error);
    Ok(())
}

#[tokio::test]
async fn test_unknown_and_disabled_plugins_fail_immediately() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let mut disabled = plugin("off", script(tmp.path(), "off.sh", "exit 0"));
    disabled.enabled = false;
    let (worker, queue) = worker(&tmp, vec![disabled]);

    queue.push(scan("nobody", "t-unknown")).await?;
    queue.push(scan("off", "t-off")).await?;
    run_idle(&worker).await;

    let unknown = queue.get("t-unknown").await?.expect("task");
    assert_eq!(unknown.status, TaskStatus::Failed);
    assert!(unknown.error.contains("unknown plugin"), "{}", unknown.error);

    let off = queue.get("t-off").await?.expect("task");
    assert_eq!(off.status, TaskStatus::Failed);
    assert!(off.error.contains("disabled"), "{}", off.error);
    Ok(())
}

#[tokio::test]
async fn test_missing_binary_fails_its_tasks() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let (worker, queue) = worker(&tmp, vec![plugin("ghost", tmp.path().join("missing"))]);

    queue.push(scan("ghost", "t1")).await?;
    run_idle(&worker).await;

    let task = queue.get("t1").await?.expect("task");
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.contains("spawn"), "{}", task.error);
    Ok(())
}

#[tokio::test]
async fn test_single_task_mode() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let binary = script(tmp.path(), "crash.sh", "echo dying >&2; exit 2");
    let (worker, queue) = worker(&tmp, vec![plugin("crashy", binary)]);

    assert!(worker.process_single_task().await?.is_none());

    queue.push(scan("crashy", "first")).await?;
    queue.push(scan("crashy", "second")).await?;
    let task = worker.process_single_task().await?.expect("one task");
    assert_eq!(task.id, "first");
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.contains("session closed"), "{}", task.error);

    // Only one task was consumed
    assert_eq!(queue.get("second").await?.expect("task").status, TaskStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn test_recover_orphaned() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let (worker, queue) = worker(&tmp, vec![]);

    queue.push(scan("fs", "stuck")).await?;
    queue.push(scan("fs", "waiting")).await?;
    queue.pop().await?;

    let recovered = worker.recover_orphaned().await?;
    assert_eq!(recovered, vec!["stuck".to_string()]);
    assert_eq!(queue.get("stuck").await?.expect("task").status, TaskStatus::Failed);
    assert_eq!(queue.get("waiting").await?.expect("task").status, TaskStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn test_seed_and_submit_transform() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let mut fs = plugin("fs", tmp.path().join("unused"));
    fs.config.insert("root".into(), "/data".into());
    let (worker, queue) = worker(&tmp, vec![fs]);

    let seeded = worker.seed(None).await?;
    assert_eq!(seeded.len(), 1);
    let stored = queue.get(&seeded[0].id).await?.expect("task");
    assert_eq!(stored.action.expect("action").name, "initial");
    assert_eq!(stored.config.get("root").map(String::as_str), Some("/data"));

    assert!(worker.seed(Some("nope")).await.is_err());

    let hash = worker.cas().store(b"{}").await?;
    let task = worker.submit_transform("fs", hash.as_str()).await?;
    assert_eq!(task.content_hash.as_deref(), Some(hash.as_str()));

    let missing = dataq_protocol::ContentHash::of(b"missing");
    assert!(worker.submit_transform("fs", missing.as_str()).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_run_stops_on_cancel() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let (worker, _queue) = worker(&tmp, vec![]);
    let cancel = tokio_util::sync::CancellationToken::new();

    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stopper.cancel();
    });
    tokio::time::timeout(Duration::from_secs(5), worker.run(cancel)).await??;
    Ok(())
}
