//! Durable task queue.
//!
//! Tasks move through `pending -> processing -> {complete, failed}`. Every
//! backend implements [`TaskQueue`] with the same contract:
//!
//! - `push` inserts a new pending task and rejects duplicate ids
//! - `pop` atomically claims the oldest pending task
//! - `update` persists a full record and enforces the state machine
//! - `close` is idempotent; every other call on a closed queue fails

pub mod error;
pub mod file;
pub mod memory;
pub mod sqlite;
pub mod task;

mod table;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub use error::{QueueError, Result};
pub use file::FileQueue;
pub use memory::MemoryQueue;
pub use sqlite::SqliteQueue;
pub use task::{new_task_id, QueueStats, Task, TaskStatus, INITIAL_ACTION};

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Insert a new task in `pending` state.
    async fn push(&self, task: Task) -> Result<()>;

    /// Claim one pending task, moving it to `processing`.
    async fn pop(&self) -> Result<Option<Task>>;

    /// Persist the full record of an existing task.
    async fn update(&self, task: &Task) -> Result<()>;

    /// Fetch one task by id.
    async fn get(&self, id: &str) -> Result<Option<Task>>;

    /// All tasks with the given status (or all tasks), oldest first.
    async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>>;

    /// Per-status counts.
    async fn stats(&self) -> Result<QueueStats>;

    /// Release backend resources.
    async fn close(&self) -> Result<()>;
}

/// Shared handle used by the worker and CLI.
pub type SharedQueue = Arc<dyn TaskQueue>;

/// Available queue backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    #[default]
    Sqlite,
    File,
    Memory,
}

/// Open the configured backend. `path` is ignored for `memory`.
pub async fn open_queue(backend: QueueBackend, path: &Path) -> Result<SharedQueue> {
    let queue: SharedQueue = match backend {
        QueueBackend::Sqlite => Arc::new(SqliteQueue::open(path).await?),
        QueueBackend::File => Arc::new(FileQueue::open(path).await?),
        QueueBackend::Memory => Arc::new(MemoryQueue::new()),
    };
    Ok(queue)
}
