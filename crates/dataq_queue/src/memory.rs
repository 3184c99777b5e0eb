//! Non-durable queue backend for tests and one-off runs.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{QueueError, Result};
use crate::table::TaskTable;
use crate::task::{QueueStats, Task, TaskStatus};
use crate::TaskQueue;

#[derive(Default)]
struct Inner {
    table: TaskTable,
    closed: bool,
}

#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

macro_rules! open_inner {
    ($self:ident) => {{
        let guard = $self.inner.lock().await;
        if guard.closed {
            return Err(QueueError::Closed);
        }
        guard
    }};
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn push(&self, task: Task) -> Result<()> {
        let mut inner = open_inner!(self);
        inner.table.push(task)?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Task>> {
        let mut inner = open_inner!(self);
        Ok(inner.table.pop())
    }

    async fn update(&self, task: &Task) -> Result<()> {
        let mut inner = open_inner!(self);
        inner.table.update(task)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>> {
        let inner = open_inner!(self);
        Ok(inner.table.get(id))
    }

    async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let inner = open_inner!(self);
        Ok(inner.table.list(status))
    }

    async fn stats(&self) -> Result<QueueStats> {
        let inner = open_inner!(self);
        Ok(inner.table.stats())
    }

    async fn close(&self) -> Result<()> {
        self.inner.lock().await.closed = true;
        Ok(())
    }
}

pub(crate) use open_inner;
