//! Append-only log backend.
//!
//! Every state change is written as one JSON line:
//! ```text
//! {"op":"push","task":{...}}
//! {"op":"update","task":{...}}
//! ```
//! Opening the queue replays the log into memory. A torn final line (crash
//! mid-write) is dropped with a warning. Each operation reaches the log
//! before it touches memory, so a failed write leaves both unchanged.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{QueueError, Result};
use crate::memory::open_inner;
use crate::table::TaskTable;
use crate::task::{QueueStats, Task, TaskStatus};
use crate::TaskQueue;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum LogRecord {
    Push { task: Task },
    Update { task: Task },
}

struct Inner {
    table: TaskTable,
    log: File,
    /// Length of the log up to the last complete record.
    len: u64,
    closed: bool,
}

impl Inner {
    async fn append(&mut self, record: &LogRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let written = match self.log.write_all(&line).await {
            Ok(()) => self.log.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            // Cut off any partial line so the next record starts clean
            if let Err(trim) = self.log.set_len(self.len).await {
                warn!("Failed to trim task log after write error: {}", trim);
            }
            return Err(e.into());
        }
        self.len += line.len() as u64;
        Ok(())
    }
}

/// What `open` must do to the log so new records land on a fresh line.
#[derive(Debug, PartialEq, Eq)]
enum Repair {
    None,
    /// Drop a torn final record.
    Truncate(u64),
    /// The final record is whole but lacks its newline.
    TerminateLine,
}

pub struct FileQueue {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl FileQueue {
    /// Open (or create) the log at `path` and replay it.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let (table, repair) = match tokio::fs::read_to_string(&path).await {
            Ok(content) => replay(&path, &content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                (TaskTable::default(), Repair::None)
            }
            Err(e) => return Err(e.into()),
        };

        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        match repair {
            Repair::None => {}
            Repair::Truncate(len) => log.set_len(len).await?,
            Repair::TerminateLine => {
                log.write_all(b"\n").await?;
                log.flush().await?;
            }
        }
        let len = log.metadata().await?.len();

        info!(path = %path.display(), tasks = table.len(), "Task log opened");

        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                table,
                log,
                len,
                closed: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Rebuild the table from log content, along with the fix-up the log needs
/// before anything is appended to it.
fn replay(path: &Path, content: &str) -> Result<(TaskTable, Repair)> {
    let mut table = TaskTable::default();
    let lines: Vec<&str> = content.lines().collect();
    let complete = content.ends_with('\n');

    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: LogRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) if idx + 1 == lines.len() && !complete => {
                warn!("Dropping torn record at end of {}: {}", path.display(), e);
                let valid = content.rfind('\n').map_or(0, |i| i + 1);
                return Ok((table, Repair::Truncate(valid as u64)));
            }
            Err(e) => return Err(e.into()),
        };
        match record {
            LogRecord::Push { task } => table.insert_raw(task),
            LogRecord::Update { task } => table.apply(task),
        }
    }
    let repair = if complete || content.is_empty() {
        Repair::None
    } else {
        Repair::TerminateLine
    };
    Ok((table, repair))
}

#[async_trait]
impl TaskQueue for FileQueue {
    async fn push(&self, task: Task) -> Result<()> {
        let mut inner = open_inner!(self);
        let stored = inner.table.prepare_push(task)?;
        inner
            .append(&LogRecord::Push { task: stored.clone() })
            .await?;
        inner.table.insert_raw(stored);
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Task>> {
        let mut inner = open_inner!(self);
        let Some(task) = inner.table.peek_pop() else {
            return Ok(None);
        };
        inner
            .append(&LogRecord::Update { task: task.clone() })
            .await?;
        inner.table.apply(task.clone());
        Ok(Some(task))
    }

    async fn update(&self, task: &Task) -> Result<()> {
        let mut inner = open_inner!(self);
        let stored = inner.table.prepare_update(task)?;
        inner
            .append(&LogRecord::Update { task: stored.clone() })
            .await?;
        inner.table.apply(stored);
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
        let mut inner = self.inner.lock().await;
        if !inner.closed {
            inner.log.sync_all().await?;
            inner.closed = true;
        }
        Ok(())
    }
}
