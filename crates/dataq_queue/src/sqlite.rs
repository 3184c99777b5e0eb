//! SQLite queue backend.
//!
//! Claims are a single conditional `UPDATE ... RETURNING` inside a
//! transaction, so the write lock is taken before the pending row is
//! selected and two poppers can never claim the same task.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{QueueError, Result};
use crate::task::{now, QueueStats, Task, TaskStatus};
use crate::TaskQueue;

const TASK_COLUMNS: &str =
    "id, plugin_id, config, action, content_hash, status, error, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: String,
    plugin_id: String,
    config: String,
    action: Option<String>,
    content_hash: Option<String>,
    status: String,
    error: String,
    created_at: i64,
    updated_at: i64,
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| QueueError::invalid_task(format!("bad timestamp {}", ms)))
}

impl TryFrom<TaskRow> for Task {
    type Error = QueueError;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(Task {
            id: row.id,
            plugin_id: row.plugin_id,
            config: serde_json::from_str(&row.config)?,
            action: row.action.as_deref().map(serde_json::from_str).transpose()?,
            content_hash: row.content_hash,
            status: row.status.parse()?,
            error: row.error,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

pub struct SqliteQueue {
    pool: SqlitePool,
    closed: AtomicBool,
}

impl SqliteQueue {
    /// Open or create a queue database at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let queue = Self::with_pool(pool).await?;
        info!(path = %path.display(), "Task queue opened");
        Ok(queue)
    }

    /// In-memory database. A single connection, since each SQLite memory
    /// connection is its own database.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        let queue = Self {
            pool,
            closed: AtomicBool::new(false),
        };
        queue.ensure_schema().await?;
        Ok(queue)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS tasks (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                plugin_id TEXT NOT NULL,
                config TEXT NOT NULL,
                action TEXT,
                content_hash TEXT,
                status TEXT NOT NULL,
                error TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, seq)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    async fn current_status(&self, id: &str) -> Result<Option<TaskStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        status.map(|s| s.parse()).transpose()
    }
}

#[async_trait]
impl TaskQueue for SqliteQueue {
    async fn push(&self, task: Task) -> Result<()> {
        self.check_open()?;
        task.validate()?;

        let config = serde_json::to_string(&task.config)?;
        let action = task.action.as_ref().map(serde_json::to_string).transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO tasks (id, plugin_id, config, action, content_hash, status, error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.plugin_id)
        .bind(&config)
        .bind(&action)
        .bind(&task.content_hash)
        .bind(TaskStatus::Pending.as_str())
        .bind(&task.error)
        .bind(task.created_at.timestamp_millis())
        .bind(now().timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!("[task {}] Queued for plugin {}", task.id, task.plugin_id);
                Ok(())
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(QueueError::Duplicate(task.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically claim the oldest pending task.
    async fn pop(&self) -> Result<Option<Task>> {
        self.check_open()?;
        let mut tx = self.pool.begin().await?;

        let row: Option<TaskRow> = sqlx::query_as(&format!(
            r#"
            UPDATE tasks
            SET status = 'processing',
                updated_at = ?
            WHERE seq = (
                SELECT seq FROM tasks
                WHERE status = 'pending'
                ORDER BY seq ASC
                LIMIT 1
            ) AND status = 'pending'
            RETURNING {}
            "#,
            TASK_COLUMNS
        ))
        .bind(now().timestamp_millis())
        .fetch_optional(&mut *tx)
        .await?;

        // An undecodable row rolls back with the dropped transaction
        let Some(task) = row.map(Task::try_from).transpose()? else {
            tx.commit().await?;
            return Ok(None);
        };
        tx.commit().await?;
        debug!("[task {}] Claimed for plugin {}", task.id, task.plugin_id);
        Ok(Some(task))
    }

    async fn update(&self, task: &Task) -> Result<()> {
        self.check_open()?;

        let config = serde_json::to_string(&task.config)?;
        let action = task.action.as_ref().map(serde_json::to_string).transpose()?;
        let allowed = task.status.allowed_predecessors();
        let placeholders = vec!["?"; allowed.len()].join(", ");

        let sql = format!(
            r#"
            UPDATE tasks
            SET plugin_id = ?,
                config = ?,
                action = ?,
                content_hash = ?,
                status = ?,
                error = ?,
                updated_at = ?
            WHERE id = ? AND status IN ({})
            "#,
            placeholders
        );
        let mut query = sqlx::query(&sql)
            .bind(&task.plugin_id)
            .bind(&config)
            .bind(&action)
            .bind(&task.content_hash)
            .bind(task.status.as_str())
            .bind(&task.error)
            .bind(now().timestamp_millis())
            .bind(&task.id);
        for status in allowed {
            query = query.bind(status.as_str());
        }

        let rows_affected = query.execute(&self.pool).await?.rows_affected();
        if rows_affected > 0 {
            return Ok(());
        }

        // Nothing matched: either the id is unknown or the transition is not allowed
        match self.current_status(&task.id).await? {
            None => Err(QueueError::NotFound(task.id.clone())),
            Some(from) => Err(QueueError::InvalidTransition {
                id: task.id.clone(),
                from,
                to: task.status,
            }),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Task>> {
        self.check_open()?;
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Task::try_from).transpose()
    }

    async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        self.check_open()?;
        let rows: Vec<TaskRow> = match status {
            Some(status) => {
                sqlx::query_as(&format!(
                    "SELECT {} FROM tasks WHERE status = ? ORDER BY seq ASC",
                    TASK_COLUMNS
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!("SELECT {} FROM tasks ORDER BY seq ASC", TASK_COLUMNS))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn stats(&self) -> Result<QueueStats> {
        self.check_open()?;
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            stats.add(status.parse()?, count.max(0) as u64);
        }
        Ok(stats)
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.pool.close().await;
            info!("Task queue closed");
        }
        Ok(())
    }
}
