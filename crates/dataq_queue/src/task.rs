//! Task model and status state machine.

use chrono::{DateTime, SubsecRound, Utc};
use dataq_protocol::{encode_id, Action, Config};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{QueueError, Result};

/// Action name used for operator-seeded tasks
pub const INITIAL_ACTION: &str = "initial";

/// Task lifecycle: `pending -> processing -> {complete, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Complete,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }

    /// Statuses a task may be in before moving to `self`.
    ///
    /// Non-terminal tasks may be rewritten without changing status.
    pub fn allowed_predecessors(&self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Pending => &[TaskStatus::Pending],
            TaskStatus::Processing => &[TaskStatus::Pending, TaskStatus::Processing],
            TaskStatus::Complete | TaskStatus::Failed => &[TaskStatus::Processing],
        }
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        next.allowed_predecessors().contains(self)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "complete" => Ok(TaskStatus::Complete),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(QueueError::invalid_task(format!("unknown status '{}'", other))),
        }
    }
}

/// Generate a new task id (URL-safe base64 of a random UUID).
pub fn new_task_id() -> String {
    encode_id(uuid::Uuid::new_v4().as_bytes())
}

/// Current time at the millisecond precision every backend can store.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// A unit of work.
///
/// Exactly one of `action` (extract) and `content_hash` (transform) is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub plugin_id: String,
    #[serde(default)]
    pub config: Config,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    fn new(
        plugin_id: impl Into<String>,
        config: Config,
        action: Option<Action>,
        content_hash: Option<String>,
    ) -> Self {
        let ts = now();
        Self {
            id: new_task_id(),
            plugin_id: plugin_id.into(),
            config,
            action,
            content_hash,
            status: TaskStatus::Pending,
            error: String::new(),
            created_at: ts,
            updated_at: ts,
        }
    }

    /// A task asking `plugin_id` to run `action`.
    pub fn extract(plugin_id: impl Into<String>, config: Config, action: Action) -> Self {
        Self::new(plugin_id, config, Some(action), None)
    }

    /// A task asking `plugin_id` to transform stored content.
    pub fn transform(
        plugin_id: impl Into<String>,
        config: Config,
        content_hash: impl Into<String>,
    ) -> Self {
        Self::new(plugin_id, config, None, Some(content_hash.into()))
    }

    /// The seed task for a plugin.
    pub fn initial(plugin_id: impl Into<String>, config: Config) -> Self {
        Self::extract(plugin_id, config, Action::new(INITIAL_ACTION))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn is_transform(&self) -> bool {
        self.content_hash.is_some()
    }

    /// Check the fields every backend requires before insert.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(QueueError::invalid_task("empty task id"));
        }
        if self.plugin_id.is_empty() {
            return Err(QueueError::invalid_task(format!("task {} has no plugin id", self.id)));
        }
        match (&self.action, &self.content_hash) {
            (Some(_), Some(_)) => Err(QueueError::invalid_task(format!(
                "task {} has both action and content_hash",
                self.id
            ))),
            (None, None) => Err(QueueError::invalid_task(format!(
                "task {} has neither action nor content_hash",
                self.id
            ))),
            _ => Ok(()),
        }
    }

    /// Check that moving from `current` to this task's status is allowed.
    pub fn check_transition(&self, current: TaskStatus) -> Result<()> {
        if current.can_transition_to(self.status) {
            Ok(())
        } else {
            Err(QueueError::InvalidTransition {
                id: self.id.clone(),
                from: current,
                to: self.status,
            })
        }
    }

    pub fn mark_processing(&mut self) {
        self.status = TaskStatus::Processing;
        self.updated_at = now();
    }

    pub fn mark_complete(&mut self) {
        self.status = TaskStatus::Complete;
        self.error.clear();
        self.updated_at = now();
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error = error.into();
        self.updated_at = now();
    }
}

/// Per-status task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub complete: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn add(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::Processing => self.processing += count,
            TaskStatus::Complete => self.complete += count,
            TaskStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.complete + self.failed
    }
}
