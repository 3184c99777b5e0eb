//! In-memory task table shared by the memory and append-log backends.

use std::collections::{HashMap, VecDeque};

use crate::error::{QueueError, Result};
use crate::task::{now, QueueStats, Task, TaskStatus};

#[derive(Debug, Default)]
pub(crate) struct TaskTable {
    tasks: HashMap<String, Task>,
    /// Insertion order, for `list`
    order: Vec<String>,
    /// Ids pushed as pending, oldest first. May hold ids that have since left
    /// `pending`; `pop` skips those.
    pending: VecDeque<String>,
}

impl TaskTable {
    /// Insert a new task as pending. Returns the stored record.
    pub fn push(&mut self, task: Task) -> Result<Task> {
        let stored = self.prepare_push(task)?;
        self.insert_raw(stored.clone());
        Ok(stored)
    }

    /// Claim the oldest pending task.
    pub fn pop(&mut self) -> Option<Task> {
        let claimed = self.peek_pop()?;
        self.apply(claimed.clone());
        Some(claimed)
    }

    /// Replace an existing record, enforcing the state machine. Returns the stored record.
    pub fn update(&mut self, task: &Task) -> Result<Task> {
        let stored = self.prepare_update(task)?;
        self.apply(stored.clone());
        Ok(stored)
    }

    // The prepare/peek half of each operation leaves the table untouched, so
    // a durable backend can persist the record first and `apply` it after.

    /// Check a push and build the record to store.
    pub fn prepare_push(&self, mut task: Task) -> Result<Task> {
        task.validate()?;
        if self.tasks.contains_key(&task.id) {
            return Err(QueueError::Duplicate(task.id));
        }
        task.status = TaskStatus::Pending;
        task.updated_at = now();
        Ok(task)
    }

    /// The oldest pending task, already marked processing but not yet claimed.
    pub fn peek_pop(&mut self) -> Option<Task> {
        while let Some(id) = self.pending.front() {
            match self.tasks.get(id) {
                Some(task) if task.status == TaskStatus::Pending => {
                    let mut claimed = task.clone();
                    claimed.mark_processing();
                    return Some(claimed);
                }
                // Left pending through `update`
                _ => {
                    self.pending.pop_front();
                }
            }
        }
        None
    }

    /// Check an update against the state machine and build the record to store.
    pub fn prepare_update(&self, task: &Task) -> Result<Task> {
        let current = self
            .tasks
            .get(&task.id)
            .ok_or_else(|| QueueError::NotFound(task.id.clone()))?;
        task.check_transition(current.status)?;

        let mut stored = task.clone();
        stored.created_at = current.created_at;
        stored.updated_at = now();
        Ok(stored)
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.tasks.get(id).cloned()
    }

    pub fn list(&self, status: Option<TaskStatus>) -> Vec<Task> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|task| status.map_or(true, |s| task.status == s))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for task in self.tasks.values() {
            stats.add(task.status, 1);
        }
        stats
    }

    /// Insert without checks. Used when replaying a log.
    pub fn insert_raw(&mut self, task: Task) {
        if task.status == TaskStatus::Pending {
            self.pending.push_back(task.id.clone());
        }
        if !self.tasks.contains_key(&task.id) {
            self.order.push(task.id.clone());
        }
        self.tasks.insert(task.id.clone(), task);
    }

    /// Overwrite (or insert) a record without checks.
    pub fn apply(&mut self, task: Task) {
        match self.tasks.get_mut(&task.id) {
            Some(current) => *current = task,
            None => self.insert_raw(task),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}
