//! Worker
//!
//! Three stages connected by channels:
//! - dequeue loop: pops pending tasks while an in-flight slot is free
//! - dispatch loop: routes each task to its plugin's session, or fails it
//! - sessions: one per enabled plugin (see [`crate::session`])
//!
//! An in-flight slot is a semaphore permit carried with the task until its
//! final status is written. All slots free plus an empty queue means the
//! extraction graph is exhausted, which is how `run_until_idle` stops.

use dataq_cas::{CasError, ContentHash, SharedStore};
use dataq_protocol::Config;
use dataq_queue::{QueueError, SharedQueue, Task, TaskStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{DataqConfig, PluginConfig};
use crate::error::{Result, WorkerError};
use crate::events::EventSink;
use crate::runner::{spawn_runner, RunnerSpec};
use crate::session::{fail_unsent, Session, SessionContext, Tracked};

pub struct Worker {
    config: DataqConfig,
    queue: SharedQueue,
    cas: SharedStore,
    events: EventSink,
}

/// Running sessions plus the reason each missing enabled plugin is unavailable.
struct Sessions {
    running: HashMap<String, Session>,
    unavailable: HashMap<String, String>,
}

impl Sessions {
    async fn shutdown(self) {
        let handles: Vec<_> = self
            .running
            .into_values()
            .map(|session| tokio::spawn(session.shutdown()))
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Worker {
    pub fn new(config: DataqConfig, queue: SharedQueue, cas: SharedStore) -> Self {
        Self {
            config,
            queue,
            cas,
            events: EventSink::disabled(),
        }
    }

    /// Report events to `events` as well as to the log.
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &DataqConfig {
        &self.config
    }

    pub fn queue(&self) -> &SharedQueue {
        &self.queue
    }

    pub fn cas(&self) -> &SharedStore {
        &self.cas
    }

    // ========================================================================
    // Run modes
    // ========================================================================

    /// Process tasks until `cancel` fires. Outstanding requests are allowed
    /// to finish before this returns.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.run_loop(cancel, false).await
    }

    /// Process tasks until the queue has no pending task and nothing is in flight.
    pub async fn run_until_idle(&self) -> Result<()> {
        self.drain(CancellationToken::new()).await
    }

    /// Like [`Worker::run_until_idle`], but also stops early when `cancel` fires.
    pub async fn drain(&self, cancel: CancellationToken) -> Result<()> {
        self.run_loop(cancel, true).await
    }

    /// Pop exactly one task, run it through its plugin and return its final record.
    pub async fn process_single_task(&self) -> Result<Option<Task>> {
        let Some(task) = self.queue.pop().await? else {
            return Ok(None);
        };
        let task_id = task.id.clone();
        info!("[task {}] Single-task run for plugin {}", task_id, task.plugin_id);

        let ctx = self.context();
        let sessions = self.start_sessions(
            &ctx,
            self.config
                .enabled_plugins()
                .filter(|p| p.id == task.plugin_id),
        );
        route(
            Tracked { task, permit: None },
            &sessions,
            &self.config,
            &ctx,
        )
        .await;
        // Closing the session right away lets the plugin exit after this one request
        sessions.shutdown().await;

        Ok(self.queue.get(&task_id).await?)
    }

    async fn run_loop(&self, cancel: CancellationToken, until_idle: bool) -> Result<()> {
        let ctx = self.context();
        let sessions = self.start_sessions(&ctx, self.config.enabled_plugins());
        info!(
            "Worker started: {} plugin session(s), until_idle={}",
            sessions.running.len(),
            until_idle
        );

        let slots = Arc::new(Semaphore::new(self.config.max_in_flight));
        let (task_tx, mut task_rx) = mpsc::channel(self.config.task_buffer);
        let dequeue = tokio::spawn(
            DequeueLoop {
                queue: self.queue.clone(),
                events: self.events.clone(),
                slots,
                max_in_flight: self.config.max_in_flight,
                tasks: task_tx,
                cancel,
                poll_interval: self.config.poll_interval(),
                until_idle,
            }
            .run(),
        );

        // Dispatch until the dequeue loop stops and its channel drains
        while let Some(tracked) = task_rx.recv().await {
            route(tracked, &sessions, &self.config, &ctx).await;
        }

        let result = dequeue.await;
        sessions.shutdown().await;
        info!("Worker stopped");
        result?
    }

    // ========================================================================
    // Queue maintenance
    // ========================================================================

    /// Push the initial task for one plugin, or for every enabled plugin.
    pub async fn seed(&self, plugin_id: Option<&str>) -> Result<Vec<Task>> {
        let plugins: Vec<&PluginConfig> = match plugin_id {
            Some(id) => vec![self
                .config
                .plugin(id)
                .ok_or_else(|| WorkerError::UnknownPlugin(id.to_string()))?],
            None => self.config.enabled_plugins().collect(),
        };

        let mut seeded = Vec::new();
        for plugin in plugins {
            let task = Task::initial(&plugin.id, plugin.config.clone());
            self.queue.push(task.clone()).await?;
            self.events.info(format!(
                "[task {}] seeded for plugin {}",
                task.id, plugin.id
            ));
            seeded.push(task);
        }
        Ok(seeded)
    }

    /// Queue a transform of stored content by `plugin_id`.
    pub async fn submit_transform(&self, plugin_id: &str, hash: &str) -> Result<Task> {
        let plugin = self
            .config
            .plugin(plugin_id)
            .ok_or_else(|| WorkerError::UnknownPlugin(plugin_id.to_string()))?;
        let hash = ContentHash::parse(hash)?;
        if !self.cas.contains(hash.as_str()).await? {
            return Err(CasError::NotFound(hash.to_string()).into());
        }

        let task = Task::transform(&plugin.id, plugin.config.clone(), hash.to_string());
        self.queue.push(task.clone()).await?;
        self.events.info(format!(
            "[task {}] transform of {} queued for plugin {}",
            task.id, hash, plugin.id
        ));
        Ok(task)
    }

    /// Fail every `processing` task left behind by a worker that died.
    ///
    /// Only safe while no worker is running against this queue.
    pub async fn recover_orphaned(&self) -> Result<Vec<String>> {
        let orphans = self.queue.list(Some(TaskStatus::Processing)).await?;
        let mut recovered = Vec::with_capacity(orphans.len());
        for mut task in orphans {
            task.mark_failed("orphaned: worker stopped while the task was processing");
            self.queue.update(&task).await?;
            self.events
                .error(format!("[task {}] failed: orphaned in processing", task.id));
            recovered.push(task.id);
        }
        Ok(recovered)
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    fn context(&self) -> SessionContext {
        let plugin_configs: HashMap<String, Config> = self
            .config
            .plugins
            .iter()
            .map(|p| (p.id.clone(), p.config.clone()))
            .collect();
        SessionContext {
            queue: self.queue.clone(),
            cas: self.cas.clone(),
            events: self.events.clone(),
            plugin_configs: Arc::new(plugin_configs),
        }
    }

    fn start_sessions<'a>(
        &self,
        ctx: &SessionContext,
        plugins: impl Iterator<Item = &'a PluginConfig>,
    ) -> Sessions {
        let mut sessions = Sessions {
            running: HashMap::new(),
            unavailable: HashMap::new(),
        };
        for plugin in plugins {
            let spec = RunnerSpec {
                plugin_id: plugin.id.clone(),
                binary: self.config.resolve_binary(plugin),
                work_dir: self.config.plugin_work_dir(&plugin.id),
                request_buffer: self.config.request_buffer,
            };
            match spawn_runner(spec) {
                Ok(runner) => {
                    let session = Session::start(plugin, runner, ctx.clone());
                    sessions.running.insert(plugin.id.clone(), session);
                }
                Err(e) => {
                    self.events.error(format!("[plugin {}] {}", plugin.id, e));
                    sessions.unavailable.insert(plugin.id.clone(), e.to_string());
                }
            }
        }
        sessions
    }
}

/// Hand a task to its plugin's session, or fail it if that is impossible.
async fn route(
    tracked: Tracked,
    sessions: &Sessions,
    config: &DataqConfig,
    ctx: &SessionContext,
) {
    if let Err(e) = tracked.task.validate() {
        fail_unsent(ctx, tracked, format!("malformed task: {}", e)).await;
        return;
    }

    let plugin_id = tracked.task.plugin_id.clone();
    if let Some(session) = sessions.running.get(&plugin_id) {
        if let Err(mpsc::error::SendError(tracked)) = session.inbox.send(tracked) {
            let reason = format!("plugin {} session closed", plugin_id);
            fail_unsent(ctx, tracked, reason).await;
        }
        return;
    }

    let reason = match config.plugin(&plugin_id) {
        None => format!("unknown plugin '{}'", plugin_id),
        Some(plugin) if !plugin.enabled => format!("plugin '{}' is disabled", plugin_id),
        Some(_) => sessions
            .unavailable
            .get(&plugin_id)
            .cloned()
            .unwrap_or_else(|| format!("plugin '{}' is not running", plugin_id)),
    };
    fail_unsent(ctx, tracked, reason).await;
}

// ============================================================================
// Dequeue loop
// ============================================================================

struct DequeueLoop {
    queue: SharedQueue,
    events: EventSink,
    slots: Arc<Semaphore>,
    max_in_flight: usize,
    tasks: mpsc::Sender<Tracked>,
    cancel: CancellationToken,
    poll_interval: Duration,
    until_idle: bool,
}

impl DequeueLoop {
    async fn run(self) -> Result<()> {
        loop {
            // Checked before popping: with every slot free nothing can push
            // follow-up work between this check and an empty pop
            let idle_candidate =
                self.until_idle && self.slots.available_permits() == self.max_in_flight;

            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.queue.pop().await {
                Ok(Some(task)) => {
                    debug!("[task {}] Dequeued for plugin {}", task.id, task.plugin_id);
                    let tracked = Tracked {
                        task,
                        permit: Some(permit),
                    };
                    if self.tasks.send(tracked).await.is_err() {
                        break;
                    }
                    continue;
                }
                Ok(None) => {
                    drop(permit);
                    if idle_candidate {
                        info!("Queue drained, nothing in flight");
                        break;
                    }
                }
                Err(QueueError::Closed) => return Err(QueueError::Closed.into()),
                Err(e) => {
                    drop(permit);
                    self.events.error(format!("queue pop failed: {}", e));
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        debug!("Dequeue loop stopped");
        Ok(())
    }
}
