//! Per-plugin session.
//!
//! A session pairs one [`RunnerHandle`] with two tasks:
//! - the feeder turns dispatched tasks into requests. It registers each task
//!   with the response loop before sending its request, so no response can
//!   arrive for an unknown id.
//! - the response loop owns the `request id -> task` map and applies each
//!   response to the queue and the CAS.
//!
//! Once a task is registered the response loop alone decides its outcome.
//! When the plugin's stream closes, every registered task still outstanding is
//! failed, and later registrations are refused.

use dataq_cas::SharedStore;
use dataq_protocol::{
    decode_message, encode_message, Action, Config, DataItem, PluginRequest, PluginResponse,
    ResponsePayload,
};
use dataq_queue::{new_task_id, SharedQueue, Task};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::PluginConfig;
use crate::events::EventSink;
use crate::runner::RunnerHandle;

/// A popped task plus its in-flight slot. Dropping it frees the slot.
pub(crate) struct Tracked {
    pub task: Task,
    pub permit: Option<OwnedSemaphorePermit>,
}

/// Shared handles every session uses
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub queue: SharedQueue,
    pub cas: SharedStore,
    pub events: EventSink,
    /// Static config of every configured plugin, for follow-up tasks
    pub plugin_configs: Arc<HashMap<String, Config>>,
}

/// Sending side of a running session.
pub(crate) struct Session {
    pub plugin_id: String,
    pub inbox: mpsc::UnboundedSender<Tracked>,
    pub feeder: JoinHandle<()>,
    pub responses: JoinHandle<()>,
    pub supervisor: JoinHandle<()>,
}

impl Session {
    pub fn start(plugin: &PluginConfig, runner: RunnerHandle, ctx: SessionContext) -> Self {
        let RunnerHandle {
            plugin_id,
            requests,
            responses,
            supervisor,
        } = runner;

        let configure_id = format!("configure-{}", new_task_id());
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (register_tx, register_rx) = mpsc::unbounded_channel();

        let feeder = tokio::spawn(
            Feeder {
                plugin_id: plugin_id.clone(),
                config: plugin.config.clone(),
                configure_id: configure_id.clone(),
                requests,
                register: register_tx,
                ctx: ctx.clone(),
            }
            .run(inbox_rx),
        );

        let responses = tokio::spawn(
            ResponseLoop {
                plugin_id: plugin_id.clone(),
                configure_id,
                pending: HashMap::new(),
                register: register_rx,
                last_error: None,
                ctx,
            }
            .run(responses),
        );

        Self {
            plugin_id,
            inbox: inbox_tx,
            feeder,
            responses,
            supervisor,
        }
    }

    /// Stop accepting work and wait for the plugin to wind down.
    pub async fn shutdown(self) {
        drop(self.inbox);
        let _ = self.feeder.await;
        let _ = self.responses.await;
        let _ = self.supervisor.await;
        debug!("[plugin {}] Session finished", self.plugin_id);
    }
}

/// Mark a task that was never handed to a plugin as failed.
pub(crate) async fn fail_unsent(ctx: &SessionContext, tracked: Tracked, reason: String) {
    let Tracked { mut task, permit } = tracked;
    ctx.events
        .error(format!("[task {}] failed: {}", task.id, reason));
    task.mark_failed(reason);
    if let Err(e) = ctx.queue.update(&task).await {
        ctx.events
            .error(format!("[task {}] failed to record failure: {}", task.id, e));
    }
    drop(permit);
}

// ============================================================================
// Feeder
// ============================================================================

struct Feeder {
    plugin_id: String,
    config: Config,
    configure_id: String,
    requests: mpsc::Sender<PluginRequest>,
    register: mpsc::UnboundedSender<Tracked>,
    ctx: SessionContext,
}

impl Feeder {
    async fn run(self, mut inbox: mpsc::UnboundedReceiver<Tracked>) {
        let configure =
            PluginRequest::configure(&self.configure_id, &self.plugin_id, self.config.clone());
        let mut alive = self.requests.send(configure).await.is_ok();

        while let Some(tracked) = inbox.recv().await {
            if !alive {
                let reason = format!("plugin {} session closed", self.plugin_id);
                fail_unsent(&self.ctx, tracked, reason).await;
                continue;
            }

            let request = match self.build_request(&tracked.task).await {
                Ok(request) => request,
                Err(reason) => {
                    fail_unsent(&self.ctx, tracked, reason).await;
                    continue;
                }
            };

            let task_id = tracked.task.id.clone();
            if let Err(mpsc::error::SendError(tracked)) = self.register.send(tracked) {
                alive = false;
                let reason = format!("plugin {} session closed", self.plugin_id);
                fail_unsent(&self.ctx, tracked, reason).await;
                continue;
            }

            // Blocks while this plugin is busy; other plugins are unaffected
            if self.requests.send(request).await.is_err() {
                // Registered already: the response loop fails it when the stream closes
                alive = false;
                debug!(
                    "[plugin {}] Request channel closed before task {} was sent",
                    self.plugin_id, task_id
                );
                continue;
            }
            self.ctx.events.info(format!(
                "[task {}] dispatched to plugin {}",
                task_id, self.plugin_id
            ));
        }
        // Dropping `requests` closes the plugin's stdin
    }

    async fn build_request(&self, task: &Task) -> std::result::Result<PluginRequest, String> {
        let mut request = match (&task.action, &task.content_hash) {
            (Some(_), Some(_)) => {
                return Err("malformed task: both action and content_hash are set".to_string())
            }
            (None, None) => {
                return Err("malformed task: neither action nor content_hash is set".to_string())
            }
            (Some(action), None) => PluginRequest::extract(&task.id, &task.plugin_id, action.clone()),
            (None, Some(hash)) => {
                let raw = self
                    .ctx
                    .cas
                    .retrieve(hash)
                    .await
                    .map_err(|e| format!("failed to load {} from CAS: {}", hash, e))?;
                let item: DataItem = decode_message(&raw)
                    .map_err(|e| format!("content {} is not a data item: {}", hash, e))?;
                PluginRequest::transform(&task.id, &task.plugin_id, item)
            }
        };
        request.config = task.config.clone();
        Ok(request)
    }
}

// ============================================================================
// Response loop
// ============================================================================

struct ResponseLoop {
    plugin_id: String,
    configure_id: String,
    pending: HashMap<String, Tracked>,
    register: mpsc::UnboundedReceiver<Tracked>,
    last_error: Option<String>,
    ctx: SessionContext,
}

impl ResponseLoop {
    async fn run(mut self, mut responses: mpsc::Receiver<PluginResponse>) {
        loop {
            let Some(response) = responses.recv().await else {
                // The runner always ends with `closed`; treat a lost channel the same way
                break;
            };
            self.drain_registrations();
            if response.plugin_id != self.plugin_id {
                debug!(
                    "[plugin {}] Response labelled with plugin id '{}'",
                    self.plugin_id, response.plugin_id
                );
            }

            match response.payload {
                ResponsePayload::Error { message } => {
                    self.on_error(&response.request_id, message).await
                }
                ResponsePayload::Item { item } => self.on_item(&response.request_id, item).await,
                ResponsePayload::Action { action } => {
                    self.on_action(&response.request_id, action).await
                }
                ResponsePayload::Done => self.on_done(&response.request_id).await,
                ResponsePayload::Closed => break,
            }
        }
        self.on_closed().await;
    }

    fn drain_registrations(&mut self) {
        while let Ok(tracked) = self.register.try_recv() {
            self.pending.insert(tracked.task.id.clone(), tracked);
        }
    }

    fn unknown(&self, request_id: &str, what: &str) {
        debug!(
            "[plugin {}] Dropping {} for unknown or finished request '{}'",
            self.plugin_id, what, request_id
        );
    }

    async fn on_error(&mut self, request_id: &str, message: String) {
        if request_id.is_empty() {
            self.ctx
                .events
                .error(format!("[plugin {}] {}", self.plugin_id, message));
            self.last_error = Some(message);
            return;
        }
        if request_id == self.configure_id {
            self.ctx.events.error(format!(
                "[plugin {}] configure failed: {}",
                self.plugin_id, message
            ));
            self.last_error = Some(message);
            return;
        }
        match self.pending.remove(request_id) {
            Some(tracked) => self.finish(tracked, Some(message)).await,
            None => self.unknown(request_id, "error"),
        }
    }

    async fn on_item(&mut self, request_id: &str, item: DataItem) {
        if !self.pending.contains_key(request_id) {
            self.unknown(request_id, "item");
            return;
        }

        let stored = match encode_message(&item) {
            Ok(body) => self.ctx.cas.store(&body).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match stored {
            Ok(key) => self.ctx.events.info(format!(
                "[task {}] item kind={} source={} hash={} stored as {}",
                request_id, item.kind, item.source_id, item.hash, key
            )),
            Err(e) => {
                if let Some(tracked) = self.pending.remove(request_id) {
                    self.finish(tracked, Some(format!("failed to store item: {}", e)))
                        .await;
                }
            }
        }
    }

    async fn on_action(&mut self, request_id: &str, action: Action) {
        if !self.pending.contains_key(request_id) {
            self.unknown(request_id, "action");
            return;
        }

        let target = action
            .plugin_id
            .clone()
            .unwrap_or_else(|| self.plugin_id.clone());
        let config = self
            .ctx
            .plugin_configs
            .get(&target)
            .cloned()
            .unwrap_or_default();
        let action_name = action.name.clone();
        let child = Task::extract(target.clone(), config, action);
        let child_id = child.id.clone();

        match self.ctx.queue.push(child).await {
            Ok(()) => self.ctx.events.info(format!(
                "[task {}] queued task {} for plugin {} (action {})",
                request_id, child_id, target, action_name
            )),
            Err(e) => {
                if let Some(tracked) = self.pending.remove(request_id) {
                    self.finish(tracked, Some(format!("failed to queue follow-up action: {}", e)))
                        .await;
                }
            }
        }
    }

    async fn on_done(&mut self, request_id: &str) {
        if request_id == self.configure_id {
            self.ctx
                .events
                .info(format!("[plugin {}] configured", self.plugin_id));
            return;
        }
        match self.pending.remove(request_id) {
            Some(tracked) => self.finish(tracked, None).await,
            None => self.unknown(request_id, "done"),
        }
    }

    async fn on_closed(&mut self) {
        // Refuse new registrations, then collect any that raced with the close
        self.register.close();
        self.drain_registrations();

        let reason = format!(
            "session closed: {}",
            self.last_error
                .as_deref()
                .unwrap_or("plugin closed its stream")
        );
        let outstanding: Vec<Tracked> = self.pending.drain().map(|(_, t)| t).collect();
        if !outstanding.is_empty() {
            self.ctx.events.error(format!(
                "[plugin {}] {} ({} outstanding task(s) failed)",
                self.plugin_id,
                reason,
                outstanding.len()
            ));
        } else {
            self.ctx
                .events
                .info(format!("[plugin {}] session closed", self.plugin_id));
        }
        for tracked in outstanding {
            self.finish(tracked, Some(reason.clone())).await;
        }
    }

    /// Record the final status of a task, then release its slot.
    async fn finish(&self, tracked: Tracked, error: Option<String>) {
        let Tracked { mut task, permit } = tracked;
        match error {
            Some(message) => {
                self.ctx
                    .events
                    .error(format!("[task {}] failed: {}", task.id, message));
                task.mark_failed(message);
            }
            None => {
                task.mark_complete();
                self.ctx.events.info(format!("[task {}] complete", task.id));
            }
        }
        if let Err(e) = self.ctx.queue.update(&task).await {
            self.ctx
                .events
                .error(format!("[task {}] failed to update status: {}", task.id, e));
        }
        drop(permit);
    }
}
