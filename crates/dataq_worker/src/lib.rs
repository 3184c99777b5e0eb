//! DataQ worker
//!
//! Pops tasks from the queue, runs them through plugin subprocesses, stores
//! produced items in the CAS and turns emitted actions into new tasks.

pub mod config;
pub mod error;
pub mod events;
pub mod runner;
mod session;
pub mod worker;

use dataq_cas::{FileStore, SharedStore};
use dataq_queue::{open_queue, SharedQueue};
use std::sync::Arc;
use tracing::info;

pub use config::{CasConfig, DataqConfig, PluginConfig, QueueConfig};
pub use error::{Result, WorkerError};
pub use events::{event_channel, Event, EventKind, EventSink, EventStream};
pub use runner::{spawn_runner, RunnerHandle, RunnerSpec};
pub use worker::Worker;

/// Open the queue and CAS named by `config`.
pub async fn open_backends(config: &DataqConfig) -> Result<(SharedQueue, SharedStore)> {
    let queue_path = config.queue_path();
    let queue = open_queue(config.queue.backend, &queue_path).await?;

    let cas_path = config.cas_path();
    let cas: SharedStore = Arc::new(FileStore::open(&cas_path)?);

    info!(
        "Backends ready: queue={:?} at {}, cas at {}",
        config.queue.backend,
        queue_path.display(),
        cas_path.display()
    );
    Ok((queue, cas))
}
