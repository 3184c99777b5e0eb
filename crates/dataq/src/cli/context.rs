//! Shared state for commands that touch the queue or CAS

use anyhow::{Context as _, Result};
use dataq_cas::SharedStore;
use dataq_queue::SharedQueue;
use dataq_worker::{open_backends, DataqConfig, Worker};
use std::path::Path;
use tracing::{debug, warn};

pub struct Context {
    pub config: DataqConfig,
    pub queue: SharedQueue,
    pub cas: SharedStore,
}

impl Context {
    pub async fn open(config_path: &Path) -> Result<Self> {
        let config = DataqConfig::load_or_default(config_path)
            .with_context(|| format!("Failed to load config {}", config_path.display()))?;
        debug!(
            "Loaded config {} ({} plugins)",
            config_path.display(),
            config.plugins.len()
        );
        let (queue, cas) = open_backends(&config)
            .await
            .context("Failed to open queue and CAS")?;
        Ok(Self { config, queue, cas })
    }

    pub fn worker(&self) -> Worker {
        Worker::new(self.config.clone(), self.queue.clone(), self.cas.clone())
    }

    pub async fn close(&self) {
        if let Err(e) = self.queue.close().await {
            warn!("Failed to close queue: {}", e);
        }
    }
}
