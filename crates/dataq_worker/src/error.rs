//! Worker error types

use dataq_cas::CasError;
use dataq_protocol::ProtocolError;
use dataq_queue::QueueError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// Invalid configuration values
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("CAS error: {0}")]
    Cas(#[from] CasError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Plugin binary could not be started
    #[error("Failed to spawn plugin '{plugin_id}' ({}): {source}", .binary.display())]
    Spawn {
        plugin_id: String,
        binary: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl WorkerError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
