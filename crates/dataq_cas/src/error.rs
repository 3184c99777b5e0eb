//! CAS error types

use dataq_protocol::ProtocolError;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CasError>;

#[derive(Error, Debug)]
pub enum CasError {
    #[error("Content not found: {0}")]
    NotFound(String),

    #[error("Invalid content hash: {0}")]
    InvalidHash(#[from] ProtocolError),

    #[error("Stored content for {hash} is corrupted (hashes to {actual})")]
    Corrupted { hash: String, actual: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl CasError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CasError::NotFound(_))
    }
}
