//! Protocol error types

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while reading or writing length-prefixed frames.
#[derive(Error, Debug)]
pub enum FramingError {
    #[error("Truncated frame header: expected {expected} bytes, got {got}")]
    TruncatedHeader { expected: usize, got: usize },

    #[error("Truncated frame body: expected {expected} bytes, got {got}")]
    TruncatedBody { expected: u64, got: u64 },

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u64 },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid content hash '{value}': {reason}")]
    InvalidHash { value: String, reason: String },

    #[error("Hash mismatch for item '{source_id}': declared {declared}, computed {computed}")]
    HashMismatch {
        source_id: String,
        declared: String,
        computed: String,
    },
}
