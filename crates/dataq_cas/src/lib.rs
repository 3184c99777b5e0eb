//! Content-addressed storage.
//!
//! Payloads are keyed by their [`ContentHash`]. Storing the same bytes twice
//! is a no-op that returns the same key, and every read is re-hashed so a
//! damaged entry is reported instead of returned.

pub mod error;
pub mod file;
pub mod memory;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use dataq_protocol::ContentHash;
pub use error::{CasError, Result};
pub use file::FileStore;
pub use memory::MemoryStore;

/// Channel capacity used by `iterate` implementations
pub const ITERATE_BUFFER: usize = 64;

/// A content-addressed byte store.
///
/// Implementations must tolerate concurrent calls from several tasks.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store a payload, returning its hash. Idempotent.
    async fn store(&self, payload: &[u8]) -> Result<ContentHash>;

    /// Fetch a payload by hash.
    ///
    /// Errors with `NotFound` for an unknown hash, `InvalidHash` for a
    /// malformed key and `Corrupted` if the stored bytes no longer match.
    async fn retrieve(&self, hash: &str) -> Result<Vec<u8>>;

    /// Enumerate every stored hash.
    ///
    /// Hashes are produced lazily into the returned channel; dropping the
    /// receiver stops the scan. Each call starts a fresh scan.
    async fn iterate(&self) -> Result<mpsc::Receiver<Result<ContentHash>>>;

    /// True if the store holds content for `hash`.
    async fn contains(&self, hash: &str) -> Result<bool>;
}

/// Shared handle used by the worker and CLI.
pub type SharedStore = Arc<dyn ContentStore>;

/// Drain an `iterate` channel into a vector.
pub async fn collect_hashes(store: &dyn ContentStore) -> Result<Vec<ContentHash>> {
    let mut rx = store.iterate().await?;
    let mut hashes = Vec::new();
    while let Some(hash) = rx.recv().await {
        hashes.push(hash?);
    }
    Ok(hashes)
}
