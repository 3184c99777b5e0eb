//! In-memory store for tests and throwaway runs.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::{mpsc, RwLock};

use crate::error::{CasError, Result};
use crate::{ContentHash, ContentStore, ITERATE_BUFFER};

#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<ContentHash, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn store(&self, payload: &[u8]) -> Result<ContentHash> {
        let hash = ContentHash::of(payload);
        self.entries
            .write()
            .await
            .entry(hash.clone())
            .or_insert_with(|| payload.to_vec());
        Ok(hash)
    }

    async fn retrieve(&self, hash: &str) -> Result<Vec<u8>> {
        let hash = ContentHash::parse(hash)?;
        self.entries
            .read()
            .await
            .get(&hash)
            .cloned()
            .ok_or_else(|| CasError::NotFound(hash.to_string()))
    }

    async fn iterate(&self) -> Result<mpsc::Receiver<Result<ContentHash>>> {
        let hashes: Vec<ContentHash> = self.entries.read().await.keys().cloned().collect();
        let (tx, rx) = mpsc::channel(ITERATE_BUFFER);
        tokio::spawn(async move {
            for hash in hashes {
                if tx.send(Ok(hash)).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn contains(&self, hash: &str) -> Result<bool> {
        let hash = ContentHash::parse(hash)?;
        Ok(self.entries.read().await.contains_key(&hash))
    }
}
