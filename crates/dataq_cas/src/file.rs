//! Filesystem-backed store.
//!
//! Layout: one flat file per entry, named by its hash, directly under the
//! store root. Writes go to a `.tmp-*` file in the same directory and are
//! moved into place with a no-clobber rename, so concurrent writers of the
//! same content produce one entry and readers never see a partial file.

use async_trait::async_trait;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{CasError, Result};
use crate::{ContentHash, ContentStore, ITERATE_BUFFER};

const TMP_PREFIX: &str = ".tmp-";

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, hash: &ContentHash) -> PathBuf {
        self.root.join(hash.as_str())
    }
}

/// Write `data` to `path` unless it already exists. Returns true if this call wrote it.
fn write_once(root: &Path, path: &Path, data: &[u8]) -> io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }

    let mut tmp = tempfile::Builder::new()
        .prefix(TMP_PREFIX)
        .tempfile_in(root)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;

    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        // Lost the race to another writer of the same content
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error),
    }
}

#[async_trait]
impl ContentStore for FileStore {
    async fn store(&self, payload: &[u8]) -> Result<ContentHash> {
        let hash = ContentHash::of(payload);
        let path = self.path_for(&hash);
        let root = self.root.clone();
        let data = payload.to_vec();

        let written = tokio::task::spawn_blocking(move || write_once(&root, &path, &data)).await??;
        if written {
            debug!("Stored {} ({} bytes)", hash, payload.len());
        }
        Ok(hash)
    }

    async fn retrieve(&self, hash: &str) -> Result<Vec<u8>> {
        let hash = ContentHash::parse(hash)?;
        let data = match tokio::fs::read(self.path_for(&hash)).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CasError::NotFound(hash.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let actual = ContentHash::of(&data);
        if actual != hash {
            return Err(CasError::Corrupted {
                hash: hash.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(data)
    }

    async fn iterate(&self) -> Result<mpsc::Receiver<Result<ContentHash>>> {
        let root = self.root.clone();
        let (tx, rx) = mpsc::channel(ITERATE_BUFFER);

        tokio::task::spawn_blocking(move || {
            let entries = match std::fs::read_dir(&root) {
                Ok(entries) => entries,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e.into()));
                    return;
                }
            };
            for entry in entries {
                let item = match entry {
                    Ok(entry) => {
                        let name = entry.file_name();
                        let Some(name) = name.to_str() else { continue };
                        if name.starts_with(TMP_PREFIX) {
                            continue;
                        }
                        match entry.file_type() {
                            Ok(ft) if ft.is_file() => {}
                            Ok(_) => continue,
                            Err(e) => {
                                let _ = tx.blocking_send(Err(e.into()));
                                return;
                            }
                        }
                        // Foreign files in the root are not entries
                        match ContentHash::parse(name) {
                            Ok(hash) => Ok(hash),
                            Err(_) => continue,
                        }
                    }
                    Err(e) => Err(CasError::Io(e)),
                };
                let failed = item.is_err();
                if tx.blocking_send(item).is_err() || failed {
                    return;
                }
            }
        });

        Ok(rx)
    }

    async fn contains(&self, hash: &str) -> Result<bool> {
        let hash = ContentHash::parse(hash)?;
        Ok(tokio::fs::try_exists(self.path_for(&hash)).await?)
    }
}
