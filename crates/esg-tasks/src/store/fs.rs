//! Filesystem storage backend.
//!
//! [`FsBackend`] stores one file per task under a root directory, so that
//! API and worker processes on the same host (or sharing a volume) see one
//! registry without any further infrastructure.
//!
//! # Layout
//!
//! ```text
//! <root>/<key>.json   "<version>\n<record bytes>"
//! <root>/<key>.lock   present while a writer holds the key
//! ```
//!
//! Writes go to a hidden temporary file which is then renamed over the
//! record file, so readers only ever see complete records. Writers serialize
//! per key with an exclusive advisory lock on the lock file. The kernel drops
//! the lock when its holder exits, so a crashed writer never blocks a key.
//! A lock only counts once it is verified to still be on the file the path
//! names; the holder unlinks the lock file before letting go.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use tokio::time::Instant;
use uuid::Uuid;

use crate::store::backend::{is_valid_key, StorageBackend, StorageError, VersionedRecord};
use crate::store::generic::GenericTaskRegistry;

/// Registry over the filesystem backend.
pub type FsTaskRegistry = GenericTaskRegistry<FsBackend>;

const RECORD_SUFFIX: &str = ".json";
const LOCK_SUFFIX: &str = ".lock";
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(2);

/// Directory-backed storage backend.
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
    lock_timeout: Duration,
}

impl FsBackend {
    /// Opens (and creates if needed) a backend rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the directory cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            StorageError::backend_with(format!("failed to create {}", root.display()), e)
        })?;
        Ok(Self {
            root,
            lock_timeout: Duration::from_secs(2),
        })
    }

    /// How long a writer waits for a contended key before giving up.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// The directory records are stored in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}{RECORD_SUFFIX}"))
    }

    async fn lock(&self, key: &str) -> Result<FileLock, StorageError> {
        let path = self.root.join(format!("{key}{LOCK_SUFFIX}"));
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            let attempt = {
                let path = path.clone();
                tokio::task::spawn_blocking(move || try_lock_file(&path))
                    .await
                    .map_err(|e| StorageError::backend_with(format!("failed to lock {key}"), e))?
            };
            match attempt {
                Ok(Some(file)) => {
                    return Ok(FileLock {
                        path,
                        _file: file,
                    })
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        return Err(StorageError::backend(format!(
                            "timed out waiting for lock on {key}"
                        )));
                    }
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                Err(e) => {
                    return Err(StorageError::backend_with(format!("failed to lock {key}"), e))
                }
            }
        }
    }

    async fn read(&self, key: &str) -> Result<Option<VersionedRecord>, StorageError> {
        match tokio::fs::read(self.record_path(key)).await {
            Ok(bytes) => decode(key, &bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::backend_with(format!("failed to read {key}"), e)),
        }
    }

    async fn write(&self, key: &str, version: u64, data: &[u8]) -> Result<(), StorageError> {
        let tmp = self.root.join(format!(".{key}.{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp, encode(version, data))
            .await
            .map_err(|e| StorageError::backend_with(format!("failed to write {key}"), e))?;
        if let Err(e) = tokio::fs::rename(&tmp, self.record_path(key)).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StorageError::backend_with(format!("failed to commit {key}"), e));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FsBackend {
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        if !is_valid_key(key) {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        }
        self.read(key).await?.ok_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        })
    }

    async fn insert(&self, key: &str, data: &[u8]) -> Result<u64, StorageError> {
        if !is_valid_key(key) {
            return Err(StorageError::backend(format!("invalid key: {key:?}")));
        }
        let _lock = self.lock(key).await?;
        if self.read(key).await?.is_some() {
            return Err(StorageError::AlreadyExists {
                key: key.to_string(),
            });
        }
        self.write(key, 1, data).await?;
        Ok(1)
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        if !is_valid_key(key) {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        }
        let _lock = self.lock(key).await?;
        let current = self.read(key).await?.ok_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        })?;
        if current.version != expected_version {
            return Err(StorageError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: current.version,
            });
        }
        let new_version = current.version + 1;
        self.write(key, new_version, data).await?;
        Ok(new_version)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        if !is_valid_key(key) {
            return Ok(false);
        }
        let _lock = self.lock(key).await?;
        match tokio::fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::backend_with(format!("failed to delete {key}"), e)),
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>, StorageError> {
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(|e| {
            StorageError::backend_with(format!("failed to list {}", self.root.display()), e)
        })?;
        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::backend_with("failed to list records", e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(key) = name.strip_suffix(RECORD_SUFFIX) {
                if is_valid_key(key) {
                    keys.push(key.to_string());
                }
            }
        }
        Ok(keys)
    }
}

/// Exclusive hold on a key. Unlinks the lock file, then releases the lock
/// when the file handle closes.
struct FileLock {
    path: PathBuf,
    _file: std::fs::File,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
        }
    }
}

/// One non-blocking attempt. `Ok(None)` means another writer holds the key,
/// or the file was unlinked under us by a releasing holder.
fn try_lock_file(path: &Path) -> std::io::Result<Option<std::fs::File>> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    if let Err(e) = file.try_lock_exclusive() {
        if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
            return Ok(None);
        }
        return Err(e);
    }
    match std::fs::metadata(path) {
        Ok(current) if same_file(&file.metadata()?, &current) => Ok(Some(file)),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn same_file(a: &std::fs::Metadata, b: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

// Windows refuses to unlink an open file, so the path cannot move.
#[cfg(not(unix))]
fn same_file(_: &std::fs::Metadata, _: &std::fs::Metadata) -> bool {
    true
}

fn encode(version: u64, data: &[u8]) -> Vec<u8> {
    let mut out = format!("{version}\n").into_bytes();
    out.extend_from_slice(data);
    out
}

fn decode(key: &str, bytes: &[u8]) -> Result<VersionedRecord, StorageError> {
    let corrupt = || StorageError::backend(format!("corrupt record file for {key}"));
    let split = bytes.iter().position(|b| *b == b'\n').ok_or_else(corrupt)?;
    let version = std::str::from_utf8(&bytes[..split])
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(corrupt)?;
    Ok(VersionedRecord {
        data: bytes[split + 1..].to_vec(),
        version,
    })
}
