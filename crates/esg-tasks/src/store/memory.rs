//! In-memory storage backend.
//!
//! [`InMemoryBackend`] keeps serialized records in a
//! `DashMap<String, (Vec<u8>, u64)>`. Shard-level locking means concurrent
//! operations on different tasks never contend on a registry-wide lock.
//! It is the backend for tests and single-process deployments.
//!
//! # Examples
//!
//! ```
//! use esg_tasks::store::memory::{InMemoryBackend, InMemoryTaskRegistry};
//!
//! let registry: InMemoryTaskRegistry = InMemoryTaskRegistry::new(InMemoryBackend::new());
//! ```

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::store::backend::{StorageBackend, StorageError, VersionedRecord};
use crate::store::generic::GenericTaskRegistry;

/// Registry over the in-memory backend.
pub type InMemoryTaskRegistry = GenericTaskRegistry<InMemoryBackend>;

/// Thread-safe in-memory storage backend.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: DashMap<String, (Vec<u8>, u64)>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    ///
    /// ```
    /// use esg_tasks::store::memory::InMemoryBackend;
    ///
    /// assert!(InMemoryBackend::new().is_empty());
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        let entry = self.data.get(key).ok_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        })?;
        let (data, version) = entry.value();
        Ok(VersionedRecord {
            data: data.clone(),
            version: *version,
        })
    }

    async fn insert(&self, key: &str, data: &[u8]) -> Result<u64, StorageError> {
        match self.data.entry(key.to_string()) {
            Entry::Occupied(_) => Err(StorageError::AlreadyExists {
                key: key.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert((data.to_vec(), 1));
                Ok(1)
            }
        }
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        let mut entry = self
            .data
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })?;
        let current_version = entry.value().1;
        if current_version != expected_version {
            return Err(StorageError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: current_version,
            });
        }
        let new_version = current_version + 1;
        *entry.value_mut() = (data.to_vec(), new_version);
        Ok(new_version)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.data.remove(key).is_some())
    }

    async fn list_keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.data.iter().map(|entry| entry.key().clone()).collect())
    }
}
