//! Low-level key-value storage backend trait and supporting types.
//!
//! [`StorageBackend`] is the contract every registry storage engine
//! implements: [`get`](StorageBackend::get), [`insert`](StorageBackend::insert),
//! [`put_if_version`](StorageBackend::put_if_version),
//! [`delete`](StorageBackend::delete) and [`list_keys`](StorageBackend::list_keys).
//!
//! Backends are dumb versioned KV stores. The state machine, claim rules and
//! serialization live in
//! [`GenericTaskRegistry`](crate::store::generic::GenericTaskRegistry).
//!
//! # Keys
//!
//! Keys are task ids. Backends that map keys onto external namespaces (file
//! names, for instance) must reject keys outside [`is_valid_key`].
//!
//! # Versioning
//!
//! Each stored record carries a monotonic `u64` version starting at 1,
//! incremented on every successful write. [`put_if_version`](StorageBackend::put_if_version)
//! is the compare-and-swap primitive all registry mutations go through.

use async_trait::async_trait;

/// A stored record paired with its version number.
///
/// # Examples
///
/// ```
/// use esg_tasks::store::backend::VersionedRecord;
///
/// let record = VersionedRecord {
///     data: b"{}".to_vec(),
///     version: 1,
/// };
/// assert_eq!(record.version, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord {
    /// Serialized task record bytes (canonical JSON).
    pub data: Vec<u8>,
    /// Monotonic version, starting at 1.
    pub version: u64,
}

/// Errors from raw storage operations.
///
/// The registry maps these onto [`TaskError`](crate::error::TaskError)
/// before they reach callers.
///
/// # Examples
///
/// ```
/// use esg_tasks::store::backend::StorageError;
///
/// let err = StorageError::VersionConflict {
///     key: "k".to_string(),
///     expected: 2,
///     actual: 3,
/// };
/// assert!(err.to_string().contains("expected 2"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No record exists for the key.
    #[error("key not found: {key}")]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// A create-only write found the key already taken.
    #[error("key already exists: {key}")]
    AlreadyExists {
        /// The duplicate key.
        key: String,
    },

    /// A compare-and-swap write found a different version than expected.
    #[error("version conflict on key {key}: expected {expected}, found {actual}")]
    VersionConflict {
        /// The contended key.
        key: String,
        /// The version the caller read.
        expected: u64,
        /// The version currently stored.
        actual: u64,
    },

    /// I/O or engine-specific failure.
    #[error("backend error: {message}")]
    Backend {
        /// Human-readable description.
        message: String,
        /// The underlying error, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl StorageError {
    /// Backend error without an underlying cause.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }

    /// Backend error wrapping an underlying cause.
    pub fn backend_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Versioned key-value storage for task records.
///
/// Implementations must be `Send + Sync`: one backend is shared by every
/// dispatcher, worker and collector in the process.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Retrieves a record and its current version.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if the key does not exist.
    /// - [`StorageError::Backend`] on engine failures.
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError>;

    /// Stores a new record with version 1.
    ///
    /// # Errors
    ///
    /// - [`StorageError::AlreadyExists`] if the key is taken. The stored
    ///   record is left untouched.
    /// - [`StorageError::Backend`] on engine failures.
    async fn insert(&self, key: &str, data: &[u8]) -> Result<u64, StorageError>;

    /// Replaces a record only if its version equals `expected_version`.
    /// Returns the new version.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if the key does not exist.
    /// - [`StorageError::VersionConflict`] on a version mismatch.
    /// - [`StorageError::Backend`] on engine failures.
    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError>;

    /// Deletes a record. Returns `false` if the key did not exist.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Lists every stored key, in no particular order.
    async fn list_keys(&self) -> Result<Vec<String>, StorageError>;
}

/// Returns `true` if `key` is safe to use as a storage key on every backend.
///
/// Allowed: non-empty ASCII alphanumerics, `-`, `_` and `.`, not starting
/// with `.`, at most 128 bytes.
///
/// ```
/// use esg_tasks::store::backend::is_valid_key;
///
/// assert!(is_valid_key("0190f1f4-6a4e-7c2b-9a51-1a2b3c4d5e6f"));
/// assert!(is_valid_key("task.2"));
/// assert!(!is_valid_key("../etc/passwd"));
/// assert!(!is_valid_key(""));
/// ```
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 128
        && !key.starts_with('.')
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}
