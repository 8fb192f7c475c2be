//! Broker transport interface and implementations.
//!
//! The broker is the only channel between API-side and worker-side
//! processes: named work queues with at-least-once delivery, plus a
//! key-value result store. The protocol core consumes it through
//! [`BrokerTransport`] and makes no assumption beyond:
//!
//! - a dequeued message is handed to one consumer at a time,
//! - a message that is never acknowledged may be delivered again, flagged
//!   as redelivered.
//!
//! # Transports
//!
//! - [`InMemoryBroker`](memory::InMemoryBroker) -- single-process, for tests
//!   and embedded use.
//! - [`FsBroker`](fs::FsBroker) -- directory-backed, shared by processes on
//!   one host.

pub mod fs;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::types::message::{Delivery, TaskMessage};

/// Errors raised by a broker transport.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The transport cannot be reached or refused the operation.
    #[error("broker unavailable: {message}")]
    Unavailable {
        /// Human-readable description.
        message: String,
    },

    /// No result is stored under the key.
    #[error("result not found: {key}")]
    NotFound {
        /// The missing result key.
        key: String,
    },

    /// The delivery was already acknowledged or recovered.
    #[error("unknown delivery receipt: {receipt}")]
    UnknownReceipt {
        /// The stale receipt.
        receipt: String,
    },

    /// A message or payload could not be encoded or decoded.
    #[error("broker codec error: {message}")]
    Codec {
        /// Human-readable description.
        message: String,
    },

    /// Filesystem failure in a file-backed transport.
    #[error("broker i/o error: {message}")]
    Io {
        /// What the transport was doing.
        message: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl BrokerError {
    pub(crate) fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }
}

/// Message-passing and result-storage substrate.
///
/// Implementations must be `Send + Sync`; one transport is shared by every
/// component of a process.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Appends a message to `queue`.
    async fn enqueue(&self, queue: &str, message: &TaskMessage) -> Result<(), BrokerError>;

    /// Takes the next message from `queue`.
    ///
    /// With `wait = None` this returns immediately. With `Some(d)` it waits
    /// cooperatively up to `d` for a message to arrive. `Ok(None)` means the
    /// queue stayed empty.
    ///
    /// Must be cancel-safe: dropping the future before it resolves must not
    /// lose a message. The worker loop abandons a waiting dequeue on
    /// shutdown.
    async fn dequeue(
        &self,
        queue: &str,
        wait: Option<Duration>,
    ) -> Result<Option<Delivery>, BrokerError>;

    /// Acknowledges a delivery so it is never delivered again.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Stores (or replaces) a result payload under `key`.
    async fn store_result(&self, key: &str, payload: &Value) -> Result<(), BrokerError>;

    /// Fetches a result payload.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NotFound`] if nothing is stored under `key`.
    async fn fetch_result(&self, key: &str) -> Result<Value, BrokerError>;

    /// Deletes a result payload. Returns `false` if nothing was stored.
    async fn delete_result(&self, key: &str) -> Result<bool, BrokerError>;
}
