//! Work-queue message and delivery envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::task::TaskKind;

/// The unit of work published by the dispatcher.
///
/// The payload is opaque to the protocol core and handed to the computation
/// unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Correlation key shared with the registry entry.
    pub task_id: String,
    /// Which computation serves this task.
    pub kind: TaskKind,
    /// Caller-supplied input, already schema-validated upstream.
    pub payload: Value,
}

impl TaskMessage {
    /// Creates a message.
    pub fn new(task_id: impl Into<String>, kind: TaskKind, payload: Value) -> Self {
        Self {
            task_id: task_id.into(),
            kind,
            payload,
        }
    }
}

/// A message handed to one consumer by a broker transport.
///
/// The message stays invisible to other consumers until the delivery is
/// acknowledged, or until the transport recovers it as unacknowledged, in
/// which case it is delivered again with `redelivered` set.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// The queue the message was taken from.
    pub queue: String,
    /// The delivered message.
    pub message: TaskMessage,
    /// Transport-defined handle used to acknowledge this delivery.
    pub receipt: String,
    /// `true` when this message was delivered before and never acknowledged.
    pub redelivered: bool,
}
