//! Transport-neutral request/response surface.
//!
//! Maps the three caller operations onto HTTP-equivalent status codes and
//! JSON bodies so that any front-end (HTTP router, CLI, message handler) can
//! forward them unchanged.
//!
//! | Operation          | Success                                    |
//! |--------------------|--------------------------------------------|
//! | `submit`           | `202 {"task_id": ...}`                     |
//! | `status`           | `200` status report                        |
//! | `result`           | `200 {"status": ..., "payload": ...}`      |
//!
//! Errors use `{"error": {"code": ..., "message": ...}}` with the status of
//! [`TaskError::http_status`].

use serde::Serialize;
use serde_json::{json, Value};

use esg_tasks::{Dispatcher, StatusReader, TaskError};

/// A status code and JSON body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtocolResponse {
    /// HTTP-equivalent status code.
    pub status: u16,
    /// Response body.
    pub body: Value,
}

impl ProtocolResponse {
    fn ok(status: u16, body: &impl Serialize) -> Self {
        match serde_json::to_value(body) {
            Ok(body) => Self { status, body },
            Err(e) => Self::error(&TaskError::Serialization(e.to_string())),
        }
    }

    /// The error body for `err`.
    pub fn error(err: &TaskError) -> Self {
        let mut error = json!({
            "code": err.error_code(),
            "message": err.to_string(),
        });
        if let TaskError::DispatchFailure {
            task_id,
            reconciliation,
            ..
        } = err
        {
            error["task_id"] = json!(task_id);
            error["reconciliation"] = json!(reconciliation.to_string());
        }
        Self {
            status: err.http_status(),
            body: json!({ "error": error }),
        }
    }

    /// `true` for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Caller-facing operations over a dispatcher and a reader.
#[derive(Debug, Clone)]
pub struct TaskProtocol {
    dispatcher: Dispatcher,
    reader: StatusReader,
}

impl TaskProtocol {
    /// Creates the surface.
    pub fn new(dispatcher: Dispatcher, reader: StatusReader) -> Self {
        Self { dispatcher, reader }
    }

    /// Submits a task of `kind` (wire name) with `payload`.
    pub async fn submit(&self, kind: &str, payload: Value) -> ProtocolResponse {
        match self.dispatcher.submit_raw(kind, payload).await {
            Ok(task_id) => ProtocolResponse::ok(202, &json!({ "task_id": task_id })),
            Err(e) => {
                tracing::warn!(kind, error = %e, "submission rejected");
                ProtocolResponse::error(&e)
            }
        }
    }

    /// Latest status of `task_id`.
    pub async fn status(&self, task_id: &str) -> ProtocolResponse {
        match self.reader.get_status(task_id).await {
            Ok(report) => ProtocolResponse::ok(200, &report),
            Err(e) => ProtocolResponse::error(&e),
        }
    }

    /// Final result of `task_id`.
    pub async fn result(&self, task_id: &str) -> ProtocolResponse {
        match self.reader.get_result(task_id).await {
            Ok(outcome) => ProtocolResponse::ok(200, &outcome),
            Err(e) => ProtocolResponse::error(&e),
        }
    }
}
