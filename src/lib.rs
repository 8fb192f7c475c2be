//! Service host for the asynchronous task-lifecycle protocol.
//!
//! Wires the components of [`esg_tasks`] together from a TOML
//! [`config::ServiceConfig`], exposes them through the transport-neutral
//! [`protocol::TaskProtocol`], and ships the reference [`linear`] model as
//! the default computation set.
//!
//! ```no_run
//! use esg_service::config::ServiceConfig;
//! use esg_service::protocol::TaskProtocol;
//! use esg_service::service::TaskService;
//! use serde_json::json;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let service = TaskService::from_config(ServiceConfig::from_env()?).await?;
//! let api = TaskProtocol::new(service.dispatcher(), service.reader());
//!
//! let accepted = api
//!     .submit("request", json!({"arguments": {"x": [1.0]}, "parameters": {"w": 2.0}}))
//!     .await;
//! assert_eq!(accepted.status, 202);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod linear;
pub mod logging;
pub mod protocol;
pub mod service;

pub use esg_tasks;

pub use config::ServiceConfig;
pub use error::{ConfigError, ServiceError};
pub use protocol::{ProtocolResponse, TaskProtocol};
pub use service::TaskService;
