//! Asynchronous task-lifecycle protocol.
//!
//! Decouples a stateless API front-end from long-running computations run
//! by worker processes. The two sides share nothing but a broker transport
//! (work queue and result store) and a task registry.
//!
//! # Overview
//!
//! ```text
//! Dispatcher ──enqueue──▶ Broker ──dequeue──▶ WorkerLoop
//!     │                                          │
//!     └──insert──▶ TaskRegistry ◀──claim/complete┘
//!                      ▲    ▲
//!       StatusReader ──┘    └── GarbageCollector
//! ```
//!
//! A task moves `pending → running → ready | failed`. The registry rejects
//! every other transition, so readers never observe a status going
//! backwards, and redelivered messages for finished tasks are no-ops.
//!
//! # Module Organization
//!
//! - [`types`] - Kinds, statuses, progress, messages and reader views
//! - [`domain`] - The persisted [`TaskRecord`]
//! - [`error`] - [`TaskError`] with HTTP-equivalent status mapping
//! - [`store`] - [`TaskRegistry`](store::TaskRegistry) and storage backends
//! - [`broker`] - [`BrokerTransport`](broker::BrokerTransport) and transports
//! - [`dispatcher`], [`worker`], [`reader`], [`gc`] - The four components
//! - [`context`] - Progress handle given to computations
//! - [`constants`] - Queue names and defaults

pub mod broker;
pub mod constants;
pub mod context;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod gc;
pub mod reader;
pub mod store;
pub mod types;
pub mod worker;

pub use context::TaskContext;
pub use dispatcher::Dispatcher;
pub use domain::TaskRecord;
pub use error::{Reconciliation, TaskError};
pub use gc::{GarbageCollector, GcConfig, StaleTaskPolicy, StuckTask, SweepReport};
pub use reader::{ReaderConfig, StatusReader};
pub use types::*;
pub use worker::{
    computation_fn, Computation, Computations, ProcessOutcome, WorkerConfig, WorkerLoop,
};
