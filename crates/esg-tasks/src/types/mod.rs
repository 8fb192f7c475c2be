//! Protocol types shared by every component.

pub mod message;
pub mod outcome;
pub mod progress;
pub mod task;

pub use message::{Delivery, TaskMessage};
pub use outcome::{ComputationError, StatusReport, TaskOutcome};
pub use progress::TaskProgress;
pub use task::{TaskKind, TaskStatus};
