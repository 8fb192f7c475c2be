//! Task kind and lifecycle status.
//!
//! [`TaskKind`] is the closed set of operations a worker can run, and
//! [`TaskStatus`] is the lifecycle state machine every registry mutation is
//! validated against.
//!
//! # State Machine
//!
//! ```text
//! Pending -> Running, Failed
//! Running -> Running, Ready, Failed
//! Ready   -> (terminal, no transitions)
//! Failed  -> (terminal, no transitions)
//! ```
//!
//! `Running -> Running` is the only permitted self-transition. It covers
//! progress updates and a redelivered message taking over an abandoned claim;
//! neither changes the observable status.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// The operation a task performs.
///
/// Each kind is served by its own computation callback. The set is closed:
/// code that needs per-kind behaviour matches on it exhaustively.
///
/// # Examples
///
/// ```
/// use esg_tasks::TaskKind;
///
/// let kind: TaskKind = "fit-parameters".parse().unwrap();
/// assert_eq!(kind, TaskKind::FitParameters);
/// assert_eq!(kind.to_string(), "fit-parameters");
/// assert!("train".parse::<TaskKind>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    /// Compute a forecast or optimized schedule from request inputs.
    Request,
    /// Fit model parameters from observed data.
    FitParameters,
}

impl TaskKind {
    /// All kinds, in declaration order.
    pub const ALL: [TaskKind; 2] = [TaskKind::Request, TaskKind::FitParameters];

    /// The wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::FitParameters => "fit-parameters",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "request" => Ok(Self::Request),
            "fit-parameters" => Ok(Self::FitParameters),
            other => Err(TaskError::UnknownKind {
                kind: other.to_string(),
            }),
        }
    }
}

/// Task lifecycle status.
///
/// `Pending` is initial, `Ready` and `Failed` are terminal. Transitions never
/// move backward; see the module docs for the full table.
///
/// # Examples
///
/// ```
/// use esg_tasks::TaskStatus;
///
/// assert!(TaskStatus::Pending.can_transition_to(&TaskStatus::Running));
/// assert!(TaskStatus::Running.can_transition_to(&TaskStatus::Running));
/// assert!(!TaskStatus::Running.can_transition_to(&TaskStatus::Pending));
/// assert!(!TaskStatus::Ready.can_transition_to(&TaskStatus::Failed));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created and queued, not yet claimed by a worker.
    Pending,
    /// Claimed by a worker and executing.
    Running,
    /// Finished successfully (terminal).
    Ready,
    /// Finished with an error (terminal).
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl TaskStatus {
    /// Returns `true` for `Ready` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }

    /// Position in the lifecycle ordering `pending < running < terminal`.
    ///
    /// Both terminal statuses share the same rank. A valid observation
    /// sequence of a single task never decreases in rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Ready | Self::Failed => 2,
        }
    }

    /// Returns `true` if moving from this status to `next` is allowed.
    pub fn can_transition_to(&self, next: &Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Failed),
            Self::Running => matches!(next, Self::Running | Self::Ready | Self::Failed),
            Self::Ready | Self::Failed => false,
        }
    }

    /// Validates a transition, returning [`TaskError::InvalidTransition`]
    /// with the task id when it is not allowed.
    ///
    /// # Examples
    ///
    /// ```
    /// use esg_tasks::{TaskError, TaskStatus};
    ///
    /// assert!(TaskStatus::Pending.validate_transition("t1", &TaskStatus::Running).is_ok());
    ///
    /// let err = TaskStatus::Ready
    ///     .validate_transition("t1", &TaskStatus::Running)
    ///     .unwrap_err();
    /// assert!(matches!(err, TaskError::InvalidTransition { .. }));
    /// ```
    pub fn validate_transition(&self, task_id: &str, next: &Self) -> Result<(), TaskError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(TaskError::InvalidTransition {
                task_id: task_id.to_string(),
                from: *self,
                to: *next,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATUSES: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Ready,
        TaskStatus::Failed,
    ];

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Ready.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn terminal_rejects_everything() {
        for from in [TaskStatus::Ready, TaskStatus::Failed] {
            for to in ALL_STATUSES {
                assert!(!from.can_transition_to(&to), "{from} -> {to} accepted");
            }
        }
    }

    #[test]
    fn pending_cannot_complete_directly_as_ready() {
        assert!(!TaskStatus::Pending.can_transition_to(&TaskStatus::Ready));
        assert!(!TaskStatus::Pending.can_transition_to(&TaskStatus::Pending));
    }

    #[test]
    fn valid_transitions_never_decrease_rank() {
        for from in ALL_STATUSES {
            for to in ALL_STATUSES {
                if from.can_transition_to(&to) {
                    assert!(to.rank() >= from.rank());
                }
            }
        }
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(TaskStatus::Pending).unwrap(),
            serde_json::json!("pending")
        );
        let parsed: TaskStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(parsed, TaskStatus::Failed);
    }

    #[test]
    fn kind_wire_names() {
        assert_eq!(
            serde_json::to_value(TaskKind::FitParameters).unwrap(),
            serde_json::json!("fit-parameters")
        );
        for kind in TaskKind::ALL {
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = "fit_parameters".parse::<TaskKind>().unwrap_err();
        assert!(matches!(err, TaskError::UnknownKind { kind } if kind == "fit_parameters"));
    }
}
