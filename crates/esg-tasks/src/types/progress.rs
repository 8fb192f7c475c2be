//! Advisory progress published by running computations.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form progress of a running task. Last write wins.
///
/// All fields are optional; a computation reports whatever it knows.
/// Progress never influences the lifecycle state machine.
///
/// # Examples
///
/// ```
/// use esg_tasks::TaskProgress;
///
/// let progress = TaskProgress::percent(150.0).with_stage("fitting");
/// assert_eq!(progress.percent_complete, Some(100.0));
/// assert_eq!(progress.stage.as_deref(), Some("fitting"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Completed share of the work in percent, clamped to `0..=100`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent_complete: Option<f64>,

    /// Estimated seconds until completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,

    /// Name of the current processing stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,

    /// Anything else the computation wants to expose.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl TaskProgress {
    /// Progress with only a completion percentage.
    pub fn percent(value: f64) -> Self {
        Self {
            percent_complete: Some(clamp_percent(value)),
            ..Self::default()
        }
    }

    /// Progress with only a stage name.
    pub fn stage(stage: impl Into<String>) -> Self {
        Self {
            stage: Some(stage.into()),
            ..Self::default()
        }
    }

    /// Sets the stage name.
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Sets the estimated time to completion.
    pub fn with_eta_seconds(mut self, eta: f64) -> Self {
        self.eta_seconds = Some(eta.max(0.0));
        self
    }

    /// Attaches a free-form detail payload.
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Applies range clamping to numeric fields. Non-finite values are dropped.
    pub(crate) fn normalized(mut self) -> Self {
        self.percent_complete = self
            .percent_complete
            .filter(|p| p.is_finite())
            .map(clamp_percent);
        self.eta_seconds = self
            .eta_seconds
            .filter(|e| e.is_finite())
            .map(|e| e.max(0.0));
        self
    }
}

fn clamp_percent(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}
