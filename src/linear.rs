//! Reference computations: a linear model served through the task protocol.
//!
//! `request` evaluates `f = x · w`:
//!
//! ```json
//! {"arguments": {"x": [[1.0, 2.0], [3.0, 4.0]]}, "parameters": {"w": [0.5, 0.25]}}
//! ```
//!
//! yields `{"f": [1.0, 2.5]}`. A flat `x` is one feature per row and a
//! scalar `w` is a one-element weight vector.
//!
//! `fit-parameters` solves the one-feature least-squares problem
//! `w = (xᵀx)⁻¹ xᵀy`:
//!
//! ```json
//! {"arguments": {"x": [1.0, 2.0]}, "observations": {"y": [2.0, 4.0]}}
//! ```
//!
//! yields `{"w": 2.0}`.

use serde::Deserialize;
use serde_json::{json, Value};

use esg_tasks::{computation_fn, ComputationError, Computations, TaskContext, TaskProgress};

/// Number of progress updates published over a full pass.
const PROGRESS_STEPS: usize = 10;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Row {
    Scalar(f64),
    Features(Vec<f64>),
}

impl Row {
    fn into_features(self) -> Vec<f64> {
        match self {
            Self::Scalar(v) => vec![v],
            Self::Features(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Weights {
    Scalar(f64),
    Vector(Vec<f64>),
}

#[derive(Debug, Deserialize)]
struct RequestArguments {
    x: Vec<Row>,
}

#[derive(Debug, Deserialize)]
struct RequestParameters {
    w: Weights,
}

#[derive(Debug, Deserialize)]
struct RequestInput {
    arguments: RequestArguments,
    parameters: RequestParameters,
}

#[derive(Debug, Deserialize)]
struct FitArguments {
    x: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct FitObservations {
    y: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct FitInput {
    arguments: FitArguments,
    observations: FitObservations,
}

/// Both reference computations, ready for a [`WorkerLoop`](esg_tasks::WorkerLoop).
pub fn computations() -> Computations {
    Computations::new(computation_fn(evaluate))
        .with_fit_parameters(computation_fn(fit_parameters))
}

/// Evaluates the model for every row of `arguments.x`.
pub async fn evaluate(payload: Value, ctx: TaskContext) -> Result<Value, ComputationError> {
    let input: RequestInput = parse(payload)?;
    let w = match input.parameters.w {
        Weights::Scalar(w) => vec![w],
        Weights::Vector(w) => w,
    };
    if w.is_empty() {
        return Err(ComputationError::invalid_input("parameters.w must not be empty"));
    }

    let rows = input.arguments.x.len();
    let mut f = Vec::with_capacity(rows);
    for (i, row) in input.arguments.x.into_iter().enumerate() {
        let features = row.into_features();
        if features.len() != w.len() {
            return Err(ComputationError::invalid_input(format!(
                "row {i} of arguments.x has {} features, parameters.w has {}",
                features.len(),
                w.len()
            ))
            .with_detail(json!({ "row": i })));
        }
        f.push(features.iter().zip(&w).map(|(x, w)| x * w).sum::<f64>());
        publish(&ctx, "evaluating", i + 1, rows).await;
    }

    Ok(json!({ "f": f }))
}

/// Fits the weight of a one-feature linear model by least squares.
pub async fn fit_parameters(payload: Value, ctx: TaskContext) -> Result<Value, ComputationError> {
    let input: FitInput = parse(payload)?;
    let (x, y) = (input.arguments.x, input.observations.y);
    if x.len() != y.len() {
        return Err(ComputationError::invalid_input(format!(
            "arguments.x has {} values, observations.y has {}",
            x.len(),
            y.len()
        )));
    }

    let total = x.len();
    let (mut xx, mut xy) = (0.0, 0.0);
    for (i, (xi, yi)) in x.iter().zip(&y).enumerate() {
        xx += xi * xi;
        xy += xi * yi;
        publish(&ctx, "fitting", i + 1, total).await;
    }
    if xx == 0.0 {
        return Err(ComputationError::with_code(
            "singular",
            "xᵀx is zero, the weight is undetermined",
        ));
    }

    Ok(json!({ "w": xy / xx }))
}

fn parse<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, ComputationError> {
    serde_json::from_value(payload).map_err(|e| ComputationError::invalid_input(e.to_string()))
}

/// Publishes progress at most [`PROGRESS_STEPS`] times per pass.
async fn publish(ctx: &TaskContext, stage: &str, done: usize, total: usize) {
    if !should_publish(done, total) {
        return;
    }
    let percent = done as f64 * 100.0 / total as f64;
    if let Err(e) = ctx
        .report_progress(TaskProgress::percent(percent).with_stage(stage))
        .await
    {
        tracing::debug!(task_id = ctx.task_id(), error = %e, "progress update rejected");
    }
}

/// Every `ceil(total / PROGRESS_STEPS)` items, and always on the last one.
fn should_publish(done: usize, total: usize) -> bool {
    let step = total.div_ceil(PROGRESS_STEPS).max(1);
    done % step == 0 || done == total
}
