//! Finite-difference check of analytic gradients

use crate::{
    data::{BatchField, EmbeddingBatch},
    error::{MetricError, MetricResult},
    tensor::Tensor,
};
use super::{evaluate, function::{Function, FunctionContext}};

/// Outcome of [`gradcheck`]
#[derive(Debug, Clone, PartialEq)]
pub struct GradCheckReport {
    /// Largest absolute deviation per checked tensor
    pub per_field: Vec<(BatchField, f64)>,
    pub max_abs_error: f64,
    pub tolerance: f64,
}

impl GradCheckReport {
    pub fn passed(&self) -> bool {
        self.max_abs_error <= self.tolerance
    }
}

/// Central-difference gradient of `function` with respect to one batch tensor.
///
/// Returns `None` when the batch has no such tensor (`other_neg` on a triplet batch).
pub fn numerical_gradient<F>(
    function: &F,
    batch: &EmbeddingBatch<f64>,
    field: BatchField,
    step: f64,
) -> MetricResult<Option<Tensor<f64, 3>>>
where
    F: Function<f64> + ?Sized,
{
    if !(step.is_finite() && step > 0.0) {
        return Err(MetricError::InvalidInput(format!("Finite-difference step must be positive, got {}", step)));
    }
    let shape = match batch.field(field) {
        Some(tensor) => tensor.shape(),
        None => return Ok(None),
    };

    let mut probe = batch.clone();
    let mut grad = Tensor::zeros(shape);
    for i in 0..shape.total_elements() {
        let original = slot(&mut probe, field)[i];

        slot(&mut probe, field)[i] = original + step;
        let plus = function.forward(&probe, &mut FunctionContext::new())?;
        slot(&mut probe, field)[i] = original - step;
        let minus = function.forward(&probe, &mut FunctionContext::new())?;
        slot(&mut probe, field)[i] = original;

        grad.as_slice_mut()[i] = (plus - minus) / (2.0 * step);
    }
    Ok(Some(grad))
}

/// Compare the analytic backward pass against central differences on every input tensor
pub fn gradcheck<F>(
    function: &F,
    batch: &EmbeddingBatch<f64>,
    step: f64,
    tolerance: f64,
) -> MetricResult<GradCheckReport>
where
    F: Function<f64> + ?Sized,
{
    let analytic = evaluate(function, batch)?;
    let mut per_field = Vec::new();
    for field in BatchField::ALL {
        let numeric = match numerical_gradient(function, batch, field, step)? {
            Some(numeric) => numeric,
            None => continue,
        };
        let computed = analytic.gradients.field(field).ok_or_else(|| {
            MetricError::InvalidState(format!("{} produced no gradient for {}", function.name(), field.name()))
        })?;
        per_field.push((field, computed.max_abs_diff(&numeric)?));
    }

    let max_abs_error = per_field.iter().map(|&(_, err)| err).fold(0.0, f64::max);
    tracing::debug!(
        "gradcheck {}: max abs error {:.3e} (tolerance {:.1e})",
        function.name(),
        max_abs_error,
        tolerance
    );
    Ok(GradCheckReport {
        per_field,
        max_abs_error,
        tolerance,
    })
}

fn slot(batch: &mut EmbeddingBatch<f64>, field: BatchField) -> &mut [f64] {
    match batch.field_mut(field) {
        Some(tensor) => tensor.as_slice_mut(),
        None => &mut [],
    }
}
