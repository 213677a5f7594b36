//! Reverse-mode differentiation for the metric losses
//!
//! Each loss is a [`Function`]: `forward` computes the scalar and stashes the
//! selected positives and active hinge weights in a [`FunctionContext`],
//! `backward` turns them into gradients for every embedding tensor. The
//! training loop owns what happens to those gradients afterwards.

pub mod function;
pub mod gradcheck;

pub use function::{Function, FunctionContext};
pub use gradcheck::{gradcheck, numerical_gradient, GradCheckReport};

use crate::{
    data::{BatchGradients, EmbeddingBatch},
    error::MetricResult,
    tensor::Element,
};

/// Scalar loss together with its gradients
#[derive(Debug, Clone, PartialEq)]
pub struct LossOutput<T: Element> {
    pub loss: T,
    pub gradients: BatchGradients<T>,
}

/// Run forward then backward with a unit output gradient
pub fn evaluate<T, F>(function: &F, batch: &EmbeddingBatch<T>) -> MetricResult<LossOutput<T>>
where
    T: Element,
    F: Function<T> + ?Sized,
{
    let mut ctx = FunctionContext::new();
    let loss = function.forward(batch, &mut ctx)?;
    let gradients = function.backward(batch, &ctx, T::one())?;
    Ok(LossOutput { loss, gradients })
}
