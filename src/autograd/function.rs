//! Function trait and context for automatic differentiation

use std::any::Any;

use crate::{
    data::{BatchGradients, EmbeddingBatch},
    error::{MetricError, MetricResult},
    tensor::{Element, Shape},
};

/// Context passed from `forward` to `backward`.
///
/// Holds whatever intermediate values a function needs to compute its
/// gradients, plus the input shapes seen during `forward` so a stale context
/// is not applied to a different batch.
#[derive(Debug, Default)]
pub struct FunctionContext {
    saved_values: Vec<Box<dyn Any + Send + Sync>>,
    input_shapes: Vec<Vec<usize>>,
}

impl FunctionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save a value for the backward pass
    pub fn save_for_backward<V>(&mut self, value: V)
    where
        V: Any + Send + Sync,
    {
        self.saved_values.push(Box::new(value));
    }

    /// Get saved value with type checking
    pub fn get_saved<V>(&self, index: usize) -> Option<&V>
    where
        V: Any,
    {
        self.saved_values.get(index)?.downcast_ref()
    }

    /// Number of saved values
    pub fn saved_len(&self) -> usize {
        self.saved_values.len()
    }

    /// Save input shape
    pub fn save_input_shape(&mut self, shape: &[usize]) {
        self.input_shapes.push(shape.to_vec());
    }

    /// Get saved input shape
    pub fn get_input_shape(&self, index: usize) -> Option<&[usize]> {
        self.input_shapes.get(index).map(|v| v.as_slice())
    }

    /// Record the shapes of every tensor in `batch`
    pub fn save_batch_shapes<T: Element>(&mut self, batch: &EmbeddingBatch<T>) {
        self.save_input_shape(batch.query.shape().as_slice());
        self.save_input_shape(batch.positives.shape().as_slice());
        self.save_input_shape(batch.negatives.shape().as_slice());
        if let Some(other) = &batch.other_neg {
            self.save_input_shape(other.shape().as_slice());
        }
    }

    /// Fail unless `batch` has the shapes recorded by `save_batch_shapes`
    pub fn check_batch_shapes<T: Element>(&self, function: &str, batch: &EmbeddingBatch<T>) -> MetricResult<()> {
        let mut current: Vec<Shape<3>> = vec![
            batch.query.shape(),
            batch.positives.shape(),
            batch.negatives.shape(),
        ];
        if let Some(other) = &batch.other_neg {
            current.push(other.shape());
        }
        let matches = current.len() == self.input_shapes.len()
            && current
                .iter()
                .zip(self.input_shapes.iter())
                .all(|(shape, saved)| shape.as_slice() == saved.as_slice());
        if matches {
            Ok(())
        } else {
            Err(MetricError::InvalidState(format!(
                "{}: backward called with a batch whose shapes differ from forward ({:?})",
                function, self.input_shapes
            )))
        }
    }

    pub fn clear(&mut self) {
        self.saved_values.clear();
        self.input_shapes.clear();
    }
}

/// A scalar-valued differentiable function of an embedding batch
pub trait Function<T: Element>: Send + Sync {
    /// Forward pass - compute the scalar output, saving what backward needs in `ctx`
    fn forward(&self, batch: &EmbeddingBatch<T>, ctx: &mut FunctionContext) -> MetricResult<T>;

    /// Backward pass - gradients of `grad_output * output` with respect to every input tensor
    fn backward(
        &self,
        batch: &EmbeddingBatch<T>,
        ctx: &FunctionContext,
        grad_output: T,
    ) -> MetricResult<BatchGradients<T>>;

    /// Get function name for debugging
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn batch(batch_size: usize) -> EmbeddingBatch<f64> {
        EmbeddingBatch::new(
            Tensor::zeros(Shape::new([batch_size, 1, 3])),
            Tensor::zeros(Shape::new([batch_size, 2, 3])),
            Tensor::zeros(Shape::new([batch_size, 4, 3])),
        )
    }

    #[test]
    fn test_saved_values_are_typed() {
        let mut ctx = FunctionContext::new();
        ctx.save_for_backward(vec![1usize, 2, 3]);
        ctx.save_for_backward(0.5f64);

        assert_eq!(ctx.saved_len(), 2);
        assert_eq!(ctx.get_saved::<Vec<usize>>(0), Some(&vec![1, 2, 3]));
        assert_eq!(ctx.get_saved::<f64>(1), Some(&0.5));
        assert!(ctx.get_saved::<f32>(1).is_none());
        assert!(ctx.get_saved::<f64>(2).is_none());
    }

    #[test]
    fn test_batch_shape_check() {
        let mut ctx = FunctionContext::new();
        ctx.save_batch_shapes(&batch(2));
        assert_eq!(ctx.get_input_shape(2), Some(&[2usize, 4, 3][..]));
        assert!(ctx.check_batch_shapes("test", &batch(2)).is_ok());
        assert!(matches!(
            ctx.check_batch_shapes("test", &batch(3)),
            Err(MetricError::InvalidState(_))
        ));

        ctx.clear();
        assert_eq!(ctx.saved_len(), 0);
        assert!(ctx.check_batch_shapes("test", &batch(2)).is_err());
    }
}
