//! Hardest-positive selection

use crate::{
    error::{ErrorContext, MetricResult, WithContext},
    tensor::{
        ops::{argmax_rows, argmin_rows, broadcast_squared_distances, gather_rows},
        Element, Tensor,
    },
};
use super::validate_embeddings;

/// Distances from each query to its positives, with the nearest and farthest picked out
#[derive(Debug, Clone, PartialEq)]
pub struct PositiveSelection<T: Element> {
    /// (batch, num_pos) squared distances
    pub distances: Tensor<T, 2>,
    pub min: Tensor<T, 1>,
    pub max: Tensor<T, 1>,
    pub argmin: Vec<usize>,
    pub argmax: Vec<usize>,
}

impl<T: Element> PositiveSelection<T> {
    pub fn compute(query: &Tensor<T, 3>, positives: &Tensor<T, 3>) -> MetricResult<Self> {
        validate_embeddings("select_positive", query, &[("positives", positives)], None)?;
        let distances = broadcast_squared_distances(query, positives).with_context(|| {
            ErrorContext::new("select_positive")
                .with_shape("query", query.shape())
                .with_shape("positives", positives.shape())
        })?;
        let argmin = argmin_rows(&distances);
        let argmax = argmax_rows(&distances);
        let min = gather_rows(&distances, &argmin)?;
        let max = gather_rows(&distances, &argmax)?;
        Ok(Self {
            distances,
            min,
            max,
            argmin,
            argmax,
        })
    }

    /// The anchor positive distance and the index it came from.
    /// Nearest positive when `use_min`, farthest otherwise.
    pub fn into_picked(self, use_min: bool) -> (Tensor<T, 1>, Vec<usize>) {
        if use_min {
            (self.min, self.argmin)
        } else {
            (self.max, self.argmax)
        }
    }
}

/// Smallest and largest squared query-to-positive distance per query, each of shape (batch,)
pub fn select_positive<T: Element>(
    query: &Tensor<T, 3>,
    positives: &Tensor<T, 3>,
) -> MetricResult<(Tensor<T, 1>, Tensor<T, 1>)> {
    let selection = PositiveSelection::compute(query, positives)?;
    Ok((selection.min, selection.max))
}
