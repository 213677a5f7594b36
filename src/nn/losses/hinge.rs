//! Margin-hinge batch reduction shared by the triplet and quadruplet losses

use crate::{
    config::LossPolicy,
    error::{MetricError, MetricResult},
    tensor::{Element, Shape, Tensor},
};

/// Threshold above which a per-query loss counts as a hard example, and the
/// stabiliser added to the hard-example count. A batch without hard examples
/// reduces to `0 / HARD_EXAMPLE_EPS == 0`.
pub const HARD_EXAMPLE_EPS: f64 = 1e-16;

/// How the hinge terms of one query are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateReduction {
    /// Every violating candidate contributes
    Sum,
    /// Only the worst violation counts
    Max,
}

/// How per-query losses are combined into the batch loss
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchReduction {
    /// Unweighted mean over all queries
    Mean,
    /// Sum divided by the number of queries with non-zero loss
    HardMean,
}

impl LossPolicy {
    pub fn candidate_reduction(&self) -> CandidateReduction {
        if self.lazy { CandidateReduction::Max } else { CandidateReduction::Sum }
    }

    pub fn batch_reduction(&self) -> BatchReduction {
        if self.ignore_zero_loss { BatchReduction::HardMean } else { BatchReduction::Mean }
    }
}

/// Result of [`margin_hinge`]
#[derive(Debug, Clone, PartialEq)]
pub struct HingeReduction<T: Element> {
    /// Batch loss
    pub loss: T,
    /// Loss of each query after the candidate reduction, shape (batch,)
    pub per_query: Tensor<T, 1>,
    /// d loss / d (margin + anchor - candidate) for every pair, shape (batch, n).
    /// Zero for inactive hinges and, with the max reduction, for every
    /// candidate but the selected one.
    pub pair_weights: Tensor<T, 2>,
    /// Number of queries whose loss exceeds [`HARD_EXAMPLE_EPS`]
    pub hard_queries: usize,
}

/// `max(0, margin + anchor[b] - candidates[b, n])`, reduced per query and then over the batch.
///
/// `anchor` has shape (batch,) and `candidates` (batch, n); `margin` must be
/// non-negative. Only `lazy` and `ignore_zero_loss` of `policy` apply here.
pub fn margin_hinge<T: Element>(
    anchor: &Tensor<T, 1>,
    candidates: &Tensor<T, 2>,
    margin: T,
    policy: LossPolicy,
) -> MetricResult<HingeReduction<T>> {
    let batch = anchor.shape().len();
    let shape = candidates.shape();
    if shape.rows() != batch {
        return Err(MetricError::shape_error(
            &format!("{} candidate rows", batch),
            &format!("{} rows", shape.rows()),
            Some("anchor and candidate distances must share the batch dimension"),
        ));
    }
    if batch == 0 || shape.cols() == 0 {
        return Err(MetricError::shape_error(
            "a non-empty (batch, n) distance matrix",
            &shape.to_string(),
            None,
        ));
    }

    let reduction = policy.candidate_reduction();
    let mut per_query = Vec::with_capacity(batch);
    // candidates that receive gradient: active hinges kept by the reduction
    let mut active: Vec<Vec<usize>> = Vec::with_capacity(batch);

    for b in 0..batch {
        let base = margin + anchor.get(b);
        let hinge = candidates.row(b).iter().map(|&c| (base - c).max_of(T::zero()));
        match reduction {
            CandidateReduction::Sum => {
                let mut total = T::zero();
                let mut selected = Vec::new();
                for (k, h) in hinge.enumerate() {
                    if h > T::zero() {
                        selected.push(k);
                    }
                    total += h;
                }
                per_query.push(total);
                active.push(selected);
            }
            CandidateReduction::Max => {
                let mut worst = T::zero();
                let mut worst_index = None;
                for (k, h) in hinge.enumerate() {
                    if h > worst {
                        worst = h;
                        worst_index = Some(k);
                    }
                }
                per_query.push(worst);
                active.push(worst_index.into_iter().collect());
            }
        }
    }

    let total: T = per_query.iter().copied().sum();
    let eps = T::from_f64(HARD_EXAMPLE_EPS);
    let hard_queries = per_query.iter().filter(|&&l| l > eps).count();
    let denominator = match policy.batch_reduction() {
        BatchReduction::Mean => T::from_usize(batch),
        BatchReduction::HardMean => T::from_usize(hard_queries) + eps,
    };
    let loss = total / denominator;
    let scale = T::one() / denominator;

    let mut pair_weights = Tensor::zeros(shape);
    for (b, selected) in active.iter().enumerate() {
        let row = pair_weights.row_mut(b);
        for &k in selected {
            row[k] = scale;
        }
    }

    Ok(HingeReduction {
        loss,
        per_query: Tensor::from_vec(per_query, Shape::new([batch]))?,
        pair_weights,
        hard_queries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor(values: &[f64]) -> Tensor<f64, 1> {
        Tensor::from_vec(values.to_vec(), Shape::new([values.len()])).unwrap()
    }

    fn distances(rows: Vec<Vec<f64>>) -> Tensor<f64, 2> {
        Tensor::from_rows(rows).unwrap()
    }

    #[test]
    fn test_sum_and_max_reduction() {
        let a = anchor(&[4.0]);
        let c = distances(vec![vec![2.0, 1.0]]);

        let sum = margin_hinge(&a, &c, 0.3, LossPolicy::default()).unwrap();
        assert!((sum.loss - 5.6).abs() < 1e-12);
        assert_eq!(sum.pair_weights.row(0), &[1.0, 1.0]);

        let max = margin_hinge(&a, &c, 0.3, LossPolicy::new().with_lazy(true)).unwrap();
        assert!((max.loss - 3.3).abs() < 1e-12);
        assert_eq!(max.pair_weights.row(0), &[0.0, 1.0]);
    }

    #[test]
    fn test_mean_over_batch() {
        let a = anchor(&[1.0, 0.0]);
        let c = distances(vec![vec![0.5, 3.0], vec![2.0, 2.0]]);
        let out = margin_hinge(&a, &c, 1.0, LossPolicy::default()).unwrap();
        // row 0: 1.5 + 0, row 1: 0 + 0
        assert!((out.loss - 0.75).abs() < 1e-12);
        assert_eq!(out.per_query.as_slice(), &[1.5, 0.0]);
        assert_eq!(out.hard_queries, 1);
        assert_eq!(out.pair_weights.row(0), &[0.5, 0.0]);
        assert_eq!(out.pair_weights.row(1), &[0.0, 0.0]);
    }

    #[test]
    fn test_hard_mean_ignores_easy_queries() {
        let a = anchor(&[1.0, 0.0, 1.0]);
        let c = distances(vec![vec![0.5], vec![5.0], vec![1.0]]);
        let policy = LossPolicy::new().with_ignore_zero_loss(true);
        let out = margin_hinge(&a, &c, 1.0, policy).unwrap();
        // per query 1.5, 0, 1.0 -> 2.5 / 2
        assert_eq!(out.hard_queries, 2);
        assert!((out.loss - 1.25).abs() < 1e-12);
        assert!((out.pair_weights.get(0, 0) - 0.5).abs() < 1e-12);
        assert_eq!(out.pair_weights.get(1, 0), 0.0);
    }

    #[test]
    fn test_hard_mean_without_hard_examples_is_zero() {
        let a = anchor(&[0.0, 0.0]);
        let c = distances(vec![vec![10.0, 20.0], vec![30.0, 40.0]]);
        let policy = LossPolicy::new().with_ignore_zero_loss(true);
        for lazy in [false, true] {
            let out = margin_hinge(&a, &c, 0.5, policy.with_lazy(lazy)).unwrap();
            assert!(out.loss.is_finite());
            assert!(out.loss.abs() < 1e-10);
            assert_eq!(out.hard_queries, 0);
            assert!(out.pair_weights.as_slice().iter().all(|&w| w == 0.0));
        }
    }

    #[test]
    fn test_anchor_gradient_is_row_sum_of_weights() {
        let a = anchor(&[4.0]);
        let c = distances(vec![vec![2.0, 1.0, 9.0]]);
        let out = margin_hinge(&a, &c, 0.3, LossPolicy::default()).unwrap();
        assert_eq!(out.pair_weights.row(0), &[1.0, 1.0, 0.0]);
        assert_eq!(crate::tensor::ops::sum_rows(&out.pair_weights).as_slice(), &[2.0]);
    }

    #[test]
    fn test_f32_hard_mean_without_hard_examples() {
        let a = Tensor::<f32, 1>::from_vec(vec![0.0], Shape::new([1])).unwrap();
        let c = Tensor::<f32, 2>::from_rows(vec![vec![3.0]]).unwrap();
        let out = margin_hinge(&a, &c, 0.3, LossPolicy::new().with_ignore_zero_loss(true)).unwrap();
        assert_eq!(out.loss, 0.0);
    }

    #[test]
    fn test_rejects_mismatched_rows() {
        let a = anchor(&[1.0, 2.0]);
        let c = distances(vec![vec![1.0]]);
        assert!(matches!(
            margin_hinge(&a, &c, 0.1, LossPolicy::default()),
            Err(MetricError::ShapeError(_))
        ));
    }
}
