//! Pose regression against the embedding distances

use crate::{
    error::{MetricError, MetricResult},
    tensor::{Element, Shape, Tensor},
};

/// Mean absolute error between a (batch, num_pos + num_neg) prediction and the
/// query's positive and negative distances laid side by side.
///
/// Training scripts use it as an auxiliary head that regresses the distances
/// the metric loss works on.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoseLoss;

impl PoseLoss {
    pub fn new() -> Self {
        Self
    }

    /// `concat(pos_dist, neg_dist)` along the candidate axis
    pub fn target<T: Element>(pos_dist: &Tensor<T, 2>, neg_dist: &Tensor<T, 2>) -> MetricResult<Tensor<T, 2>> {
        let (p, n) = (pos_dist.shape(), neg_dist.shape());
        if p.rows() != n.rows() {
            return Err(MetricError::shape_error(
                &format!("neg_dist with {} rows", p.rows()),
                &n.to_string(),
                Some("positive and negative distances must share the batch dimension"),
            ));
        }
        let rows: Vec<Vec<T>> = (0..p.rows())
            .map(|r| pos_dist.row(r).iter().chain(neg_dist.row(r)).copied().collect())
            .collect();
        if rows.is_empty() {
            return Ok(Tensor::zeros(Shape::new([0, p.cols() + n.cols()])));
        }
        Tensor::from_rows(rows)
    }

    fn checked_target<T: Element>(
        pos_dist: &Tensor<T, 2>,
        neg_dist: &Tensor<T, 2>,
        predicted: &Tensor<T, 2>,
    ) -> MetricResult<Tensor<T, 2>> {
        let target = Self::target(pos_dist, neg_dist)?;
        if target.shape() != predicted.shape() {
            return Err(MetricError::shape_error(
                &format!("prediction of shape {}", target.shape()),
                &predicted.shape().to_string(),
                None,
            ));
        }
        if target.numel() == 0 {
            return Err(MetricError::shape_error("a non-empty prediction", &target.shape().to_string(), None));
        }
        Ok(target)
    }

    pub fn forward<T: Element>(
        &self,
        pos_dist: &Tensor<T, 2>,
        neg_dist: &Tensor<T, 2>,
        predicted: &Tensor<T, 2>,
    ) -> MetricResult<T> {
        let target = Self::checked_target(pos_dist, neg_dist, predicted)?;
        let total: T = predicted
            .as_slice()
            .iter()
            .zip(target.as_slice())
            .map(|(&p, &t)| (p - t).abs())
            .sum();
        Ok(total / T::from_usize(target.numel()))
    }

    /// Gradient with respect to `predicted`; zero where prediction and target agree
    pub fn backward<T: Element>(
        &self,
        pos_dist: &Tensor<T, 2>,
        neg_dist: &Tensor<T, 2>,
        predicted: &Tensor<T, 2>,
        grad_output: T,
    ) -> MetricResult<Tensor<T, 2>> {
        let target = Self::checked_target(pos_dist, neg_dist, predicted)?;
        let scale = grad_output / T::from_usize(target.numel());
        let (pred, tgt) = (predicted.as_slice(), target.as_slice());
        Ok(Tensor::from_fn(predicted.shape(), |i| {
            if pred[i] > tgt[i] {
                scale
            } else if pred[i] < tgt[i] {
                -scale
            } else {
                T::zero()
            }
        }))
    }
}

/// L1 pose loss, see [`PoseLoss`]
pub fn pose_loss<T: Element>(
    pos_dist: &Tensor<T, 2>,
    neg_dist: &Tensor<T, 2>,
    predicted: &Tensor<T, 2>,
) -> MetricResult<T> {
    PoseLoss::new().forward(pos_dist, neg_dist, predicted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pose_loss_value() {
        let pos = Tensor::<f64, 2>::from_rows(vec![vec![1.0], vec![2.0]]).unwrap();
        let neg = Tensor::from_rows(vec![vec![4.0, 5.0], vec![6.0, 7.0]]).unwrap();
        let pred = Tensor::from_rows(vec![vec![1.5, 4.0, 5.0], vec![2.0, 5.0, 7.0]]).unwrap();
        // |0.5| + |-1| over 6 entries
        let loss = pose_loss(&pos, &neg, &pred).unwrap();
        assert!((loss - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_pose_loss_gradient() {
        let pos = Tensor::<f64, 2>::from_rows(vec![vec![1.0]]).unwrap();
        let neg = Tensor::from_rows(vec![vec![4.0, 5.0]]).unwrap();
        let pred = Tensor::from_rows(vec![vec![2.0, 4.0, 3.0]]).unwrap();
        let grad = PoseLoss::new().backward(&pos, &neg, &pred, 3.0).unwrap();
        assert_eq!(grad.row(0), &[1.0, 0.0, -1.0]);
    }

    #[test]
    fn test_pose_loss_shape_errors() {
        let pos = Tensor::<f32, 2>::zeros(Shape::new([2, 1]));
        let neg = Tensor::<f32, 2>::zeros(Shape::new([2, 3]));
        let short = Tensor::<f32, 2>::zeros(Shape::new([2, 3]));
        assert!(matches!(pose_loss(&pos, &neg, &short), Err(MetricError::ShapeError(_))));

        let wrong_rows = Tensor::<f32, 2>::zeros(Shape::new([1, 3]));
        assert!(matches!(pose_loss(&pos, &wrong_rows, &short), Err(MetricError::ShapeError(_))));

        let pred = Tensor::<f32, 2>::zeros(Shape::new([2, 4]));
        assert_eq!(pose_loss(&pos, &neg, &pred).unwrap(), 0.0);
    }
}
