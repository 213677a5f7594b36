//! Distance kernels and row reductions used by the metric losses

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::error::{MetricError, MetricResult};
use super::core::{Element, Shape, Tensor};

/// Squared Euclidean distance between two vectors of equal length
#[inline]
pub fn squared_distance<T: Element>(a: &[T], b: &[T]) -> T {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Accumulate `coef * d||a - b||² / da` into `grad_a` and the matching term into `grad_b`.
#[inline]
pub fn accumulate_distance_grad<T: Element>(
    coef: T,
    a: &[T],
    b: &[T],
    grad_a: &mut [T],
    grad_b: &mut [T],
) {
    let scale = T::two() * coef;
    for i in 0..a.len() {
        let g = scale * (a[i] - b[i]);
        grad_a[i] += g;
        grad_b[i] -= g;
    }
}

/// Broadcast one anchor per batch row, shape (batch, 1, dim), against every
/// candidate of that row, shape (batch, n, dim). Returns (batch, n) squared distances.
pub fn broadcast_squared_distances<T: Element>(
    anchor: &Tensor<T, 3>,
    candidates: &Tensor<T, 3>,
) -> MetricResult<Tensor<T, 2>> {
    let a = anchor.shape();
    let c = candidates.shape();
    if a.count() != 1 {
        return Err(MetricError::shape_error(
            &format!("anchor of shape [{}, 1, {}]", a.batch(), a.dim()),
            &a.to_string(),
            Some("broadcasting needs exactly one anchor embedding per batch row"),
        ));
    }
    if a.batch() != c.batch() || a.dim() != c.dim() {
        return Err(MetricError::shape_error(
            &format!("candidates of shape [{}, n, {}]", a.batch(), a.dim()),
            &c.to_string(),
            None,
        ));
    }

    let count = c.count();
    let mut out = Tensor::zeros(Shape::new([c.batch(), count]));
    if count == 0 {
        return Ok(out);
    }

    let fill = |(b, row): (usize, &mut [T])| {
        let anchor_vec = anchor.vector(b, 0);
        for (j, slot) in row.iter_mut().enumerate() {
            *slot = squared_distance(anchor_vec, candidates.vector(b, j));
        }
    };

    #[cfg(feature = "parallel")]
    out.as_slice_mut().par_chunks_mut(count).enumerate().for_each(fill);

    #[cfg(not(feature = "parallel"))]
    out.as_slice_mut().chunks_mut(count).enumerate().for_each(fill);

    Ok(out)
}

/// Row-wise squared distance between two (batch, dim) matrices
pub fn paired_squared_distances<T: Element>(
    a: &Tensor<T, 2>,
    b: &Tensor<T, 2>,
) -> MetricResult<Tensor<T, 1>> {
    if a.shape() != b.shape() {
        return Err(MetricError::shape_error(&a.shape().to_string(), &b.shape().to_string(), None));
    }
    let rows = a.shape().rows();
    let data = (0..rows).map(|r| squared_distance(a.row(r), b.row(r))).collect();
    Tensor::from_vec(data, Shape::new([rows]))
}

/// Sum of every row of a (rows, cols) matrix
pub fn sum_rows<T: Element>(values: &Tensor<T, 2>) -> Tensor<T, 1> {
    let rows = values.shape().rows();
    Tensor::from_fn(Shape::new([rows]), |r| values.row(r).iter().copied().sum())
}

/// Index of the first minimum in every row
pub fn argmin_rows<T: Element>(values: &Tensor<T, 2>) -> Vec<usize> {
    (0..values.shape().rows())
        .map(|r| first_extreme(values.row(r), |candidate, best| candidate < best))
        .collect()
}

/// Index of the first maximum in every row
pub fn argmax_rows<T: Element>(values: &Tensor<T, 2>) -> Vec<usize> {
    (0..values.shape().rows())
        .map(|r| first_extreme(values.row(r), |candidate, best| candidate > best))
        .collect()
}

/// Gather one column per row
pub fn gather_rows<T: Element>(values: &Tensor<T, 2>, indices: &[usize]) -> MetricResult<Tensor<T, 1>> {
    let rows = values.shape().rows();
    if indices.len() != rows {
        return Err(MetricError::shape_error(
            &format!("{} indices", rows),
            &format!("{} indices", indices.len()),
            None,
        ));
    }
    let data = indices.iter().enumerate().map(|(r, &c)| values.get(r, c)).collect();
    Tensor::from_vec(data, Shape::new([rows]))
}

fn first_extreme<T: Element>(row: &[T], better: impl Fn(T, T) -> bool) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate().skip(1) {
        if better(v, row[best]) {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_squared_distance() {
        assert_eq!(squared_distance(&[0.0f32, 0.0], &[3.0, 4.0]), 25.0);
        assert_eq!(squared_distance(&[1.0f64], &[1.0]), 0.0);
    }

    #[test]
    fn test_broadcast_distances() {
        let anchor = Tensor::<f64, 3>::from_nested(vec![vec![vec![0.0, 0.0]], vec![vec![1.0, 1.0]]]).unwrap();
        let candidates = Tensor::<f64, 3>::from_nested(vec![
            vec![vec![1.0, 0.0], vec![0.0, 2.0], vec![3.0, 4.0]],
            vec![vec![1.0, 1.0], vec![2.0, 1.0], vec![1.0, 3.0]],
        ])
        .unwrap();
        let d = broadcast_squared_distances(&anchor, &candidates).unwrap();
        assert_eq!(d.shape(), Shape::new([2, 3]));
        assert_eq!(d.row(0), &[1.0, 4.0, 25.0]);
        assert_eq!(d.row(1), &[0.0, 1.0, 4.0]);
    }

    #[test]
    fn test_broadcast_rejects_mismatch() {
        let anchor = Tensor::<f64, 3>::zeros(Shape::new([2, 1, 3]));
        let wrong_batch = Tensor::<f64, 3>::zeros(Shape::new([3, 4, 3]));
        let wrong_dim = Tensor::<f64, 3>::zeros(Shape::new([2, 4, 2]));
        let two_anchors = Tensor::<f64, 3>::zeros(Shape::new([2, 2, 3]));
        assert!(matches!(broadcast_squared_distances(&anchor, &wrong_batch), Err(MetricError::ShapeError(_))));
        assert!(matches!(broadcast_squared_distances(&anchor, &wrong_dim), Err(MetricError::ShapeError(_))));
        assert!(matches!(broadcast_squared_distances(&two_anchors, &wrong_dim), Err(MetricError::ShapeError(_))));
    }

    #[test]
    fn test_arg_extremes_pick_first_on_ties() {
        let v = Tensor::<f32, 2>::from_rows(vec![vec![2.0, 1.0, 1.0, 3.0, 3.0], vec![5.0, 5.0, 5.0, 5.0, 5.0]]).unwrap();
        assert_eq!(argmin_rows(&v), vec![1, 0]);
        assert_eq!(argmax_rows(&v), vec![3, 0]);
        let picked = gather_rows(&v, &[3, 2]).unwrap();
        assert_eq!(picked.as_slice(), &[3.0, 5.0]);
    }

    #[test]
    fn test_distance_grad_matches_formula() {
        let a = [1.0f64, 2.0];
        let b = [0.0f64, -1.0];
        let mut ga = [0.0; 2];
        let mut gb = [0.0; 2];
        accumulate_distance_grad(0.5, &a, &b, &mut ga, &mut gb);
        assert_eq!(ga, [1.0, 3.0]);
        assert_eq!(gb, [-1.0, -3.0]);
    }

    #[test]
    fn test_paired_distances() {
        let a = Tensor::<f64, 2>::from_rows(vec![vec![0.0, 0.0], vec![1.0, 1.0]]).unwrap();
        let b = Tensor::<f64, 2>::from_rows(vec![vec![3.0, 4.0], vec![1.0, 2.0]]).unwrap();
        assert_eq!(paired_squared_distances(&a, &b).unwrap().as_slice(), &[25.0, 1.0]);
    }
}
