//! Core tensor types and fundamental operations

use std::{
    fmt::{self, Debug, Display},
    iter::Sum,
    ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign},
};
use serde::{Deserialize, Serialize};

use crate::error::{MetricError, MetricResult};

/// Compile-time rank with const generics for type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape<const DIMS: usize> {
    pub dims: [usize; DIMS],
}

impl<const DIMS: usize> Shape<DIMS> {
    pub fn new(dims: [usize; DIMS]) -> Self {
        Self { dims }
    }

    pub fn total_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// A shape is valid when no axis is empty
    pub fn is_valid(&self) -> bool {
        self.dims.iter().all(|&d| d > 0)
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.dims
    }
}

impl Shape<1> {
    pub fn len(&self) -> usize { self.dims[0] }
    pub fn is_empty(&self) -> bool { self.dims[0] == 0 }
}

impl Shape<2> {
    pub fn rows(&self) -> usize { self.dims[0] }
    pub fn cols(&self) -> usize { self.dims[1] }
}

/// Embedding sets are laid out as (batch, count, dim)
impl Shape<3> {
    pub fn batch(&self) -> usize { self.dims[0] }
    pub fn count(&self) -> usize { self.dims[1] }
    pub fn dim(&self) -> usize { self.dims[2] }
}

impl<const DIMS: usize> Display for Shape<DIMS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.dims.iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(", "))
    }
}

/// Floating point data types supported by the loss kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
}

impl DType {
    /// Get the size in bytes of this data type
    pub const fn size(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DType::F32 => "float32",
            DType::F64 => "float64",
        }
    }
}

/// Scalar element stored in a [`Tensor`].
pub trait Element:
    Copy
    + Default
    + Debug
    + Display
    + PartialOrd
    + Send
    + Sync
    + Sum
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + SubAssign
    + 'static
{
    const DTYPE: DType;

    fn zero() -> Self;
    fn one() -> Self;
    fn from_f64(value: f64) -> Self;
    fn to_f64(self) -> f64;
    fn is_finite(self) -> bool;

    fn from_usize(value: usize) -> Self {
        Self::from_f64(value as f64)
    }

    fn two() -> Self {
        Self::one() + Self::one()
    }

    fn max_of(self, other: Self) -> Self {
        if other > self { other } else { self }
    }

    fn abs(self) -> Self {
        if self < Self::zero() { -self } else { self }
    }
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            #[inline]
            fn zero() -> Self { 0.0 }
            #[inline]
            fn one() -> Self { 1.0 }
            #[inline]
            fn from_f64(value: f64) -> Self { value as $ty }
            #[inline]
            fn to_f64(self) -> f64 { self as f64 }
            #[inline]
            fn is_finite(self) -> bool { <$ty>::is_finite(self) }
        }
    };
}

impl_element!(f32, DType::F32);
impl_element!(f64, DType::F64);

/// Dense row-major tensor with a compile-time rank
#[derive(Clone, PartialEq)]
pub struct Tensor<T: Element, const DIMS: usize> {
    data: Vec<T>,
    shape: Shape<DIMS>,
}

impl<T: Element, const DIMS: usize> Tensor<T, DIMS> {
    /// Zero-filled tensor
    pub fn zeros(shape: Shape<DIMS>) -> Self {
        Self {
            data: vec![T::zero(); shape.total_elements()],
            shape,
        }
    }

    /// Fill every flat index with `f(index)`
    pub fn from_fn(shape: Shape<DIMS>, f: impl FnMut(usize) -> T) -> Self {
        Self {
            data: (0..shape.total_elements()).map(f).collect(),
            shape,
        }
    }

    /// Create from a flat row-major vector
    pub fn from_vec(data: Vec<T>, shape: Shape<DIMS>) -> MetricResult<Self> {
        if data.len() != shape.total_elements() {
            return Err(MetricError::shape_error(
                &format!("{} elements for shape {}", shape.total_elements(), shape),
                &format!("{} elements", data.len()),
                None,
            ));
        }
        Ok(Self { data, shape })
    }

    pub fn shape(&self) -> Shape<DIMS> {
        self.shape
    }

    pub fn dtype(&self) -> DType {
        T::DTYPE
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_slice_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Euclidean norm of the flattened tensor
    pub fn l2_norm(&self) -> f64 {
        self.data.iter().map(|v| v.to_f64() * v.to_f64()).sum::<f64>().sqrt()
    }

    /// Largest element-wise absolute difference to a tensor of the same shape
    pub fn max_abs_diff(&self, other: &Self) -> MetricResult<f64> {
        if self.shape != other.shape {
            return Err(MetricError::shape_error(
                &self.shape.to_string(),
                &other.shape.to_string(),
                None,
            ));
        }
        Ok(self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| (a.to_f64() - b.to_f64()).abs())
            .fold(0.0, f64::max))
    }
}

impl<T: Element> Tensor<T, 1> {
    pub fn get(&self, index: usize) -> T {
        self.data[index]
    }
}

impl<T: Element> Tensor<T, 2> {
    pub fn row(&self, row: usize) -> &[T] {
        let cols = self.shape.cols();
        &self.data[row * cols..(row + 1) * cols]
    }

    pub fn row_mut(&mut self, row: usize) -> &mut [T] {
        let cols = self.shape.cols();
        &mut self.data[row * cols..(row + 1) * cols]
    }

    pub fn get(&self, row: usize, col: usize) -> T {
        self.data[row * self.shape.cols() + col]
    }

    /// Build from one inner vector per row; every row must have the same length
    pub fn from_rows(rows: Vec<Vec<T>>) -> MetricResult<Self> {
        let cols = rows.first().map(Vec::len).unwrap_or(0);
        let shape = Shape::new([rows.len(), cols]);
        let mut data = Vec::with_capacity(shape.total_elements());
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != cols {
                return Err(MetricError::shape_error(
                    &format!("{} columns in row {}", cols, i),
                    &format!("{} columns", row.len()),
                    Some("nested input must be rectangular"),
                ));
            }
            data.extend(row);
        }
        Self::from_vec(data, shape)
    }
}

impl<T: Element> Tensor<T, 3> {
    /// Embedding vector `item` of batch row `batch`
    pub fn vector(&self, batch: usize, item: usize) -> &[T] {
        let dim = self.shape.dim();
        let start = (batch * self.shape.count() + item) * dim;
        &self.data[start..start + dim]
    }

    pub fn vector_mut(&mut self, batch: usize, item: usize) -> &mut [T] {
        let dim = self.shape.dim();
        let start = (batch * self.shape.count() + item) * dim;
        &mut self.data[start..start + dim]
    }

    /// Build from `[batch][count][dim]` nested vectors
    pub fn from_nested(nested: Vec<Vec<Vec<T>>>) -> MetricResult<Self> {
        let count = nested.first().map(Vec::len).unwrap_or(0);
        let dim = nested
            .first()
            .and_then(|items| items.first())
            .map(Vec::len)
            .unwrap_or(0);
        let shape = Shape::new([nested.len(), count, dim]);
        let mut data = Vec::with_capacity(shape.total_elements());
        for (b, items) in nested.into_iter().enumerate() {
            if items.len() != count {
                return Err(MetricError::shape_error(
                    &format!("{} embeddings in batch row {}", count, b),
                    &format!("{} embeddings", items.len()),
                    Some("nested input must be rectangular"),
                ));
            }
            for (i, vector) in items.into_iter().enumerate() {
                if vector.len() != dim {
                    return Err(MetricError::shape_error(
                        &format!("dim {} at [{}][{}]", dim, b, i),
                        &format!("dim {}", vector.len()),
                        Some("nested input must be rectangular"),
                    ));
                }
                data.extend(vector);
            }
        }
        Self::from_vec(data, shape)
    }
}

impl<T: Element, const DIMS: usize> Debug for Tensor<T, DIMS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype())
            .field("data", &self.data)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_creation() {
        let shape = Shape::new([2, 3, 4]);
        assert_eq!(shape.total_elements(), 24);
        assert!(shape.is_valid());
        assert_eq!((shape.batch(), shape.count(), shape.dim()), (2, 3, 4));
        assert_eq!(shape.to_string(), "[2, 3, 4]");
    }

    #[test]
    fn test_shape_with_empty_axis_is_invalid() {
        assert!(!Shape::new([2, 0, 4]).is_valid());
    }

    #[test]
    fn test_tensor_from_vec_checks_length() {
        let ok = Tensor::<f32, 2>::from_vec(vec![1.0, 2.0, 3.0, 4.0], Shape::new([2, 2]));
        assert!(ok.is_ok());

        let err = Tensor::<f32, 2>::from_vec(vec![1.0, 2.0, 3.0], Shape::new([2, 2]));
        assert!(matches!(err, Err(MetricError::ShapeError(_))));
    }

    #[test]
    fn test_from_nested_layout() {
        let t = Tensor::<f64, 3>::from_nested(vec![
            vec![vec![1.0, 2.0], vec![3.0, 4.0]],
            vec![vec![5.0, 6.0], vec![7.0, 8.0]],
        ])
        .unwrap();
        assert_eq!(t.shape(), Shape::new([2, 2, 2]));
        assert_eq!(t.vector(1, 0), &[5.0, 6.0]);
        assert_eq!(t.vector(0, 1), &[3.0, 4.0]);
    }

    #[test]
    fn test_from_nested_rejects_ragged() {
        let err = Tensor::<f64, 3>::from_nested(vec![
            vec![vec![1.0, 2.0]],
            vec![vec![5.0]],
        ]);
        assert!(matches!(err, Err(MetricError::ShapeError(_))));
    }

    #[test]
    fn test_norm_and_diff() {
        let a = Tensor::<f64, 1>::from_vec(vec![3.0, 4.0], Shape::new([2])).unwrap();
        let b = Tensor::<f64, 1>::from_vec(vec![3.0, 3.5], Shape::new([2])).unwrap();
        assert!((a.l2_norm() - 5.0).abs() < 1e-12);
        assert!((a.max_abs_diff(&b).unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_dtype_features() {
        assert_eq!(<f32 as Element>::DTYPE.size(), 4);
        assert_eq!(<f64 as Element>::DTYPE.name(), "float64");
    }
}
