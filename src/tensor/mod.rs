//! Tensor types for embedding batches
//!
//! Dense, row-major, const-generic rank. Element type is `f32` or `f64`;
//! device placement is the caller's concern, the kernels here run on the host.

pub mod core;
pub mod ops;

// Re-export main types for convenience
pub use core::{DType, Element, Shape, Tensor};
