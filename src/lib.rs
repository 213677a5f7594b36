//! Anvil Metric - metric-learning losses for place recognition
//!
//! Features:
//! - Triplet and quadruplet margin losses with hardest-positive anchoring
//! - Lazy (worst-negative) and hard-example batch reductions
//! - Hand-written backward passes with a finite-difference gradient checker
//! - JSON batch and loss configuration files
//! - Parallel distance kernels behind the `parallel` feature

pub mod autograd;
pub mod config;
pub mod data;
pub mod error;
pub mod nn;
pub mod tensor;

pub use autograd::{evaluate, gradcheck, Function, FunctionContext, GradCheckReport, LossOutput};
pub use config::{LossConfig, LossKind, LossPolicy};
pub use data::{BatchField, BatchGradients, BatchLayout, EmbeddingBatch};
pub use error::{MetricError, MetricResult};
pub use nn::losses::{
    pose_loss, quadruplet_loss, quadruplet_loss_unreduced, select_positive, triplet_loss, Loss,
    LossFactory, PoseLoss, QuadrupletLoss, TripletLoss, UnreducedQuadruplet,
};
pub use tensor::{DType, Element, Shape, Tensor};

use std::sync::Once;

static INIT: Once = Once::new();

/// Install the default tracing subscriber. Safe to call more than once; a
/// subscriber installed by the host application is left alone.
pub fn init() {
    INIT.call_once(|| {
        if tracing_subscriber::fmt::try_init().is_ok() {
            tracing::info!("Anvil Metric {} initialized", version());
        }
    });
}

/// Get the current crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        init();
        init();
        tracing::info!("subscriber installed once");
    }

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }

    #[test]
    fn test_top_level_api() {
        let q = Tensor::<f32, 3>::from_nested(vec![vec![vec![0.0, 0.0]]]).unwrap();
        let p = Tensor::from_nested(vec![vec![vec![1.0, 0.0], vec![0.0, 2.0]]]).unwrap();
        let n = Tensor::from_nested(vec![vec![vec![1.0, 1.0], vec![0.0, 0.5]]]).unwrap();
        let loss = triplet_loss(&q, &p, &n, 0.3, LossPolicy::default()).unwrap();
        // farthest positive 4; negatives at 2 and 0.25
        assert!((loss - 6.35).abs() < 1e-5);
    }
}
