//! Metric-learning losses for place-recognition embeddings
//!
//! Every loss here compares one query embedding per batch row against sets of
//! positives and negatives, shape (batch, 1, dim), (batch, num_pos, dim) and
//! (batch, num_neg, dim). The quadruplet loss also takes one `other_neg` per
//! row. Losses implement [`Function`], so gradients come from the same object
//! that computes the forward value.

pub mod hinge;
pub mod positive;
pub mod quadruplet;
pub mod ranking;
pub mod regression;

pub use hinge::{margin_hinge, BatchReduction, CandidateReduction, HingeReduction, HARD_EXAMPLE_EPS};
pub use positive::{select_positive, PositiveSelection};
pub use quadruplet::{quadruplet_loss, quadruplet_loss_unreduced, QuadrupletLoss, UnreducedQuadruplet};
pub use ranking::{triplet_loss, TripletLoss};
pub use regression::{pose_loss, PoseLoss};

use crate::{
    autograd::{evaluate, Function, LossOutput},
    config::{LossConfig, LossKind, LossPolicy, DEFAULT_QUADRUPLET_M1, DEFAULT_QUADRUPLET_M2, DEFAULT_TRIPLET_MARGIN},
    data::EmbeddingBatch,
    error::{ErrorContext, MetricError, MetricResult, WithContext},
    tensor::{Element, Tensor},
};

/// Base trait for the embedding losses
pub trait Loss<T: Element>: Function<T> {
    /// Reduction flags the loss was built with
    fn policy(&self) -> LossPolicy;

    /// Loss value and gradients for every embedding tensor in `batch`
    fn compute(&self, batch: &EmbeddingBatch<T>) -> MetricResult<LossOutput<T>> {
        evaluate(self, batch)
    }
}

/// Check that `query` holds one embedding per row and that every other tensor
/// shares its batch size and embedding dimension.
pub(crate) fn validate_embeddings<T: Element>(
    operation: &str,
    query: &Tensor<T, 3>,
    others: &[(&str, &Tensor<T, 3>)],
    other_neg: Option<&Tensor<T, 3>>,
) -> MetricResult<()> {
    let context = || {
        let mut context = ErrorContext::new(operation).with_shape("query", query.shape());
        for (name, tensor) in others {
            context = context.with_shape(name, tensor.shape());
        }
        if let Some(other) = other_neg {
            context = context.with_shape("other_neg", other.shape());
        }
        context
    };

    let q = query.shape();
    if !q.is_valid() || q.count() != 1 {
        return Err::<(), _>(MetricError::shape_error(
            "query of shape [batch, 1, dim] with batch, dim > 0",
            &q.to_string(),
            Some("the query holds exactly one embedding per batch row"),
        ))
        .with_context(context);
    }

    for (name, tensor) in others {
        let s = tensor.shape();
        if s.batch() != q.batch() || s.dim() != q.dim() || s.count() == 0 {
            return Err::<(), _>(MetricError::shape_error(
                &format!("{} of shape [{}, n, {}] with n > 0", name, q.batch(), q.dim()),
                &s.to_string(),
                None,
            ))
            .with_context(context);
        }
    }

    if let Some(other) = other_neg {
        let s = other.shape();
        if s.batch() != q.batch() || s.dim() != q.dim() || s.count() != 1 {
            return Err::<(), _>(MetricError::shape_error(
                &format!("other_neg of shape [{}, 1, {}]", q.batch(), q.dim()),
                &s.to_string(),
                None,
            ))
            .with_context(|| context().with_suggestion("pair every query with exactly one other negative"));
        }
    }

    tracing::trace!("{}: query {}, {} other tensors validated", operation, q, others.len());
    Ok(())
}

/// Builds losses from configuration or by name
pub struct LossFactory;

impl LossFactory {
    /// Build the loss a [`LossConfig`] describes
    pub fn create<T: Element>(config: &LossConfig) -> MetricResult<Box<dyn Loss<T>>> {
        config.validate()?;
        tracing::debug!("creating {} loss with {:?}", config.loss.name(), config.policy);
        match config.loss {
            LossKind::Triplet { margin } => Ok(Box::new(TripletLoss::new(margin, config.policy)?)),
            LossKind::Quadruplet { m1, m2 } => Ok(Box::new(QuadrupletLoss::new(m1, m2, config.policy)?)),
        }
    }

    /// Build a loss by name with its default margins
    pub fn create_by_name<T: Element>(name: &str, policy: LossPolicy) -> MetricResult<Box<dyn Loss<T>>> {
        let config = match name.to_lowercase().as_str() {
            "triplet" => LossConfig::triplet(DEFAULT_TRIPLET_MARGIN, policy),
            "quadruplet" => LossConfig::quadruplet(DEFAULT_QUADRUPLET_M1, DEFAULT_QUADRUPLET_M2, policy),
            _ => return Err(MetricError::InvalidInput(format!("Unknown loss function: {}", name))),
        };
        Self::create(&config)
    }

    /// List all available loss functions
    pub fn available_losses() -> Vec<&'static str> {
        vec!["triplet", "quadruplet"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{data::BatchLayout, tensor::Shape};
    use rand::{rngs::StdRng, SeedableRng};

    fn batch(with_other_neg: bool) -> EmbeddingBatch<f64> {
        let layout = BatchLayout {
            batch_size: 3,
            num_pos: 2,
            num_neg: 3,
            dim: 4,
            with_other_neg,
        };
        EmbeddingBatch::random(layout, &mut StdRng::seed_from_u64(3))
    }

    #[test]
    fn test_loss_factory() {
        let loss = LossFactory::create_by_name::<f64>("Triplet", LossPolicy::default()).unwrap();
        assert_eq!(loss.name(), "TripletLoss");
        assert_eq!(loss.policy(), LossPolicy::default());

        let policy = LossPolicy::new().with_lazy(true);
        let loss = LossFactory::create_by_name::<f64>("quadruplet", policy).unwrap();
        assert_eq!(loss.name(), "QuadrupletLoss");
        assert_eq!(loss.policy(), policy);
    }

    #[test]
    fn test_unknown_loss_name() {
        assert!(matches!(
            LossFactory::create_by_name::<f32>("contrastive", LossPolicy::default()),
            Err(MetricError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_available_losses() {
        let losses = LossFactory::available_losses();
        assert_eq!(losses, vec!["triplet", "quadruplet"]);
        for name in losses {
            assert!(LossFactory::create_by_name::<f64>(name, LossPolicy::default()).is_ok());
        }
    }

    #[test]
    fn test_create_rejects_bad_margins() {
        let config = LossConfig::quadruplet(0.5, f64::NAN, LossPolicy::default());
        assert!(matches!(
            LossFactory::create::<f64>(&config),
            Err(MetricError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_factory_loss_matches_free_functions() {
        let b = batch(true);
        let other = b.other_neg.clone().unwrap();
        for policy in LossPolicy::all() {
            let triplet = LossFactory::create::<f64>(&LossConfig::triplet(0.3, policy)).unwrap();
            let out = triplet.compute(&b).unwrap();
            assert_eq!(out.loss, triplet_loss(&b.query, &b.positives, &b.negatives, 0.3, policy).unwrap());
            assert!(out.gradients.other_neg.is_some());

            let quadruplet = LossFactory::create::<f64>(&LossConfig::quadruplet(0.5, 0.2, policy)).unwrap();
            let out = quadruplet.compute(&b).unwrap();
            let expected = quadruplet_loss(&b.query, &b.positives, &b.negatives, &other, 0.5, 0.2, policy).unwrap();
            assert_eq!(out.loss, expected);
        }
    }

    #[test]
    fn test_triplet_leaves_other_neg_gradient_zero() {
        let b = batch(true);
        let loss = LossFactory::create_by_name::<f64>("triplet", LossPolicy::default()).unwrap();
        let out = loss.compute(&b).unwrap();
        let grad = out.gradients.other_neg.unwrap();
        assert!(grad.as_slice().iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_validate_embeddings() {
        let b = batch(true);
        let other = b.other_neg.as_ref();
        assert!(validate_embeddings("t", &b.query, &[("positives", &b.positives)], other).is_ok());

        let two_queries = Tensor::<f64, 3>::zeros(Shape::new([3, 2, 4]));
        let err = validate_embeddings("t", &two_queries, &[], None).unwrap_err();
        match err {
            MetricError::ShapeError(msg) => {
                assert!(msg.contains("Operation: t"));
                assert!(msg.contains("query=[3, 2, 4]"));
            }
            other => panic!("unexpected error {:?}", other),
        }

        let bad_other = Tensor::<f64, 3>::zeros(Shape::new([3, 2, 4]));
        let err = validate_embeddings("t", &b.query, &[], Some(&bad_other)).unwrap_err();
        assert!(matches!(err, MetricError::ShapeError(msg) if msg.contains("exactly one other negative")));
        let empty_batch = Tensor::<f64, 3>::zeros(Shape::new([0, 1, 4]));
        assert!(validate_embeddings("t", &empty_batch, &[], None).is_err());
    }
}
