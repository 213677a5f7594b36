//! Quadruplet loss: the triplet hinge plus a second hinge against an unrelated negative

use crate::{
    autograd::{Function, FunctionContext},
    config::{check_margin, LossPolicy},
    data::{BatchGradients, EmbeddingBatch},
    error::{MetricError, MetricResult},
    tensor::{
        ops::{broadcast_squared_distances, paired_squared_distances, sum_rows},
        Element, Tensor,
    },
};
use super::{
    hinge::{margin_hinge, HingeReduction, HARD_EXAMPLE_EPS},
    ranking::{backprop_negatives, backprop_positive, triplet_term, TripletTerm},
    validate_embeddings, Loss,
};

/// Both hinge terms of the quadruplet loss
pub(crate) struct QuadrupletTerms<T: Element> {
    pub triplet: TripletTerm<T>,
    /// `max(0, m2 + positive[b] - ||negatives[b, k] - other_neg[b]||²)`
    pub second: HingeReduction<T>,
}

impl<T: Element> QuadrupletTerms<T> {
    pub fn loss(&self) -> T {
        self.triplet.hinge.loss + self.second.loss
    }
}

pub(crate) fn quadruplet_terms<T: Element>(
    query: &Tensor<T, 3>,
    positives: &Tensor<T, 3>,
    negatives: &Tensor<T, 3>,
    other_neg: &Tensor<T, 3>,
    m1: T,
    m2: T,
    policy: LossPolicy,
) -> MetricResult<QuadrupletTerms<T>> {
    let triplet = triplet_term(query, positives, negatives, m1, policy)?;
    let other = broadcast_squared_distances(other_neg, negatives)?;
    let second = margin_hinge(&triplet.positive, &other, m2, policy)?;
    Ok(QuadrupletTerms { triplet, second })
}

/// Quadruplet loss.
///
/// The first term is the triplet loss with margin `m1`. The second reuses the
/// same anchor positive distance but measures each negative against
/// `other_neg`, a negative unrelated to the query, with margin `m2`. Both terms
/// share the reduction policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadrupletLoss {
    m1: f64,
    m2: f64,
    policy: LossPolicy,
}

impl QuadrupletLoss {
    pub fn new(m1: f64, m2: f64, policy: LossPolicy) -> MetricResult<Self> {
        check_margin("m1", m1)?;
        check_margin("m2", m2)?;
        Ok(Self { m1, m2, policy })
    }
}

fn require_other_neg<'a, T: Element>(batch: &'a EmbeddingBatch<T>) -> MetricResult<&'a Tensor<T, 3>> {
    batch.other_neg.as_ref().ok_or_else(|| {
        MetricError::InvalidInput("quadruplet loss needs an other_neg tensor of shape (batch, 1, dim)".to_string())
    })
}

impl<T: Element> Function<T> for QuadrupletLoss {
    fn forward(&self, batch: &EmbeddingBatch<T>, ctx: &mut FunctionContext) -> MetricResult<T> {
        let other_neg = require_other_neg(batch)?;
        validate_embeddings(
            "quadruplet_loss",
            &batch.query,
            &[("positives", &batch.positives), ("negatives", &batch.negatives)],
            Some(other_neg),
        )?;
        let terms = quadruplet_terms(
            &batch.query,
            &batch.positives,
            &batch.negatives,
            other_neg,
            T::from_f64(self.m1),
            T::from_f64(self.m2),
            self.policy,
        )?;
        let loss = terms.loss();
        tracing::debug!(
            "quadruplet loss {} = {} + {} ({} / {} hard queries of {})",
            loss,
            terms.triplet.hinge.loss,
            terms.second.loss,
            terms.triplet.hinge.hard_queries,
            terms.second.hard_queries,
            batch.batch_size()
        );

        ctx.clear();
        ctx.save_batch_shapes(batch);
        ctx.save_for_backward(terms.triplet.positive_index);
        ctx.save_for_backward(terms.triplet.hinge.pair_weights);
        ctx.save_for_backward(terms.second.pair_weights);
        Ok(loss)
    }

    fn backward(
        &self,
        batch: &EmbeddingBatch<T>,
        ctx: &FunctionContext,
        grad_output: T,
    ) -> MetricResult<BatchGradients<T>> {
        let other_neg = require_other_neg(batch)?;
        ctx.check_batch_shapes("QuadrupletLoss", batch)?;
        let positive_index = ctx
            .get_saved::<Vec<usize>>(0)
            .ok_or_else(|| MetricError::missing_saved("QuadrupletLoss", "positive_index"))?;
        let first = ctx
            .get_saved::<Tensor<T, 2>>(1)
            .ok_or_else(|| MetricError::missing_saved("QuadrupletLoss", "pair_weights"))?;
        let second = ctx
            .get_saved::<Tensor<T, 2>>(2)
            .ok_or_else(|| MetricError::missing_saved("QuadrupletLoss", "second_pair_weights"))?;

        let mut grads = BatchGradients::zeros_like(batch);

        // both hinges share the anchor positive distance
        let first_anchor = sum_rows(first);
        let second_anchor = sum_rows(second);
        let anchor_grad = Tensor::from_fn(first_anchor.shape(), |b| first_anchor.get(b) + second_anchor.get(b));
        backprop_positive(batch, positive_index, &anchor_grad, grad_output, &mut grads);

        backprop_negatives(
            &batch.negatives,
            &batch.query,
            first,
            grad_output,
            &mut grads.negatives,
            &mut grads.query,
        );
        let grad_other = grads
            .other_neg
            .as_mut()
            .ok_or_else(|| MetricError::InvalidState("QuadrupletLoss: no other_neg gradient buffer".to_string()))?;
        backprop_negatives(
            &batch.negatives,
            other_neg,
            second,
            grad_output,
            &mut grads.negatives,
            grad_other,
        );
        Ok(grads)
    }

    fn name(&self) -> &'static str {
        "QuadrupletLoss"
    }
}

impl<T: Element> Loss<T> for QuadrupletLoss {
    fn policy(&self) -> LossPolicy {
        self.policy
    }
}

/// Batched quadruplet loss, `triplet(m1) + second(m2)`.
pub fn quadruplet_loss<T: Element>(
    query: &Tensor<T, 3>,
    positives: &Tensor<T, 3>,
    negatives: &Tensor<T, 3>,
    other_neg: &Tensor<T, 3>,
    m1: T,
    m2: T,
    policy: LossPolicy,
) -> MetricResult<T> {
    check_margin("m1", m1.to_f64())?;
    check_margin("m2", m2.to_f64())?;
    validate_embeddings(
        "quadruplet_loss",
        query,
        &[("positives", positives), ("negatives", negatives)],
        Some(other_neg),
    )?;
    Ok(quadruplet_terms(query, positives, negatives, other_neg, m1, m2, policy)?.loss())
}

/// Per-sample distances and loss of [`quadruplet_loss_unreduced`]
#[derive(Debug, Clone, PartialEq)]
pub struct UnreducedQuadruplet<T: Element> {
    /// ||query - positive||², shape (batch,)
    pub pos_dist: Tensor<T, 1>,
    /// ||query - negative||²
    pub neg_dist: Tensor<T, 1>,
    /// ||negative - other_neg||²
    pub other_dist: Tensor<T, 1>,
    /// Sum of both hinges over the batch, divided by the number of samples with non-zero combined loss
    pub loss: T,
}

/// Quadruplet loss on one positive, one negative and one other negative per
/// query, every input of shape (batch, dim).
///
/// Older single-candidate form of [`quadruplet_loss`]; kept for the per-sample
/// distance diagnostics it returns.
pub fn quadruplet_loss_unreduced<T: Element>(
    query: &Tensor<T, 2>,
    positive: &Tensor<T, 2>,
    negative: &Tensor<T, 2>,
    other_neg: &Tensor<T, 2>,
    m1: T,
    m2: T,
) -> MetricResult<UnreducedQuadruplet<T>> {
    check_margin("m1", m1.to_f64())?;
    check_margin("m2", m2.to_f64())?;
    let shape = query.shape();
    if !shape.is_valid() {
        return Err(MetricError::shape_error("a non-empty (batch, dim) query", &shape.to_string(), None));
    }
    for (name, tensor) in [("positive", positive), ("negative", negative), ("other_neg", other_neg)] {
        if tensor.shape() != shape {
            return Err(MetricError::shape_error(
                &format!("{} of shape {}", name, shape),
                &tensor.shape().to_string(),
                Some("the unreduced quadruplet loss takes one embedding per query for every input"),
            ));
        }
    }

    let pos_dist = paired_squared_distances(query, positive)?;
    let neg_dist = paired_squared_distances(query, negative)?;
    let other_dist = paired_squared_distances(negative, other_neg)?;

    let batch = shape.rows();
    let combined: Vec<T> = (0..batch)
        .map(|b| {
            let first = (m1 + pos_dist.get(b) - neg_dist.get(b)).max_of(T::zero());
            let second = (m2 + pos_dist.get(b) - other_dist.get(b)).max_of(T::zero());
            first + second
        })
        .collect();
    let hard = combined.iter().filter(|&&l| l > T::zero()).count();
    let total: T = combined.iter().copied().sum();
    let loss = total / (T::from_usize(hard) + T::from_f64(HARD_EXAMPLE_EPS));

    Ok(UnreducedQuadruplet {
        pos_dist,
        neg_dist,
        other_dist,
        loss,
    })
}
