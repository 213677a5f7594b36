//! Triplet loss for place-recognition embeddings

use crate::{
    autograd::{Function, FunctionContext},
    config::{check_margin, LossPolicy},
    data::{BatchGradients, EmbeddingBatch},
    error::{MetricError, MetricResult},
    tensor::{
        ops::{accumulate_distance_grad, broadcast_squared_distances, sum_rows},
        Element, Tensor,
    },
};
use super::{
    hinge::{margin_hinge, HingeReduction},
    positive::PositiveSelection,
    validate_embeddings, Loss,
};

/// Forward state of the query/positive/negative hinge
pub(crate) struct TripletTerm<T: Element> {
    /// Anchor positive distance per query
    pub positive: Tensor<T, 1>,
    /// Which positive each query was anchored on
    pub positive_index: Vec<usize>,
    pub hinge: HingeReduction<T>,
}

/// Positive selection, query-to-negative distances and the first hinge.
/// Shared by the triplet and quadruplet losses.
pub(crate) fn triplet_term<T: Element>(
    query: &Tensor<T, 3>,
    positives: &Tensor<T, 3>,
    negatives: &Tensor<T, 3>,
    margin: T,
    policy: LossPolicy,
) -> MetricResult<TripletTerm<T>> {
    let (positive, positive_index) =
        PositiveSelection::compute(query, positives)?.into_picked(policy.use_min);
    let negative = broadcast_squared_distances(query, negatives)?;
    let hinge = margin_hinge(&positive, &negative, margin, policy)?;
    Ok(TripletTerm {
        positive,
        positive_index,
        hinge,
    })
}

/// Push `anchor_grad` (d loss / d positive distance) back to the query and the selected positives
pub(crate) fn backprop_positive<T: Element>(
    batch: &EmbeddingBatch<T>,
    positive_index: &[usize],
    anchor_grad: &Tensor<T, 1>,
    grad_output: T,
    grads: &mut BatchGradients<T>,
) {
    for (b, &j) in positive_index.iter().enumerate() {
        let coef = anchor_grad.get(b) * grad_output;
        if coef == T::zero() {
            continue;
        }
        accumulate_distance_grad(
            coef,
            batch.positives.vector(b, j),
            batch.query.vector(b, 0),
            grads.positives.vector_mut(b, j),
            grads.query.vector_mut(b, 0),
        );
    }
}

/// Push the hinge weights back through the candidate distances `||negatives[b, k] - reference[b]||²`.
/// `reference` is the query for the triplet term and the other negative for the second quadruplet term.
pub(crate) fn backprop_negatives<T: Element>(
    negatives: &Tensor<T, 3>,
    reference: &Tensor<T, 3>,
    pair_weights: &Tensor<T, 2>,
    grad_output: T,
    grad_negatives: &mut Tensor<T, 3>,
    grad_reference: &mut Tensor<T, 3>,
) {
    let shape = pair_weights.shape();
    for b in 0..shape.rows() {
        for k in 0..shape.cols() {
            let weight = pair_weights.get(b, k);
            if weight == T::zero() {
                continue;
            }
            // d loss / d distance is the negated hinge weight
            accumulate_distance_grad(
                -(weight * grad_output),
                negatives.vector(b, k),
                reference.vector(b, 0),
                grad_negatives.vector_mut(b, k),
                grad_reference.vector_mut(b, 0),
            );
        }
    }
}

/// Triplet margin loss with hardest-positive anchoring.
///
/// For each query the anchor distance is the farthest positive (or nearest with
/// `use_min`); every negative closer than `anchor + margin` contributes
/// `margin + anchor - neg`. See [`LossPolicy`] for the reductions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TripletLoss {
    margin: f64,
    policy: LossPolicy,
}

impl TripletLoss {
    pub fn new(margin: f64, policy: LossPolicy) -> MetricResult<Self> {
        check_margin("margin", margin)?;
        Ok(Self { margin, policy })
    }
}

impl<T: Element> Function<T> for TripletLoss {
    fn forward(&self, batch: &EmbeddingBatch<T>, ctx: &mut FunctionContext) -> MetricResult<T> {
        validate_embeddings(
            "triplet_loss",
            &batch.query,
            &[("positives", &batch.positives), ("negatives", &batch.negatives)],
            None,
        )?;
        let term = triplet_term(
            &batch.query,
            &batch.positives,
            &batch.negatives,
            T::from_f64(self.margin),
            self.policy,
        )?;
        tracing::debug!(
            "triplet loss {} ({} of {} queries hard)",
            term.hinge.loss,
            term.hinge.hard_queries,
            batch.batch_size()
        );

        ctx.clear();
        ctx.save_batch_shapes(batch);
        let loss = term.hinge.loss;
        ctx.save_for_backward(term.positive_index);
        ctx.save_for_backward(term.hinge.pair_weights);
        Ok(loss)
    }

    fn backward(
        &self,
        batch: &EmbeddingBatch<T>,
        ctx: &FunctionContext,
        grad_output: T,
    ) -> MetricResult<BatchGradients<T>> {
        ctx.check_batch_shapes("TripletLoss", batch)?;
        let positive_index = ctx
            .get_saved::<Vec<usize>>(0)
            .ok_or_else(|| MetricError::missing_saved("TripletLoss", "positive_index"))?;
        let pair_weights = ctx
            .get_saved::<Tensor<T, 2>>(1)
            .ok_or_else(|| MetricError::missing_saved("TripletLoss", "pair_weights"))?;

        let mut grads = BatchGradients::zeros_like(batch);
        let anchor_grad = sum_rows(pair_weights);
        backprop_positive(batch, positive_index, &anchor_grad, grad_output, &mut grads);
        backprop_negatives(
            &batch.negatives,
            &batch.query,
            pair_weights,
            grad_output,
            &mut grads.negatives,
            &mut grads.query,
        );
        Ok(grads)
    }

    fn name(&self) -> &'static str {
        "TripletLoss"
    }
}

impl<T: Element> Loss<T> for TripletLoss {
    fn policy(&self) -> LossPolicy {
        self.policy
    }
}

/// Batched triplet loss.
///
/// `query` is (batch, 1, dim), `positives` (batch, num_pos, dim), `negatives`
/// (batch, num_neg, dim). With `ignore_zero_loss` and no violating query the
/// result is `0 / 1e-16 == 0`: the batch simply has no hard examples.
pub fn triplet_loss<T: Element>(
    query: &Tensor<T, 3>,
    positives: &Tensor<T, 3>,
    negatives: &Tensor<T, 3>,
    margin: T,
    policy: LossPolicy,
) -> MetricResult<T> {
    check_margin("margin", margin.to_f64())?;
    validate_embeddings(
        "triplet_loss",
        query,
        &[("positives", positives), ("negatives", negatives)],
        None,
    )?;
    Ok(triplet_term(query, positives, negatives, margin, policy)?.hinge.loss)
}
