//! Embedding batches handed to the losses by the training loop

use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    error::{MetricError, MetricResult},
    tensor::{Element, Shape, Tensor},
};

/// One training step worth of embeddings.
///
/// `query` is (batch, 1, dim), `positives` (batch, num_pos, dim), `negatives`
/// (batch, num_neg, dim) and, for the quadruplet loss, `other_neg` (batch, 1, dim).
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingBatch<T: Element> {
    pub query: Tensor<T, 3>,
    pub positives: Tensor<T, 3>,
    pub negatives: Tensor<T, 3>,
    pub other_neg: Option<Tensor<T, 3>>,
}

impl<T: Element> EmbeddingBatch<T> {
    pub fn new(query: Tensor<T, 3>, positives: Tensor<T, 3>, negatives: Tensor<T, 3>) -> Self {
        Self {
            query,
            positives,
            negatives,
            other_neg: None,
        }
    }

    pub fn with_other_neg(mut self, other_neg: Tensor<T, 3>) -> Self {
        self.other_neg = Some(other_neg);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.query.shape().batch()
    }

    pub fn dim(&self) -> usize {
        self.query.shape().dim()
    }

    /// Fetch a field by name
    pub fn field(&self, field: BatchField) -> Option<&Tensor<T, 3>> {
        match field {
            BatchField::Query => Some(&self.query),
            BatchField::Positives => Some(&self.positives),
            BatchField::Negatives => Some(&self.negatives),
            BatchField::OtherNeg => self.other_neg.as_ref(),
        }
    }

    pub fn field_mut(&mut self, field: BatchField) -> Option<&mut Tensor<T, 3>> {
        match field {
            BatchField::Query => Some(&mut self.query),
            BatchField::Positives => Some(&mut self.positives),
            BatchField::Negatives => Some(&mut self.negatives),
            BatchField::OtherNeg => self.other_neg.as_mut(),
        }
    }

    /// Uniform random embeddings in [-1, 1), for diagnostics and benchmarks
    pub fn random<R: Rng + ?Sized>(layout: BatchLayout, rng: &mut R) -> Self {
        let mut sample = |count: usize| {
            let shape = Shape::new([layout.batch_size, count, layout.dim]);
            Tensor::from_fn(shape, |_| T::from_f64(rng.gen_range(-1.0..1.0)))
        };
        let query = sample(1);
        let positives = sample(layout.num_pos);
        let negatives = sample(layout.num_neg);
        let other_neg = if layout.with_other_neg { Some(sample(1)) } else { None };
        Self {
            query,
            positives,
            negatives,
            other_neg,
        }
    }
}

impl EmbeddingBatch<f64> {
    pub fn from_json_str(json: &str) -> MetricResult<Self> {
        let record: BatchRecord = serde_json::from_str(json)?;
        record.into_batch()
    }

    pub fn load_json(path: impl AsRef<Path>) -> MetricResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| MetricError::IoError(format!("Failed to read batch file {:?}: {}", path, e)))?;
        let batch = Self::from_json_str(&content)?;
        tracing::debug!(
            "Loaded batch from {:?}: query={}, positives={}, negatives={}",
            path,
            batch.query.shape(),
            batch.positives.shape(),
            batch.negatives.shape()
        );
        Ok(batch)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> MetricResult<()> {
        let content = serde_json::to_string_pretty(&BatchRecord::from_batch(self))?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }
}

/// Sizes used to generate a random batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLayout {
    pub batch_size: usize,
    pub num_pos: usize,
    pub num_neg: usize,
    pub dim: usize,
    pub with_other_neg: bool,
}

/// Names of the tensors inside an [`EmbeddingBatch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchField {
    Query,
    Positives,
    Negatives,
    OtherNeg,
}

impl BatchField {
    pub const ALL: [BatchField; 4] = [
        BatchField::Query,
        BatchField::Positives,
        BatchField::Negatives,
        BatchField::OtherNeg,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BatchField::Query => "query",
            BatchField::Positives => "positives",
            BatchField::Negatives => "negatives",
            BatchField::OtherNeg => "other_neg",
        }
    }
}

/// Gradients of a scalar loss with respect to every batch tensor
#[derive(Debug, Clone, PartialEq)]
pub struct BatchGradients<T: Element> {
    pub query: Tensor<T, 3>,
    pub positives: Tensor<T, 3>,
    pub negatives: Tensor<T, 3>,
    pub other_neg: Option<Tensor<T, 3>>,
}

impl<T: Element> BatchGradients<T> {
    /// Zero gradients shaped like `batch`
    pub fn zeros_like(batch: &EmbeddingBatch<T>) -> Self {
        Self {
            query: Tensor::zeros(batch.query.shape()),
            positives: Tensor::zeros(batch.positives.shape()),
            negatives: Tensor::zeros(batch.negatives.shape()),
            other_neg: batch.other_neg.as_ref().map(|t| Tensor::zeros(t.shape())),
        }
    }

    pub fn field(&self, field: BatchField) -> Option<&Tensor<T, 3>> {
        match field {
            BatchField::Query => Some(&self.query),
            BatchField::Positives => Some(&self.positives),
            BatchField::Negatives => Some(&self.negatives),
            BatchField::OtherNeg => self.other_neg.as_ref(),
        }
    }
}

/// JSON form of a batch: nested `[batch][count][dim]` arrays
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    pub query: Vec<Vec<Vec<f64>>>,
    pub positives: Vec<Vec<Vec<f64>>>,
    pub negatives: Vec<Vec<Vec<f64>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_neg: Option<Vec<Vec<Vec<f64>>>>,
}

impl BatchRecord {
    pub fn into_batch(self) -> MetricResult<EmbeddingBatch<f64>> {
        let mut batch = EmbeddingBatch::new(
            Tensor::from_nested(self.query)?,
            Tensor::from_nested(self.positives)?,
            Tensor::from_nested(self.negatives)?,
        );
        if let Some(other) = self.other_neg {
            batch = batch.with_other_neg(Tensor::from_nested(other)?);
        }
        Ok(batch)
    }

    pub fn from_batch(batch: &EmbeddingBatch<f64>) -> Self {
        Self {
            query: nest(&batch.query),
            positives: nest(&batch.positives),
            negatives: nest(&batch.negatives),
            other_neg: batch.other_neg.as_ref().map(nest),
        }
    }
}

fn nest(tensor: &Tensor<f64, 3>) -> Vec<Vec<Vec<f64>>> {
    let shape = tensor.shape();
    (0..shape.batch())
        .map(|b| (0..shape.count()).map(|i| tensor.vector(b, i).to_vec()).collect())
        .collect()
}
