//! Loss configuration: margins and the reduction policy flags

use serde::{Deserialize, Serialize};
use std::path::Path;
use crate::error::{MetricError, MetricResult};

/// Margin used by the place-recognition training script for the triplet loss
pub const DEFAULT_TRIPLET_MARGIN: f64 = 0.3;
/// PointNetVLAD quadruplet margins
pub const DEFAULT_QUADRUPLET_M1: f64 = 0.5;
pub const DEFAULT_QUADRUPLET_M2: f64 = 0.2;

/// Policy flags shared by every margin-hinge loss.
///
/// - `use_min`: anchor on the nearest positive instead of the farthest one.
/// - `lazy`: per-query loss is the worst violating negative instead of the sum.
/// - `ignore_zero_loss`: average over queries with non-zero loss only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LossPolicy {
    pub use_min: bool,
    pub lazy: bool,
    pub ignore_zero_loss: bool,
}

impl LossPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_use_min(mut self, use_min: bool) -> Self {
        self.use_min = use_min;
        self
    }

    pub fn with_lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn with_ignore_zero_loss(mut self, ignore_zero_loss: bool) -> Self {
        self.ignore_zero_loss = ignore_zero_loss;
        self
    }

    /// Every combination of the three flags
    pub fn all() -> impl Iterator<Item = LossPolicy> {
        (0u8..8).map(|bits| LossPolicy {
            use_min: bits & 1 != 0,
            lazy: bits & 2 != 0,
            ignore_zero_loss: bits & 4 != 0,
        })
    }
}

/// Which loss to build and its margins
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LossKind {
    Triplet { margin: f64 },
    Quadruplet { m1: f64, m2: f64 },
}

impl Default for LossKind {
    fn default() -> Self {
        LossKind::Triplet { margin: DEFAULT_TRIPLET_MARGIN }
    }
}

impl LossKind {
    pub fn name(&self) -> &'static str {
        match self {
            LossKind::Triplet { .. } => "triplet",
            LossKind::Quadruplet { .. } => "quadruplet",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LossConfig {
    #[serde(default)]
    pub loss: LossKind,
    #[serde(default)]
    pub policy: LossPolicy,
}

impl LossConfig {
    pub fn triplet(margin: f64, policy: LossPolicy) -> Self {
        Self {
            loss: LossKind::Triplet { margin },
            policy,
        }
    }

    pub fn quadruplet(m1: f64, m2: f64, policy: LossPolicy) -> Self {
        Self {
            loss: LossKind::Quadruplet { m1, m2 },
            policy,
        }
    }

    /// Margins must be finite and non-negative
    pub fn validate(&self) -> MetricResult<()> {
        let margins = match self.loss {
            LossKind::Triplet { margin } => vec![("margin", margin)],
            LossKind::Quadruplet { m1, m2 } => vec![("m1", m1), ("m2", m2)],
        };
        for (name, value) in margins {
            check_margin(name, value)
                .map_err(|e| MetricError::ConfigurationError(e.to_string()))?;
        }
        Ok(())
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> MetricResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| MetricError::ConfigurationError(format!("Failed to read config file {:?}: {}", path, e)))?;

        let config: LossConfig = serde_json::from_str(&content)
            .map_err(|e| MetricError::ConfigurationError(format!("Failed to parse config file {:?}: {}", path, e)))?;
        config.validate()?;

        tracing::info!("Loss configuration loaded from {:?}", path);
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> MetricResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }
}

/// Reject negative or non-finite margins
pub fn check_margin(name: &str, value: f64) -> MetricResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(MetricError::invalid_margin(name, value))
    }
}
