//! Static embedding-model catalog: output dimensions and calibrated
//! verification thresholds, plus the [`Metric`] decision rules.

use std::fmt;
use std::str::FromStr;

use facebank_vecstore::{cosine_similarity, euclidean_distance, IndexMetric};
use serde::{Deserialize, Serialize};

use crate::error::{IdentityError, Result};

/// Similarity/distance function with its own decision direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metric {
    /// Cosine similarity. Higher is closer; verified when `>= threshold`.
    #[default]
    #[serde(rename = "cosine_similarity")]
    Cosine,
    /// Euclidean distance. Lower is closer; verified when `< threshold`.
    #[serde(rename = "euclidean_l2")]
    EuclideanL2,
}

impl Metric {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cosine => "cosine_similarity",
            Self::EuclideanL2 => "euclidean_l2",
        }
    }

    /// Scores a pair of raw (unnormalized) embeddings.
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => cosine_similarity(a, b),
            Self::EuclideanL2 => euclidean_distance(a, b),
        }
    }

    /// Decision rule shared by thresholding and candidate selection:
    /// cosine accepts `value >= bound`, euclidean accepts `value < bound`.
    ///
    /// Used both as `accepts(distance, threshold)` and as
    /// `accepts(candidate, incumbent)` when picking the best pair, so a
    /// later cosine tie replaces the incumbent while a euclidean tie keeps it.
    pub fn accepts(self, value: f32, bound: f32) -> bool {
        match self {
            Self::Cosine => value >= bound,
            Self::EuclideanL2 => value < bound,
        }
    }

    /// Metric the backing vector index must rank by. Cosine maps to inner
    /// product over L2-normalized vectors.
    pub fn index_metric(self) -> IndexMetric {
        match self {
            Self::Cosine => IndexMetric::InnerProduct,
            Self::EuclideanL2 => IndexMetric::L2,
        }
    }

    pub(crate) fn normalizes(self) -> bool {
        matches!(self, Self::Cosine)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cosine_similarity" | "cosine" => Ok(Self::Cosine),
            "euclidean_l2" | "euclidean" => Ok(Self::EuclideanL2),
            other => Err(IdentityError::UnknownMetric(other.to_string())),
        }
    }
}

struct ModelSpec {
    name: &'static str,
    dimension: usize,
    thresholds: &'static [(Metric, f32)],
}

const FACENET_THRESHOLDS: &[(Metric, f32)] =
    &[(Metric::Cosine, 0.70), (Metric::EuclideanL2, 23.56)];

const MODELS: &[ModelSpec] = &[
    ModelSpec {
        name: "FaceNet512",
        dimension: 512,
        thresholds: FACENET_THRESHOLDS,
    },
    ModelSpec {
        name: "FaceNet128",
        dimension: 128,
        thresholds: FACENET_THRESHOLDS,
    },
];

fn lookup(model: &str) -> Result<&'static ModelSpec> {
    MODELS
        .iter()
        .find(|m| m.name == model)
        .ok_or_else(|| IdentityError::UnknownModel(model.to_string()))
}

/// Output dimension declared for an embedding model.
pub fn embedding_dimension(model: &str) -> Result<usize> {
    lookup(model).map(|m| m.dimension)
}

/// Calibrated verification threshold for `(model, metric)`.
pub fn verification_threshold(model: &str, metric: Metric) -> Result<f32> {
    lookup(model)?
        .thresholds
        .iter()
        .find(|(m, _)| *m == metric)
        .map(|(_, t)| *t)
        .ok_or_else(|| IdentityError::MissingThreshold {
            model: model.to_string(),
            metric: metric.to_string(),
        })
}

/// Names of every catalogued embedding model.
pub fn known_models() -> impl Iterator<Item = &'static str> {
    MODELS.iter().map(|m| m.name)
}
