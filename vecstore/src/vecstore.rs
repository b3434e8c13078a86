use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::VecError;
use crate::flat::FlatIndex;

/// Scoring function an index ranks by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMetric {
    /// Dot product. Higher is closer. Equals cosine similarity when both
    /// sides are L2-normalized.
    InnerProduct,
    /// Euclidean distance. Lower is closer.
    L2,
}

impl IndexMetric {
    /// Reports whether score `a` ranks strictly ahead of score `b`.
    pub fn closer(self, a: f32, b: f32) -> bool {
        match self {
            Self::InnerProduct => a > b,
            Self::L2 => a < b,
        }
    }
}

impl fmt::Display for IndexMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InnerProduct => write!(f, "inner_product"),
            Self::L2 => write!(f, "l2"),
        }
    }
}

/// Neighbor is a single result from a vector similarity search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Insertion position of the matched vector (0-based).
    pub position: usize,

    /// Score under the index metric: similarity for
    /// [`IndexMetric::InnerProduct`], distance for [`IndexMetric::L2`].
    pub score: f32,
}

/// VecIndex is the interface for nearest-neighbor search over dense
/// float32 vectors addressed by insertion position.
///
/// Positions are dense: the n-th vector ever added has position n-1.
/// Callers keep their own side tables aligned with these positions, so
/// implementations never reorder or drop vectors.
pub trait VecIndex: Send + Sync {
    /// Vector dimension accepted by this index.
    fn dim(&self) -> usize;

    /// Metric the index ranks by.
    fn metric(&self) -> IndexMetric;

    /// Append vectors in order. Either all vectors are added or none.
    fn add(&mut self, vectors: &[&[f32]]) -> Result<(), VecError>;

    /// Return up to top-k nearest vectors to the query, closest first.
    fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<Neighbor>, VecError>;

    /// Return the number of vectors in the index.
    fn len(&self) -> usize;

    /// Return true if the index contains no vectors.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every vector, keeping dimension and metric.
    fn reset(&mut self);
}

/// Constructs an index by kind name (`"Flat"` is the exact brute-force
/// index). Unknown kinds are rejected up front.
pub fn new_index(
    kind: &str,
    dim: usize,
    metric: IndexMetric,
) -> Result<Box<dyn VecIndex>, VecError> {
    match kind {
        "Flat" | "flat" => Ok(Box::new(FlatIndex::new(dim, metric)?)),
        other => Err(VecError::UnknownIndexKind(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closer_follows_metric_direction() {
        assert!(IndexMetric::InnerProduct.closer(0.9, 0.1));
        assert!(!IndexMetric::InnerProduct.closer(0.1, 0.9));
        assert!(IndexMetric::L2.closer(0.1, 0.9));
        assert!(!IndexMetric::L2.closer(0.5, 0.5));
    }

    #[test]
    fn new_index_by_kind() {
        let idx = new_index("Flat", 4, IndexMetric::L2).unwrap();
        assert_eq!(idx.dim(), 4);
        assert_eq!(idx.metric(), IndexMetric::L2);
        assert!(idx.is_empty());
    }

    #[test]
    fn new_index_unknown_kind() {
        let err = new_index("IVF4096,PQ64", 4, IndexMetric::L2).err().unwrap();
        assert!(matches!(err, VecError::UnknownIndexKind(ref k) if k == "IVF4096,PQ64"));
    }

    #[test]
    fn metric_display() {
        assert_eq!(IndexMetric::InnerProduct.to_string(), "inner_product");
        assert_eq!(IndexMetric::L2.to_string(), "l2");
    }
}
