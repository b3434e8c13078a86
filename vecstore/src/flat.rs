use crate::distance::{euclidean_distance, inner_product};
use crate::error::VecError;
use crate::vecstore::{IndexMetric, Neighbor, VecIndex};

/// FlatIndex is an exact VecIndex using brute-force scoring.
///
/// Vectors live in one contiguous buffer, `dim` floats per slot.
pub struct FlatIndex {
    dim: usize,
    metric: IndexMetric,
    data: Vec<f32>,
}

impl FlatIndex {
    pub fn new(dim: usize, metric: IndexMetric) -> Result<Self, VecError> {
        if dim == 0 {
            return Err(VecError::ZeroDimension);
        }
        Ok(Self {
            dim,
            metric,
            data: Vec::new(),
        })
    }

    fn vector(&self, pos: usize) -> &[f32] {
        &self.data[pos * self.dim..(pos + 1) * self.dim]
    }

    fn score(&self, query: &[f32], pos: usize) -> f32 {
        match self.metric {
            IndexMetric::InnerProduct => inner_product(query, self.vector(pos)),
            IndexMetric::L2 => euclidean_distance(query, self.vector(pos)),
        }
    }
}

impl VecIndex for FlatIndex {
    fn dim(&self) -> usize {
        self.dim
    }

    fn metric(&self) -> IndexMetric {
        self.metric
    }

    fn add(&mut self, vectors: &[&[f32]]) -> Result<(), VecError> {
        // Validate the whole batch before touching storage.
        for v in vectors {
            if v.len() != self.dim {
                return Err(VecError::DimensionMismatch {
                    got: v.len(),
                    want: self.dim,
                });
            }
        }
        self.data.reserve(vectors.len() * self.dim);
        for v in vectors {
            self.data.extend_from_slice(v);
        }
        Ok(())
    }

    fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<Neighbor>, VecError> {
        if query.len() != self.dim {
            return Err(VecError::DimensionMismatch {
                got: query.len(),
                want: self.dim,
            });
        }
        if self.is_empty() || top_k == 0 {
            return Ok(vec![]);
        }

        let mut results: Vec<Neighbor> = (0..self.len())
            .map(|position| Neighbor {
                position,
                score: self.score(query, position),
            })
            .collect();

        // Stable sort keeps insertion order among equal scores.
        let metric = self.metric;
        results.sort_by(|a, b| {
            if metric.closer(a.score, b.score) {
                std::cmp::Ordering::Less
            } else if metric.closer(b.score, a.score) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        });

        results.truncate(top_k);
        Ok(results)
    }

    fn len(&self) -> usize {
        self.data.len() / self.dim
    }

    fn reset(&mut self) {
        self.data.clear();
    }
}
