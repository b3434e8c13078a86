use std::sync::Arc;

use facebank_vecstore::{new_index, normalized, VecIndex};
use tracing::{debug, info};

use crate::catalog::{embedding_dimension, Metric};
use crate::error::{IdentityError, Result};
use crate::record::IdentityRecord;

/// Back-reference from an indexed vector to the detection it came from.
/// Refers to the owning record by content hash, never by ownership.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub record_hash: String,
    pub detection: usize,
    pub model: String,
    pub embedding: Vec<f32>,
}

/// One nearest-neighbour hit. `distance` is a cosine similarity or a
/// euclidean distance depending on `metric`.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub entry: IndexEntry,
    pub distance: f32,
    pub metric: Metric,
}

/// Per-query hit lists. Every inner list has exactly `k` slots; slots
/// beyond the available neighbours are `None`.
pub type SearchResults = Vec<Vec<Option<SearchHit>>>;

/// Vector index over one embedding model's vectors, with its entry table
/// kept positionally aligned to the backing [`VecIndex`].
pub struct EmbeddingIndex {
    model: String,
    metric: Metric,
    entries: Vec<IndexEntry>,
    vectors: Box<dyn VecIndex>,
}

impl EmbeddingIndex {
    /// Creates an empty index of `kind` (e.g. `"Flat"`) for `model`.
    /// The dimension comes from the model catalog.
    pub fn new(kind: &str, model: &str, metric: Metric) -> Result<Self> {
        let dim = embedding_dimension(model)?;
        let vectors = new_index(kind, dim, metric.index_metric())?;
        Ok(Self {
            model: model.to_string(),
            metric,
            entries: Vec::new(),
            vectors,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn dimension(&self) -> usize {
        self.vectors.dim()
    }

    /// Number of vectors in the backing index.
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Discards everything and re-indexes `records` from scratch.
    pub fn build(&mut self, records: &[Arc<IdentityRecord>]) -> Result<()> {
        info!(
            model = %self.model,
            metric = %self.metric,
            records = records.len(),
            "building vector index"
        );
        self.entries.clear();
        self.vectors.reset();
        self.add(records)?;
        info!(vectors = self.len(), "vector index built");
        Ok(())
    }

    /// Appends every detection of `records` that carries an embedding for
    /// this index's model. Detections without one are skipped.
    ///
    /// # Panics
    ///
    /// Panics if the entry table and the backing index disagree on size
    /// afterwards; that is a broken invariant, not a recoverable error.
    pub fn add(&mut self, records: &[Arc<IdentityRecord>]) -> Result<()> {
        let mut entries = Vec::new();
        for record in records {
            for (i, det) in record.detections().iter().enumerate() {
                if let Some(embedding) = det.embedding(&self.model) {
                    entries.push(IndexEntry {
                        record_hash: record.content_hash().to_string(),
                        detection: i,
                        model: self.model.clone(),
                        embedding: embedding.to_vec(),
                    });
                }
            }
        }

        if !entries.is_empty() {
            let prepared: Vec<Vec<f32>> = entries
                .iter()
                .map(|e| self.prepare(&e.embedding))
                .collect();
            let refs: Vec<&[f32]> = prepared.iter().map(|v| v.as_slice()).collect();
            self.vectors.add(&refs)?;
            self.entries.extend(entries);
            debug!(size = self.len(), "vector index grew");
        }

        assert_eq!(
            self.entries.len(),
            self.vectors.len(),
            "index entries out of sync with vector index"
        );
        Ok(())
    }

    /// k-nearest-neighbour search for every query, best first.
    ///
    /// An empty index yields `k` empty slots per query instead of an error,
    /// so callers can zip results against queries unconditionally.
    pub fn search(&self, queries: &[Vec<f32>], k: usize) -> Result<SearchResults> {
        if self.vectors.is_empty() {
            return Ok(vec![vec![None; k]; queries.len()]);
        }

        let mut results = Vec::with_capacity(queries.len());
        for query in queries {
            if query.len() != self.dimension() {
                return Err(IdentityError::DimensionMismatch {
                    model: self.model.clone(),
                    expected: self.dimension(),
                    got: query.len(),
                });
            }
            let prepared = self.prepare(query);
            let mut hits: Vec<Option<SearchHit>> = self
                .vectors
                .search(&prepared, k)?
                .into_iter()
                .map(|n| {
                    Some(SearchHit {
                        entry: self.entries[n.position].clone(),
                        distance: n.score,
                        metric: self.metric,
                    })
                })
                .collect();
            hits.resize(k, None);
            results.push(hits);
        }
        Ok(results)
    }

    fn prepare(&self, v: &[f32]) -> Vec<f32> {
        if self.metric.normalizes() {
            normalized(v)
        } else {
            v.to_vec()
        }
    }
}
