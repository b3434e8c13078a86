//! Verify (1:1) and recognize (1:N) decisions.
//!
//! Both share one rule set: the best candidate is the one the metric
//! [`accepts`](Metric::accepts) over the incumbent, and the verdict is
//! `metric.accepts(distance, threshold)` with the threshold taken from the
//! model catalog.

use serde::Serialize;
use tracing::{debug, warn};

use crate::catalog::{verification_threshold, Metric};
use crate::error::{IdentityError, Result};
use crate::index::SearchHit;
use crate::record::{FaceBoundingBox, FaceDetection};
use crate::store::IdentityStore;

/// Bounding boxes of the face pair that decided a verify.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FacePair {
    pub image1: FaceBoundingBox,
    pub image2: FaceBoundingBox,
}

/// Outcome of one verify or recognize query. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub verified: bool,
    pub distance: f32,
    pub metric: Option<Metric>,
    pub threshold: Option<f32>,
    pub embedding_model: String,
    pub detector_model: Option<String>,
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub faces: Option<FacePair>,
}

impl MatchResult {
    /// Fixed answer for a query with nothing to compare against.
    pub fn no_match(embedding_model: &str, detector_model: Option<&str>) -> Self {
        Self {
            verified: false,
            distance: 0.0,
            metric: None,
            threshold: None,
            embedding_model: embedding_model.to_string(),
            detector_model: detector_model.map(str::to_string),
            user_id: None,
            faces: None,
        }
    }

    fn decided(
        distance: f32,
        metric: Metric,
        threshold: f32,
        embedding_model: &str,
        detector_model: Option<&str>,
    ) -> Self {
        Self {
            verified: metric.accepts(distance, threshold),
            distance,
            metric: Some(metric),
            threshold: Some(threshold),
            ..Self::no_match(embedding_model, detector_model)
        }
    }
}

/// Compares every face of image 1 against every face of image 2 and
/// decides on the best pair.
///
/// Faces without an embedding for `embedding_model` take no part. Returns
/// `Ok(None)` when no pair can be formed. An unknown `(model, metric)`
/// threshold is an error even when there is nothing to compare.
pub fn verify_faces(
    faces1: &[FaceDetection],
    faces2: &[FaceDetection],
    embedding_model: &str,
    detector_model: Option<&str>,
    metric: Metric,
) -> Result<Option<MatchResult>> {
    let threshold = verification_threshold(embedding_model, metric)?;

    let mut best: Option<(f32, &FaceDetection, &FaceDetection)> = None;
    for f1 in faces1 {
        let Some(e1) = f1.embedding(embedding_model) else {
            continue;
        };
        for f2 in faces2 {
            let Some(e2) = f2.embedding(embedding_model) else {
                continue;
            };
            let d = metric.distance(e1, e2);
            if best.is_none_or(|(incumbent, _, _)| metric.accepts(d, incumbent)) {
                best = Some((d, f1, f2));
            }
        }
    }

    Ok(best.map(|(distance, f1, f2)| MatchResult {
        faces: Some(FacePair {
            image1: *f1.bbox(),
            image2: *f2.bbox(),
        }),
        ..MatchResult::decided(distance, metric, threshold, embedding_model, detector_model)
    }))
}

/// Finds the closest stored identity for each query image.
///
/// All faces of all images go to the index in one batched search. Per
/// image, the best hit across its faces decides. Images without faces, or
/// a store without vectors, get [`MatchResult::no_match`]. The user id is
/// only resolved for verified matches.
///
/// `embedding_model` must be the model the store indexes.
pub fn recognize_faces(
    images: &[Vec<FaceDetection>],
    embedding_model: &str,
    detector_model: Option<&str>,
    store: &IdentityStore,
) -> Result<Vec<MatchResult>> {
    let options = store.options();
    if options.embedding_model != embedding_model {
        return Err(IdentityError::Config(format!(
            "store indexes {} embeddings, query uses {embedding_model}",
            options.embedding_model
        )));
    }
    let metric = options.metric;
    let threshold = verification_threshold(embedding_model, metric)?;

    let mut queries = Vec::new();
    let mut owners = Vec::new();
    for (i, faces) in images.iter().enumerate() {
        for face in faces {
            if let Some(e) = face.embedding(embedding_model) {
                queries.push(e.to_vec());
                owners.push(i);
            }
        }
    }

    let mut best: Vec<Option<SearchHit>> = vec![None; images.len()];
    if !queries.is_empty() {
        let results = store.search(&queries, 1)?;
        for (owner, hits) in owners.into_iter().zip(results) {
            let Some(hit) = hits.into_iter().next().flatten() else {
                continue;
            };
            let slot = &mut best[owner];
            if slot
                .as_ref()
                .is_none_or(|incumbent| metric.accepts(hit.distance, incumbent.distance))
            {
                *slot = Some(hit);
            }
        }
    }

    Ok(best
        .into_iter()
        .map(|hit| {
            let Some(hit) = hit else {
                return MatchResult::no_match(embedding_model, detector_model);
            };
            let mut result = MatchResult::decided(
                hit.distance,
                metric,
                threshold,
                embedding_model,
                detector_model,
            );
            if result.verified {
                match store.get(&hit.entry.record_hash) {
                    Ok(record) => result.user_id = Some(record.user_id().to_string()),
                    Err(e) => {
                        warn!(
                            hash = %hit.entry.record_hash,
                            error = %e,
                            "matched entry has no record"
                        );
                        result.verified = false;
                    }
                }
            }
            debug!(verified = result.verified, distance = result.distance, "recognize decided");
            result
        })
        .collect())
}
