use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::catalog::embedding_dimension;
use crate::error::{IdentityError, Result};

/// Face location reported by the detector collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBoundingBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    #[serde(default)]
    pub left_eye: Option<(i32, i32)>,
    #[serde(default)]
    pub right_eye: Option<(i32, i32)>,
    #[serde(default)]
    pub confidence: f32,
}

impl FaceBoundingBox {
    pub fn new(x: i32, y: i32, w: i32, h: i32, confidence: f32) -> Self {
        Self {
            x,
            y,
            w,
            h,
            left_eye: None,
            right_eye: None,
            confidence,
        }
    }

    pub fn with_eyes(mut self, left: (i32, i32), right: (i32, i32)) -> Self {
        self.left_eye = Some(left);
        self.right_eye = Some(right);
        self
    }

    /// Box covering a whole `width x height` image, used when no detector
    /// runs and the entire image is treated as one face.
    pub fn whole_image(width: i32, height: i32) -> Self {
        Self::new(0, 0, width, height, 0.0)
    }

    /// Grows width and height by `percentage` percent around the centre,
    /// clamped to a `image_w x image_h` image. Non-positive percentages
    /// return the box unchanged.
    pub fn expanded(&self, percentage: f32, image_w: i32, image_h: i32) -> Self {
        if percentage <= 0.0 {
            return *self;
        }
        let expanded_w = self.w + (self.w as f32 * percentage / 100.0) as i32;
        let expanded_h = self.h + (self.h as f32 * percentage / 100.0) as i32;

        let x = (self.x - (expanded_w - self.w) / 2).max(0);
        let y = (self.y - (expanded_h - self.h) / 2).max(0);
        Self {
            x,
            y,
            w: (image_w - x).min(expanded_w),
            h: (image_h - y).min(expanded_h),
            ..*self
        }
    }
}

/// One detected face: its box plus one embedding per model name.
///
/// Every embedding is checked against the catalog dimension of its model
/// when constructed or deserialized, so a detection never carries a vector
/// of the wrong length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDetection")]
pub struct FaceDetection {
    bbox: FaceBoundingBox,
    #[serde(skip_serializing_if = "Option::is_none")]
    detector_model: Option<String>,
    alignment: bool,
    expand_percentage: f32,
    embeddings: BTreeMap<String, Vec<f32>>,
}

#[derive(Deserialize)]
struct RawDetection {
    bbox: FaceBoundingBox,
    #[serde(default)]
    detector_model: Option<String>,
    #[serde(default)]
    alignment: bool,
    #[serde(default)]
    expand_percentage: f32,
    embeddings: BTreeMap<String, Vec<f32>>,
}

impl TryFrom<RawDetection> for FaceDetection {
    type Error = IdentityError;

    fn try_from(raw: RawDetection) -> Result<Self> {
        let det = FaceDetection::new(raw.bbox, raw.embeddings)?
            .aligned(raw.alignment)
            .expanded_by(raw.expand_percentage);
        Ok(match raw.detector_model {
            Some(name) => det.detected_by(name),
            None => det,
        })
    }
}

impl FaceDetection {
    /// Validates each embedding length against its model's declared
    /// dimension. Unknown model names and NaN or infinite components are
    /// rejected.
    pub fn new(bbox: FaceBoundingBox, embeddings: BTreeMap<String, Vec<f32>>) -> Result<Self> {
        for (model, vector) in &embeddings {
            let expected = embedding_dimension(model)?;
            if vector.len() != expected {
                return Err(IdentityError::DimensionMismatch {
                    model: model.clone(),
                    expected,
                    got: vector.len(),
                });
            }
            if let Some(position) = vector.iter().position(|x| !x.is_finite()) {
                return Err(IdentityError::NonFiniteEmbedding {
                    model: model.clone(),
                    position,
                });
            }
        }
        Ok(Self {
            bbox,
            detector_model: None,
            alignment: false,
            expand_percentage: 0.0,
            embeddings,
        })
    }

    /// Shorthand for a detection carrying a single model's embedding.
    pub fn single(bbox: FaceBoundingBox, model: &str, embedding: Vec<f32>) -> Result<Self> {
        Self::new(bbox, BTreeMap::from([(model.to_string(), embedding)]))
    }

    pub fn aligned(mut self, alignment: bool) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn expanded_by(mut self, percentage: f32) -> Self {
        self.expand_percentage = percentage;
        self
    }

    pub fn detected_by(mut self, detector_model: impl Into<String>) -> Self {
        self.detector_model = Some(detector_model.into());
        self
    }

    pub fn bbox(&self) -> &FaceBoundingBox {
        &self.bbox
    }

    pub fn detector_model(&self) -> Option<&str> {
        self.detector_model.as_deref()
    }

    pub fn alignment(&self) -> bool {
        self.alignment
    }

    pub fn expand_percentage(&self) -> f32 {
        self.expand_percentage
    }

    /// Embedding produced by `model`, if this detection has one.
    pub fn embedding(&self, model: &str) -> Option<&[f32]> {
        self.embeddings.get(model).map(|v| v.as_slice())
    }

    pub fn embeddings(&self) -> &BTreeMap<String, Vec<f32>> {
        &self.embeddings
    }
}

/// One stored image and the faces found in it. Never mutated once built;
/// the store shares records behind `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityRecord {
    image_path: PathBuf,
    user_id: String,
    content_hash: String,
    detections: Vec<FaceDetection>,
}

impl IdentityRecord {
    pub fn new(
        image_path: impl Into<PathBuf>,
        user_id: impl Into<String>,
        content_hash: impl Into<String>,
        detections: Vec<FaceDetection>,
    ) -> Result<Self> {
        let content_hash = content_hash.into();
        if content_hash.is_empty() {
            return Err(IdentityError::InvalidImage(
                "record content hash is empty".into(),
            ));
        }
        Ok(Self {
            image_path: image_path.into(),
            user_id: user_id.into(),
            content_hash,
            detections,
        })
    }

    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn detections(&self) -> &[FaceDetection] {
        &self.detections
    }

    /// Number of detections holding an embedding for `model`.
    pub fn embedded_faces(&self, model: &str) -> usize {
        self.detections
            .iter()
            .filter(|d| d.embedding(model).is_some())
            .count()
    }
}
