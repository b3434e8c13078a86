//! Interfaces to the detection and embedding models.
//!
//! The models themselves live outside this crate. [`Pipeline`] composes a
//! detector, a cropper and an embedder into a [`Representer`], which is
//! what the store loader and the service consume.

use std::sync::Arc;

use tracing::debug;

use crate::error::{IdentityError, Result};
use crate::image::ImageSource;
use crate::record::{FaceBoundingBox, FaceDetection};

/// Finds faces in whole images.
pub trait FaceDetector: Send + Sync {
    /// Model name recorded on every detection this detector produces.
    fn name(&self) -> &str;

    /// One list of boxes per input image, in input order.
    fn detect(&self, images: &[ImageSource]) -> Result<Vec<Vec<FaceBoundingBox>>>;
}

/// A face region cut out of an image, ready for an embedder.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceCrop {
    pub bbox: FaceBoundingBox,
    pub aligned: bool,
    pub width: u32,
    pub height: u32,
    /// Decoded pixels in whatever layout the embedder expects.
    pub pixels: Vec<u8>,
}

/// Image decoding side of the pipeline.
pub trait Cropper: Send + Sync {
    /// Width and height of the decoded image.
    fn dimensions(&self, image: &ImageSource) -> Result<(u32, u32)>;

    /// Cuts `bbox` out of `image`, rotating to level the eyes when `align`.
    fn crop(&self, image: &ImageSource, bbox: &FaceBoundingBox, align: bool) -> Result<FaceCrop>;
}

/// Maps face crops to fixed-length vectors.
pub trait FaceEmbedder: Send + Sync {
    /// One vector per crop, in input order.
    fn embed(&self, crops: &[FaceCrop], model: &str) -> Result<Vec<Vec<f32>>>;
}

/// How to turn images into [`FaceDetection`]s.
#[derive(Debug, Clone, PartialEq)]
pub struct RepresentOptions {
    pub embedding_model: String,
    /// `None` skips detection and treats each whole image as one face.
    pub detector_model: Option<String>,
    pub align: bool,
    pub expand_percentage: f32,
}

impl RepresentOptions {
    pub fn new(embedding_model: impl Into<String>) -> Self {
        Self {
            embedding_model: embedding_model.into(),
            detector_model: None,
            align: true,
            expand_percentage: 0.0,
        }
    }

    pub fn with_detector(mut self, detector_model: impl Into<String>) -> Self {
        self.detector_model = Some(detector_model.into());
        self
    }
}

/// Produces per-image face detections with embeddings.
pub trait Representer: Send + Sync {
    /// One detection list per input image, in input order.
    fn represent(
        &self,
        images: &[ImageSource],
        options: &RepresentOptions,
    ) -> Result<Vec<Vec<FaceDetection>>>;
}

/// Detector + cropper + embedder.
pub struct Pipeline {
    detector: Option<Arc<dyn FaceDetector>>,
    cropper: Arc<dyn Cropper>,
    embedder: Arc<dyn FaceEmbedder>,
}

impl Pipeline {
    pub fn new(cropper: Arc<dyn Cropper>, embedder: Arc<dyn FaceEmbedder>) -> Self {
        Self {
            detector: None,
            cropper,
            embedder,
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn FaceDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    fn boxes(
        &self,
        images: &[ImageSource],
        options: &RepresentOptions,
    ) -> Result<Vec<Vec<FaceBoundingBox>>> {
        let Some(wanted) = options.detector_model.as_deref() else {
            return images
                .iter()
                .map(|img| {
                    let (w, h) = self.cropper.dimensions(img)?;
                    Ok(vec![FaceBoundingBox::whole_image(w as i32, h as i32)])
                })
                .collect();
        };

        let detector = match &self.detector {
            Some(d) if d.name() == wanted => d,
            Some(d) => {
                return Err(IdentityError::Config(format!(
                    "pipeline detector is {}, requested {wanted}",
                    d.name()
                )));
            }
            None => {
                return Err(IdentityError::Config(format!(
                    "detector {wanted} requested but pipeline has none"
                )));
            }
        };
        let boxes = detector.detect(images)?;
        if boxes.len() != images.len() {
            return Err(IdentityError::Collaborator(format!(
                "detector returned {} results for {} images",
                boxes.len(),
                images.len()
            )));
        }
        Ok(boxes)
    }
}

impl Representer for Pipeline {
    fn represent(
        &self,
        images: &[ImageSource],
        options: &RepresentOptions,
    ) -> Result<Vec<Vec<FaceDetection>>> {
        let boxes = self.boxes(images, options)?;

        let mut crops = Vec::new();
        for (img, faces) in images.iter().zip(&boxes) {
            if faces.is_empty() {
                continue;
            }
            let (w, h) = self.cropper.dimensions(img)?;
            for bbox in faces {
                let region = bbox.expanded(options.expand_percentage, w as i32, h as i32);
                crops.push(self.cropper.crop(img, &region, options.align)?);
            }
        }

        // One embed call for every face of every image.
        let vectors = if crops.is_empty() {
            Vec::new()
        } else {
            self.embedder.embed(&crops, &options.embedding_model)?
        };
        if vectors.len() != crops.len() {
            return Err(IdentityError::Collaborator(format!(
                "embedder returned {} vectors for {} crops",
                vectors.len(),
                crops.len()
            )));
        }
        debug!(
            images = images.len(),
            faces = crops.len(),
            model = %options.embedding_model,
            "represented"
        );

        let mut vectors = vectors.into_iter();
        let mut out = Vec::with_capacity(images.len());
        for faces in boxes {
            let mut detections = Vec::with_capacity(faces.len());
            for (bbox, vector) in faces.into_iter().zip(vectors.by_ref()) {
                let det = FaceDetection::single(bbox, &options.embedding_model, vector)?
                    .aligned(options.align)
                    .expanded_by(options.expand_percentage);
                detections.push(match &options.detector_model {
                    Some(name) => det.detected_by(name.as_str()),
                    None => det,
                });
            }
            out.push(detections);
        }
        Ok(out)
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::fakes::*;
    use super::*;

    fn jpeg(faces: &[u8]) -> ImageSource {
        let mut b = vec![0xFF, 0xD8, 0xFF];
        b.extend_from_slice(faces);
        ImageSource::Bytes(b)
    }

    #[test]
    fn whole_image_without_detector() {
        let embedder = Arc::new(AxisEmbedder::new());
        let p = Pipeline::new(Arc::new(BoxCropper), embedder.clone());
        let out = p
            .represent(&[jpeg(&[]), jpeg(&[5])], &RepresentOptions::new("FaceNet128"))
            .unwrap();
        assert_eq!(out.len(), 2);
        for dets in &out {
            assert_eq!(dets.len(), 1);
            assert_eq!(*dets[0].bbox(), FaceBoundingBox::whole_image(100, 100));
            assert_eq!(dets[0].detector_model(), None);
        }
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detections_map_back_to_their_images() {
        let opts = RepresentOptions::new("FaceNet128").with_detector("bytes");
        let out = pipeline()
            .represent(&[jpeg(&[1, 2]), jpeg(&[]), jpeg(&[7])], &opts)
            .unwrap();
        assert_eq!(out.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 0, 1]);
        assert_eq!(out[2][0].bbox().x, 7);
        assert_eq!(out[2][0].embedding("FaceNet128").unwrap()[7], 1.0);
        assert_eq!(out[0][1].detector_model(), Some("bytes"));
        assert!(out[0][1].alignment());
    }

    #[test]
    fn expansion_is_recorded_and_applied_to_crop() {
        let mut opts = RepresentOptions::new("FaceNet128").with_detector("bytes");
        opts.expand_percentage = 20.0;
        let out = pipeline().represent(&[jpeg(&[50])], &opts).unwrap();
        let det = &out[0][0];
        assert_eq!(det.expand_percentage(), 20.0);
        // Stored box is the detector's; the embedder saw the expanded one.
        assert_eq!(det.bbox().x, 50);
        assert_eq!(det.embedding("FaceNet128").unwrap()[49], 1.0);
    }

    #[test]
    fn detector_name_must_match() {
        let opts = RepresentOptions::new("FaceNet128").with_detector("RetinaFace");
        assert!(matches!(
            pipeline().represent(&[jpeg(&[1])], &opts),
            Err(IdentityError::Config(_))
        ));
        let bare = Pipeline::new(Arc::new(BoxCropper), Arc::new(AxisEmbedder::new()));
        assert!(bare.represent(&[jpeg(&[1])], &opts).is_err());
    }

    #[test]
    fn unknown_model_propagates() {
        let opts = RepresentOptions::new("Dlib");
        assert!(matches!(
            pipeline().represent(&[jpeg(&[])], &opts),
            Err(IdentityError::UnknownModel(_))
        ));
    }
}
