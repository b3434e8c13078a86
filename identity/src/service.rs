//! Batch operations exposed to the surrounding service layer.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::{verification_threshold, Metric};
use crate::collab::{RepresentOptions, Representer};
use crate::config::Config;
use crate::error::{IdentityError, Result};
use crate::image::{content_hash, export_image, validate_user_id, ImageFormat, ImageSource};
use crate::loader::{StoreLayout, StoreLoader};
use crate::matching::{recognize_faces, verify_faces, MatchResult};
use crate::persist::{PersistenceHandle, PersistenceLoop};
use crate::record::{FaceDetection, IdentityRecord};
use crate::store::{AddOutcome, IdentityStore};

/// One image to enroll under `user_id`.
#[derive(Debug, Clone)]
pub struct AddRequest {
    pub image: ImageSource,
    pub user_id: String,
}

impl AddRequest {
    pub fn new(image: impl Into<ImageSource>, user_id: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            user_id: user_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddResponse {
    pub success: bool,
    pub reason: Option<String>,
}

impl AddResponse {
    fn ok() -> Self {
        Self {
            success: true,
            reason: None,
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
        }
    }
}

/// An intake item that passed validation and still needs faces.
struct Intake {
    slot: usize,
    user_id: String,
    bytes: Vec<u8>,
    format: ImageFormat,
    hash: String,
}

/// Store, representer and layout wired together.
pub struct FaceService {
    store: Arc<IdentityStore>,
    representer: Arc<dyn Representer>,
    represent: RepresentOptions,
    layout: StoreLayout,
    dump_interval: Duration,
}

impl FaceService {
    pub fn new(
        store: Arc<IdentityStore>,
        representer: Arc<dyn Representer>,
        represent: RepresentOptions,
        layout: StoreLayout,
    ) -> Self {
        Self {
            store,
            representer,
            represent,
            layout,
            dump_interval: crate::persist::DEFAULT_DUMP_INTERVAL,
        }
    }

    /// Loads the store described by `config` from disk and wraps it.
    pub fn open(config: &Config, representer: Arc<dyn Representer>) -> Result<Self> {
        config.validate()?;
        let layout = config.layout();
        let represent = config.represent_options();
        let store = StoreLoader::new(layout.clone(), config.store_options())
            .rebuild(config.image_store.rebuild)
            .representer(representer.as_ref(), represent.clone())
            .load()?;
        info!(
            store = %config.image_store.store_name,
            records = store.len(),
            state = %store.state(),
            "face service ready"
        );
        Ok(Self {
            dump_interval: config.dump_interval(),
            ..Self::new(Arc::new(store), representer, represent, layout)
        })
    }

    pub fn store(&self) -> &Arc<IdentityStore> {
        &self.store
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Starts periodic snapshots of the store into its database directory.
    /// Must be called inside a tokio runtime.
    pub fn start_persistence(&self) -> PersistenceHandle {
        PersistenceLoop::start(
            Arc::clone(&self.store),
            self.layout.snapshot_path(),
            self.dump_interval,
        )
    }

    /// Face detections for each image, using the configured models.
    pub fn represent(&self, images: &[ImageSource]) -> Result<Vec<Vec<FaceDetection>>> {
        let out = self.representer.represent(images, &self.represent)?;
        if out.len() != images.len() {
            return Err(IdentityError::Collaborator(format!(
                "representer returned {} results for {} images",
                out.len(),
                images.len()
            )));
        }
        Ok(out)
    }

    /// Enrolls each image. Responses are positional with `items`.
    ///
    /// Known content is rejected before anything is written, including an
    /// image repeated within the batch. Accepted images are copied under
    /// `images/<user_id>/`; the copy is removed again if the insert does
    /// not take.
    pub fn add_identity(&self, items: &[AddRequest]) -> Vec<AddResponse> {
        let mut responses: Vec<Option<AddResponse>> = vec![None; items.len()];
        let mut pending = Vec::new();
        let mut in_batch: HashMap<String, usize> = HashMap::new();

        for (slot, item) in items.iter().enumerate() {
            match self.prepare(slot, item, &mut in_batch) {
                Ok(intake) => pending.push(intake),
                Err(rejection) => responses[slot] = Some(rejection),
            }
        }

        if !pending.is_empty() {
            let sources: Vec<ImageSource> = pending
                .iter()
                .map(|p| ImageSource::Bytes(p.bytes.clone()))
                .collect();
            match self.represent(&sources) {
                Ok(faces) => {
                    for (intake, faces) in pending.into_iter().zip(faces) {
                        responses[intake.slot] = Some(self.enroll(&intake, faces));
                    }
                }
                Err(e) => {
                    warn!(error = %e, images = pending.len(), "representing intake batch failed");
                    for intake in &pending {
                        responses[intake.slot] = Some(AddResponse::rejected(e.to_string()));
                    }
                }
            }
        }

        responses
            .into_iter()
            .map(|r| r.unwrap_or_else(|| AddResponse::rejected("not processed")))
            .collect()
    }

    /// Validates one item; `Err` carries the response for a rejection.
    fn prepare(
        &self,
        slot: usize,
        item: &AddRequest,
        in_batch: &mut HashMap<String, usize>,
    ) -> std::result::Result<Intake, AddResponse> {
        let reject = |e: IdentityError| AddResponse::rejected(e.to_string());

        validate_user_id(&item.user_id).map_err(reject)?;
        let bytes = item.image.bytes().map_err(reject)?.into_owned();
        let format = ImageFormat::detect(&bytes).map_err(reject)?;
        let hash = content_hash(&bytes);

        if let Ok(existing) = self.store.get(&hash) {
            let outcome = AddOutcome::Duplicate {
                existing: existing.image_path().to_path_buf(),
            };
            return Err(AddResponse::rejected(outcome.reason().unwrap_or_default()));
        }
        if let Some(first) = in_batch.get(&hash) {
            return Err(AddResponse::rejected(format!(
                "duplicate: image repeats item {first} of this batch"
            )));
        }
        in_batch.insert(hash.clone(), slot);

        Ok(Intake {
            slot,
            user_id: item.user_id.clone(),
            bytes,
            format,
            hash,
        })
    }

    fn enroll(&self, intake: &Intake, faces: Vec<FaceDetection>) -> AddResponse {
        let images = self.layout.images_dir();
        let path = match export_image(&images, &intake.user_id, &intake.bytes, intake.format) {
            Ok(p) => p,
            Err(e) => return AddResponse::rejected(e.to_string()),
        };

        let outcome = IdentityRecord::new(
            path.clone(),
            intake.user_id.clone(),
            intake.hash.clone(),
            faces,
        )
        .and_then(|record| self.store.add(record));
        match outcome {
            Ok(AddOutcome::Added) => {
                info!(user_id = %intake.user_id, path = %path.display(), "identity added");
                AddResponse::ok()
            }
            Ok(dup @ AddOutcome::Duplicate { .. }) => {
                remove_orphan(&path);
                AddResponse::rejected(dup.reason().unwrap_or_default())
            }
            Err(e) => {
                remove_orphan(&path);
                AddResponse::rejected(e.to_string())
            }
        }
    }

    /// Verifies each image pair under `metric` (cosine when `None`).
    /// A pair where either side has no face yields `None`.
    pub fn verify(
        &self,
        pairs: &[(ImageSource, ImageSource)],
        metric: Option<Metric>,
    ) -> Result<Vec<Option<MatchResult>>> {
        let metric = metric.unwrap_or_default();
        let model = &self.represent.embedding_model;
        verification_threshold(model, metric)?;

        let images: Vec<ImageSource> = pairs
            .iter()
            .flat_map(|(a, b)| [a.clone(), b.clone()])
            .collect();
        let faces = self.represent(&images)?;

        faces
            .chunks(2)
            .map(|pair| {
                verify_faces(
                    &pair[0],
                    &pair[1],
                    model,
                    self.represent.detector_model.as_deref(),
                    metric,
                )
            })
            .collect()
    }

    /// Finds the closest stored identity for each image.
    pub fn recognize(&self, images: &[ImageSource]) -> Result<Vec<MatchResult>> {
        let model = &self.represent.embedding_model;
        verification_threshold(model, self.store.options().metric)?;
        let faces = self.represent(images)?;
        recognize_faces(&faces, model, self.represent.detector_model.as_deref(), &self.store)
    }

    /// Rebuilds the store's vector index; returns the vector count.
    pub fn rebuild_index(&self) -> Result<usize> {
        let n = self.store.rebuild_index()?;
        info!(vectors = n, "vector index rebuilt");
        Ok(n)
    }
}

fn remove_orphan(path: &std::path::Path) {
    warn!(path = %path.display(), "removing image orphaned by failed insert");
    if let Err(e) = fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "failed to remove orphaned image");
    }
}
