//! Face identity store and matching engine.
//!
//! An [`IdentityStore`] holds one [`IdentityRecord`] per distinct image
//! (keyed by content hash) and keeps an [`EmbeddingIndex`] over the face
//! embeddings of one model. On top of it:
//!
//! - [`verify_faces`] decides whether two images show the same person;
//! - [`recognize_faces`] finds the closest enrolled identity per image;
//! - [`PersistenceLoop`] snapshots the store to JSON in the background;
//! - [`FaceService`] wires store, models and disk layout into batch
//!   operations.
//!
//! Face detection and embedding are supplied from outside through the
//! [`Representer`] trait (or a [`Pipeline`] of [`FaceDetector`],
//! [`Cropper`] and [`FaceEmbedder`]).
//!
//! # Example
//!
//! ```
//! use facebank_identity::{
//!     FaceBoundingBox, FaceDetection, IdentityRecord, IdentityStore, StoreOptions,
//! };
//!
//! let store = IdentityStore::new(StoreOptions {
//!     vector_indexing: true,
//!     embedding_model: "FaceNet128".into(),
//!     ..StoreOptions::default()
//! })?;
//!
//! let bbox = FaceBoundingBox::new(0, 0, 64, 64, 0.99);
//! let face = FaceDetection::single(bbox, "FaceNet128", vec![0.1; 128])?;
//! let record = IdentityRecord::new("/faces/alice/1.jpg", "alice", "3f2a", vec![face])?;
//! assert!(store.add(record.clone())?.is_added());
//! assert!(!store.add(record)?.is_added());
//! assert_eq!(store.vector_count(), Some(1));
//! # Ok::<(), facebank_identity::IdentityError>(())
//! ```

pub mod catalog;
pub mod collab;
pub mod config;
pub mod error;
pub mod image;
pub mod index;
pub mod loader;
pub mod matching;
pub mod persist;
pub mod record;
pub mod registry;
pub mod service;
pub mod snapshot;
pub mod store;

pub use catalog::{embedding_dimension, known_models, verification_threshold, Metric};
pub use collab::{
    Cropper, FaceCrop, FaceDetector, FaceEmbedder, Pipeline, RepresentOptions, Representer,
};
pub use config::{Config, ModelConfig, StoreConfig};
pub use error::{IdentityError, Result};
pub use image::{content_hash, ImageFormat, ImageSource};
pub use index::{EmbeddingIndex, IndexEntry, SearchHit, SearchResults};
pub use loader::{StoreLayout, StoreLoader};
pub use matching::{recognize_faces, verify_faces, FacePair, MatchResult};
pub use persist::{PersistenceHandle, PersistenceLoop, DEFAULT_DUMP_INTERVAL};
pub use record::{FaceBoundingBox, FaceDetection, IdentityRecord};
pub use registry::Registry;
pub use service::{AddRequest, AddResponse, FaceService};
pub use snapshot::{read_snapshot, write_snapshot, SnapshotLoad, SNAPSHOT_FILE};
pub use store::{AddOutcome, IdentityStore, StoreOptions, StoreState};
