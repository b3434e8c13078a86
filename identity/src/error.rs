use std::path::PathBuf;

use facebank_vecstore::VecError;
use thiserror::Error;

/// Errors returned by identity store, index and matching operations.
///
/// A duplicate insert is not an error; see [`crate::AddOutcome`].
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("identity: record {hash} not found")]
    NotFound { hash: String },

    #[error("identity: unknown embedding model {0:?}")]
    UnknownModel(String),

    #[error("identity: unknown metric {0:?}")]
    UnknownMetric(String),

    #[error("identity: no threshold for model {model:?} under metric {metric}")]
    MissingThreshold { model: String, metric: String },

    #[error("identity: no {kind} registered under name {name:?}")]
    UnknownName { kind: &'static str, name: String },

    #[error("identity: embedding dimension mismatch for {model}: expected {expected}, got {got}")]
    DimensionMismatch {
        model: String,
        expected: usize,
        got: usize,
    },

    #[error("identity: embedding for model {model} has a non-finite component at {position}")]
    NonFiniteEmbedding { model: String, position: usize },

    #[error("identity: vector indexing is disabled for this store")]
    IndexingDisabled,

    #[error("identity: invalid image: {0}")]
    InvalidImage(String),

    #[error("identity: invalid user id {0:?}")]
    InvalidUserId(String),

    #[error("identity: collaborator error: {0}")]
    Collaborator(String),

    #[error("identity: configuration error: {0}")]
    Config(String),

    #[error("identity: io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("identity: json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("identity: yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("identity: index error: {0}")]
    Vec(#[from] VecError),
}

impl IdentityError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Reports whether this is a lookup miss rather than a hard failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, IdentityError>;
