//! YAML configuration for a face service.
//!
//! ```yaml
//! detector_model:
//!   name: FastMtcnn
//! embedding_model:
//!   name: FaceNet512
//!   align: true
//! image_store:
//!   vector_indexing: true
//!   metric: cosine_similarity
//!   embedding_model: FaceNet512
//! database_path: /var/lib/facebank
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::catalog::{embedding_dimension, known_models, verification_threshold, Metric};
use crate::collab::RepresentOptions;
use crate::error::{IdentityError, Result};
use crate::loader::StoreLayout;
use crate::store::StoreOptions;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "FACEBANK_CONFIG";
/// Environment variable overriding `database_path`.
pub const DATABASE_PATH_ENV: &str = "FACEBANK_DATABASE_PATH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `None` treats every whole image as one face.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detector_model: Option<ModelConfig>,
    pub embedding_model: ModelConfig,
    pub image_store: StoreConfig,
    /// Base directory holding `database/`. Defaults to the temp dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            detector_model: None,
            embedding_model: ModelConfig::named("FaceNet512"),
            image_store: StoreConfig::default(),
            database_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
    #[serde(default = "default_align")]
    pub align: bool,
    #[serde(default)]
    pub expand_percentage: f32,
}

fn default_align() -> bool {
    true
}

impl ModelConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model_path: None,
            align: true,
            expand_percentage: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub store_name: String,
    /// Overrides the top-level `database_path` for this store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub vector_indexing: bool,
    pub index_type: String,
    pub metric: Metric,
    pub embedding_model: String,
    pub dump_interval_secs: u64,
    /// Ignore the snapshot and re-represent every stored image.
    pub rebuild: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let opts = StoreOptions::default();
        Self {
            store_name: "default".to_string(),
            path: None,
            vector_indexing: opts.vector_indexing,
            index_type: opts.index_type,
            metric: opts.metric,
            embedding_model: opts.embedding_model,
            dump_interval_secs: crate::persist::DEFAULT_DUMP_INTERVAL.as_secs(),
            rebuild: false,
        }
    }
}

impl Config {
    /// Parses and validates a YAML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| IdentityError::io(path, e))?;
        Self::parse(&content)
    }

    /// Parses and validates YAML text.
    pub fn parse(yaml: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(yaml)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads from `FACEBANK_CONFIG` (defaults when unset) and applies
    /// `FACEBANK_DATABASE_PATH`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// [`from_env`](Self::from_env) over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = match lookup(CONFIG_ENV).filter(|p| !p.is_empty()) {
            Some(path) => Self::load(Path::new(&path))?,
            None => Self::default(),
        };
        if let Some(db) = lookup(DATABASE_PATH_ENV).filter(|p| !p.is_empty()) {
            cfg.database_path = Some(PathBuf::from(db));
        }
        Ok(cfg)
    }

    /// Rejects unknown models and a store indexing a different model than
    /// the service embeds with.
    pub fn validate(&self) -> Result<()> {
        if embedding_dimension(&self.embedding_model.name).is_err() {
            let known: Vec<&str> = known_models().collect();
            return Err(IdentityError::Config(format!(
                "unknown embedding model {:?}, expected one of {}",
                self.embedding_model.name,
                known.join(", ")
            )));
        }
        verification_threshold(&self.embedding_model.name, self.image_store.metric)?;
        if self.image_store.embedding_model != self.embedding_model.name {
            return Err(IdentityError::Config(format!(
                "image_store indexes {} but embedding_model is {}",
                self.image_store.embedding_model, self.embedding_model.name
            )));
        }
        if self.image_store.dump_interval_secs == 0 {
            return Err(IdentityError::Config("dump_interval_secs must be positive".into()));
        }
        Ok(())
    }

    /// Base directory for the store's database.
    pub fn database_base(&self) -> PathBuf {
        if let Some(p) = self.image_store.path.as_ref().or(self.database_path.as_ref()) {
            return p.clone();
        }
        let tmp = std::env::temp_dir();
        warn!(path = %tmp.display(), "no database path configured, using temp dir");
        tmp
    }

    pub fn layout(&self) -> StoreLayout {
        StoreLayout::new(self.database_base())
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            vector_indexing: self.image_store.vector_indexing,
            index_type: self.image_store.index_type.clone(),
            metric: self.image_store.metric,
            embedding_model: self.image_store.embedding_model.clone(),
        }
    }

    pub fn represent_options(&self) -> RepresentOptions {
        RepresentOptions {
            embedding_model: self.embedding_model.name.clone(),
            detector_model: self.detector_model.as_ref().map(|d| d.name.clone()),
            align: self.embedding_model.align,
            expand_percentage: self.embedding_model.expand_percentage,
        }
    }

    pub fn dump_interval(&self) -> Duration {
        Duration::from_secs(self.image_store.dump_interval_secs)
    }
}
