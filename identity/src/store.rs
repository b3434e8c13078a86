use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::catalog::Metric;
use crate::error::{IdentityError, Result};
use crate::index::{EmbeddingIndex, SearchResults};
use crate::record::IdentityRecord;
use crate::snapshot;

/// Index settings for an [`IdentityStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoreOptions {
    /// Maintain an embedding index; required for search/recognize.
    pub vector_indexing: bool,
    /// Backing index kind, e.g. `"Flat"`.
    pub index_type: String,
    pub metric: Metric,
    /// Embedding model whose vectors are indexed.
    pub embedding_model: String,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            vector_indexing: false,
            index_type: "Flat".to_string(),
            metric: Metric::Cosine,
            embedding_model: "FaceNet512".to_string(),
        }
    }
}

/// Result of [`IdentityStore::add`]. Duplicates are an expected outcome,
/// not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// A record with the same content hash already exists at `existing`.
    Duplicate { existing: PathBuf },
}

impl AddOutcome {
    pub fn is_added(&self) -> bool {
        matches!(self, Self::Added)
    }

    /// Human-readable rejection reason; `None` on success.
    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Added => None,
            Self::Duplicate { existing } => Some(format!(
                "duplicate: image {} already exists",
                existing.display()
            )),
        }
    }
}

/// Lifecycle of one store instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Empty,
    Loading,
    Ready { indexed: bool },
    Dumping { indexed: bool },
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty"),
            Self::Loading => write!(f, "loading"),
            Self::Ready { indexed: false } => write!(f, "ready"),
            Self::Ready { indexed: true } => write!(f, "ready+indexed"),
            Self::Dumping { indexed: false } => write!(f, "dumping"),
            Self::Dumping { indexed: true } => write!(f, "dumping+indexed"),
        }
    }
}

const PHASE_EMPTY: u8 = 0;
const PHASE_LOADING: u8 = 1;
const PHASE_READY: u8 = 2;

struct StoreInner {
    records: Vec<Arc<IdentityRecord>>,
    by_hash: HashMap<String, Arc<IdentityRecord>>,
    index: Option<EmbeddingIndex>,
}

impl StoreInner {
    /// Inserts without touching the index. Returns the existing record's
    /// path on a hash collision.
    fn insert(&mut self, record: Arc<IdentityRecord>) -> std::result::Result<(), PathBuf> {
        if let Some(existing) = self.by_hash.get(record.content_hash()) {
            return Err(existing.image_path().to_path_buf());
        }
        self.by_hash
            .insert(record.content_hash().to_string(), Arc::clone(&record));
        self.records.push(record);
        Ok(())
    }
}

/// Authoritative, deduplicated set of identity records.
///
/// Mutation takes an exclusive lock, so adds are serialized per store;
/// `get`, `search` and `snapshot` share a read lock. Snapshots copy the
/// record handles, so serializing a dump never holds the lock.
pub struct IdentityStore {
    inner: RwLock<StoreInner>,
    options: StoreOptions,
    phase: AtomicU8,
    dumping: AtomicBool,
    /// Held for the whole of a dump; dumps share one temp file.
    dump_lock: Mutex<()>,
}

impl IdentityStore {
    /// Creates an empty store. With indexing enabled the index kind and
    /// model are validated here, so misconfiguration fails before any data
    /// is loaded.
    pub fn new(options: StoreOptions) -> Result<Self> {
        let index = if options.vector_indexing {
            Some(EmbeddingIndex::new(
                &options.index_type,
                &options.embedding_model,
                options.metric,
            )?)
        } else {
            None
        };
        Ok(Self {
            inner: RwLock::new(StoreInner {
                records: Vec::new(),
                by_hash: HashMap::new(),
                index,
            }),
            options,
            phase: AtomicU8::new(PHASE_EMPTY),
            dumping: AtomicBool::new(false),
            dump_lock: Mutex::new(()),
        })
    }

    /// Creates a store pre-populated with `records`.
    pub fn with_records(options: StoreOptions, records: Vec<IdentityRecord>) -> Result<Self> {
        let store = Self::new(options)?;
        store.load(records)?;
        Ok(store)
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Bulk-loads records, skipping duplicate hashes, then builds the index
    /// in one pass. Returns the number of records accepted.
    pub fn load(&self, records: Vec<IdentityRecord>) -> Result<usize> {
        self.phase.store(PHASE_LOADING, Ordering::SeqCst);
        let mut inner = self.inner.write();

        let mut accepted = 0;
        for record in records {
            let hash = record.content_hash().to_string();
            match inner.insert(Arc::new(record)) {
                Ok(()) => accepted += 1,
                Err(existing) => {
                    warn!(
                        hash = %hash,
                        existing = %existing.display(),
                        "skipping duplicate record while loading"
                    );
                }
            }
        }

        let StoreInner { records, index, .. } = &mut *inner;
        if let Some(index) = index.as_mut() {
            index.build(records)?;
        }
        drop(inner);

        self.phase.store(PHASE_READY, Ordering::SeqCst);
        info!(accepted, total = self.len(), "identity records loaded");
        Ok(accepted)
    }

    /// Inserts `record` unless its content hash is already present.
    ///
    /// A duplicate leaves the store untouched. On success the record's
    /// detections are forwarded to the embedding index when indexing is
    /// enabled. Nothing is written to durable storage here.
    pub fn add(&self, record: IdentityRecord) -> Result<AddOutcome> {
        let record = Arc::new(record);
        let mut inner = self.inner.write();

        if let Err(existing) = inner.insert(Arc::clone(&record)) {
            debug!(hash = %record.content_hash(), "duplicate record rejected");
            return Ok(AddOutcome::Duplicate { existing });
        }
        if let Some(index) = inner.index.as_mut() {
            index.add(std::slice::from_ref(&record))?;
        }
        drop(inner);

        self.phase.store(PHASE_READY, Ordering::SeqCst);
        Ok(AddOutcome::Added)
    }

    /// Looks up a record by content hash.
    pub fn get(&self, hash: &str) -> Result<Arc<IdentityRecord>> {
        self.inner
            .read()
            .by_hash
            .get(hash)
            .cloned()
            .ok_or_else(|| IdentityError::NotFound {
                hash: hash.to_string(),
            })
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.inner.read().by_hash.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of the record list in insertion order. Later adds
    /// do not show up in a snapshot already taken.
    pub fn snapshot(&self) -> Vec<Arc<IdentityRecord>> {
        self.inner.read().records.clone()
    }

    /// k-nearest-neighbour search over the embedding index.
    pub fn search(&self, queries: &[Vec<f32>], k: usize) -> Result<SearchResults> {
        let inner = self.inner.read();
        let index = inner.index.as_ref().ok_or(IdentityError::IndexingDisabled)?;
        index.search(queries, k)
    }

    /// Number of indexed vectors, or `None` when indexing is disabled.
    pub fn vector_count(&self) -> Option<usize> {
        self.inner.read().index.as_ref().map(EmbeddingIndex::len)
    }

    /// Rebuilds the embedding index from the current record set. Returns
    /// the resulting vector count.
    pub fn rebuild_index(&self) -> Result<usize> {
        let mut inner = self.inner.write();
        let StoreInner { records, index, .. } = &mut *inner;
        let index = index.as_mut().ok_or(IdentityError::IndexingDisabled)?;
        index.build(records)?;
        Ok(index.len())
    }

    pub fn state(&self) -> StoreState {
        let indexed = self.options.vector_indexing;
        if self.dumping.load(Ordering::SeqCst) {
            return StoreState::Dumping { indexed };
        }
        match self.phase.load(Ordering::SeqCst) {
            PHASE_EMPTY => StoreState::Empty,
            PHASE_LOADING => StoreState::Loading,
            _ => StoreState::Ready { indexed },
        }
    }

    /// Serializes the current record set to `path`. Writers are not
    /// blocked while the file is written; concurrent dumps run one at a
    /// time. Returns the number of records dumped.
    pub fn dump_to(&self, path: &Path) -> Result<usize> {
        let _serial = self.dump_lock.lock();
        let _guard = DumpGuard::raise(&self.dumping);
        let started = Instant::now();
        let records = self.snapshot();
        snapshot::write_snapshot(path, &records)?;
        info!(
            records = records.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            path = %path.display(),
            "identity store dumped"
        );
        Ok(records.len())
    }
}

/// Holds the "dump in progress" flag for the lifetime of one dump.
struct DumpGuard<'a>(&'a AtomicBool);

impl<'a> DumpGuard<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for DumpGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
