//! Startup: database directory layout and store construction from disk.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::collab::{RepresentOptions, Representer};
use crate::error::{IdentityError, Result};
use crate::image::{content_hash, ImageFormat, ImageSource};
use crate::record::{FaceDetection, IdentityRecord};
use crate::snapshot::{read_snapshot, SNAPSHOT_FILE};
use crate::store::{IdentityStore, StoreOptions};

const REPRESENT_BATCH: usize = 32;

/// Paths of a database rooted at `<base>/database`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    base: PathBuf,
}

impl StoreLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn database_dir(&self) -> PathBuf {
        self.base.join("database")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.database_dir().join(SNAPSHOT_FILE)
    }

    /// Stored images, one subdirectory per user id.
    pub fn images_dir(&self) -> PathBuf {
        self.database_dir().join("images")
    }

    /// Creates the database and image directories if missing.
    pub fn ensure(&self) -> Result<()> {
        let images = self.images_dir();
        fs::create_dir_all(&images).map_err(|e| IdentityError::io(&images, e))
    }
}

/// Builds an [`IdentityStore`] from a database directory.
///
/// Records come from the snapshot (unless rebuilding). Images under
/// `images/<user_id>/` that no record references are run through the
/// representer, when one is set, and added with the directory name as
/// user id.
pub struct StoreLoader<'a> {
    layout: StoreLayout,
    options: StoreOptions,
    rebuild: bool,
    representer: Option<(&'a dyn Representer, RepresentOptions)>,
}

impl<'a> StoreLoader<'a> {
    pub fn new(layout: StoreLayout, options: StoreOptions) -> Self {
        Self {
            layout,
            options,
            rebuild: false,
            representer: None,
        }
    }

    /// Ignores the snapshot and re-represents every image on disk.
    pub fn rebuild(mut self, rebuild: bool) -> Self {
        self.rebuild = rebuild;
        self
    }

    pub fn representer(
        mut self,
        representer: &'a dyn Representer,
        options: RepresentOptions,
    ) -> Self {
        self.representer = Some((representer, options));
        self
    }

    pub fn load(self) -> Result<IdentityStore> {
        // Fail on a bad index config before touching the disk.
        let store = IdentityStore::new(self.options.clone())?;
        self.layout.ensure()?;

        let mut records = if self.rebuild {
            info!(base = %self.layout.base().display(), "rebuild requested, ignoring snapshot");
            Vec::new()
        } else {
            read_snapshot(&self.layout.snapshot_path()).records
        };

        let referenced: HashSet<PathBuf> = records
            .iter()
            .map(|r| r.image_path().to_path_buf())
            .collect();
        let unindexed: Vec<(String, PathBuf)> = scan_images(&self.layout.images_dir())?
            .into_iter()
            .filter(|(_, path)| !referenced.contains(path))
            .collect();

        if !unindexed.is_empty() {
            match &self.representer {
                Some((representer, options)) => {
                    let mut hashes: HashSet<String> =
                        records.iter().map(|r| r.content_hash().to_string()).collect();
                    let added = represent_images(
                        *representer,
                        options,
                        unindexed,
                        &mut hashes,
                        &mut records,
                    )?;
                    info!(added, "indexed images missing from snapshot");
                }
                None => warn!(
                    count = unindexed.len(),
                    "images missing from snapshot but no representer configured, skipping"
                ),
            }
        }

        store.load(records)?;
        Ok(store)
    }
}

/// Lists `(user_id, path)` for every jpeg/png under `images/<user_id>/`,
/// sorted by path.
fn scan_images(images_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut found = Vec::new();
    let users = fs::read_dir(images_dir).map_err(|e| IdentityError::io(images_dir, e))?;
    for user in users {
        let user = user.map_err(|e| IdentityError::io(images_dir, e))?;
        let user_dir = user.path();
        if !user_dir.is_dir() {
            continue;
        }
        let Some(user_id) = user_dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            warn!(dir = %user_dir.display(), "skipping non-utf8 user directory");
            continue;
        };
        let files = fs::read_dir(&user_dir).map_err(|e| IdentityError::io(&user_dir, e))?;
        for file in files {
            let path = file.map_err(|e| IdentityError::io(&user_dir, e))?.path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .and_then(ImageFormat::from_extension)
                .is_some();
            if is_image && path.is_file() {
                found.push((user_id.clone(), path));
            }
        }
    }
    found.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(found)
}

/// Represents `images` in batches and appends a record per image.
///
/// Files that cannot be read are skipped. A failing batch is retried one
/// image at a time so a single damaged file only costs its own record.
fn represent_images(
    representer: &dyn Representer,
    options: &RepresentOptions,
    images: Vec<(String, PathBuf)>,
    hashes: &mut HashSet<String>,
    records: &mut Vec<IdentityRecord>,
) -> Result<usize> {
    let mut pending = Vec::new();
    for (user_id, path) in images {
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable image");
                continue;
            }
        };
        let hash = content_hash(&bytes);
        if !hashes.insert(hash.clone()) {
            debug!(path = %path.display(), "image content already stored, skipping");
            continue;
        }
        pending.push((user_id, path, hash));
    }

    let mut added = 0;
    for batch in pending.chunks(REPRESENT_BATCH) {
        match represent_batch(representer, options, batch) {
            Ok(faces) => {
                for ((user_id, path, hash), faces) in batch.iter().zip(faces) {
                    records.push(IdentityRecord::new(
                        path.clone(),
                        user_id.clone(),
                        hash.clone(),
                        faces,
                    )?);
                    added += 1;
                }
            }
            Err(e) => {
                warn!(error = %e, images = batch.len(), "batch failed, retrying images one by one");
                for item in batch {
                    let (user_id, path, hash) = item;
                    match represent_batch(representer, options, std::slice::from_ref(item)) {
                        Ok(mut faces) => {
                            let faces = faces.pop().unwrap_or_default();
                            records.push(IdentityRecord::new(
                                path.clone(),
                                user_id.clone(),
                                hash.clone(),
                                faces,
                            )?);
                            added += 1;
                        }
                        Err(e) => warn!(path = %path.display(), error = %e, "skipping image"),
                    }
                }
            }
        }
    }
    Ok(added)
}

fn represent_batch(
    representer: &dyn Representer,
    options: &RepresentOptions,
    batch: &[(String, PathBuf, String)],
) -> Result<Vec<Vec<FaceDetection>>> {
    let sources: Vec<ImageSource> = batch
        .iter()
        .map(|(_, p, _)| ImageSource::Path(p.clone()))
        .collect();
    let detections = representer.represent(&sources, options)?;
    if detections.len() != batch.len() {
        return Err(IdentityError::Collaborator(format!(
            "representer returned {} results for {} images",
            detections.len(),
            batch.len()
        )));
    }
    Ok(detections)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::catalog::Metric;
    use crate::collab::fakes::pipeline;
    use crate::snapshot::write_snapshot;

    fn put(layout: &StoreLayout, user: &str, name: &str, faces: &[u8]) -> PathBuf {
        let dir = layout.images_dir().join(user);
        fs::create_dir_all(&dir).unwrap();
        let mut bytes = vec![0xFF, 0xD8, 0xFF];
        bytes.extend_from_slice(faces);
        let p = dir.join(name);
        fs::write(&p, bytes).unwrap();
        p
    }

    fn options() -> StoreOptions {
        StoreOptions {
            vector_indexing: true,
            metric: Metric::Cosine,
            embedding_model: "FaceNet128".into(),
            ..StoreOptions::default()
        }
    }

    fn represent_opts() -> RepresentOptions {
        RepresentOptions::new("FaceNet128").with_detector("bytes")
    }

    #[test]
    fn fresh_directory_gives_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        let store = StoreLoader::new(layout.clone(), options()).load().unwrap();
        assert!(store.is_empty());
        assert!(layout.images_dir().is_dir());
        assert_eq!(layout.snapshot_path(), dir.path().join("database/metadata.json"));
    }

    #[test]
    fn unreferenced_images_are_represented() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        let known = put(&layout, "alice", "a.jpg", &[1]);
        put(&layout, "bob", "b.png", &[2, 3]);
        fs::write(layout.images_dir().join("bob/notes.txt"), b"ignore me").unwrap();

        let hash = content_hash(&fs::read(&known).unwrap());
        let alice = IdentityRecord::new(&known, "alice", hash, vec![]).unwrap();
        write_snapshot(&layout.snapshot_path(), &[Arc::new(alice)]).unwrap();

        let p = pipeline();
        let store = StoreLoader::new(layout.clone(), options())
            .representer(&p, represent_opts())
            .load()
            .unwrap();
        assert_eq!(store.len(), 2);
        let bob = store.snapshot().into_iter().find(|r| r.user_id() == "bob").unwrap();
        assert_eq!(bob.detections().len(), 2);
        assert_eq!(store.vector_count(), Some(2));
    }

    #[test]
    fn identical_images_are_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        put(&layout, "alice", "a.jpg", &[1]);
        put(&layout, "alice", "copy.jpg", &[1]);

        let p = pipeline();
        let store = StoreLoader::new(layout, options())
            .representer(&p, represent_opts())
            .load()
            .unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn rebuild_ignores_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        let a = put(&layout, "alice", "a.jpg", &[9]);
        let stale = IdentityRecord::new(&a, "mallory", "stale-hash", vec![]).unwrap();
        write_snapshot(&layout.snapshot_path(), &[Arc::new(stale)]).unwrap();

        let p = pipeline();
        let store = StoreLoader::new(layout, options())
            .rebuild(true)
            .representer(&p, represent_opts())
            .load()
            .unwrap();
        let records = store.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].user_id(), "alice");
        assert!(!store.contains("stale-hash"));
    }

    /// Fails any batch containing a file whose name starts with `bad`.
    struct RejectsBad {
        inner: crate::collab::Pipeline,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl Representer for RejectsBad {
        fn represent(
            &self,
            images: &[ImageSource],
            options: &RepresentOptions,
        ) -> Result<Vec<Vec<FaceDetection>>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let bad = images.iter().any(|img| match img {
                ImageSource::Path(p) => p
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with("bad")),
                _ => false,
            });
            if bad {
                return Err(IdentityError::Collaborator("cannot decode truncated jpeg".into()));
            }
            self.inner.represent(images, options)
        }
    }

    #[test]
    fn damaged_image_costs_only_its_own_record() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        put(&layout, "alice", "a.jpg", &[1]);
        put(&layout, "bob", "bad.jpg", &[2]);
        put(&layout, "carol", "c.png", &[3]);

        let r = RejectsBad {
            inner: pipeline(),
            calls: Default::default(),
        };
        let store = StoreLoader::new(layout, options())
            .representer(&r, represent_opts())
            .load()
            .unwrap();

        let mut users: Vec<String> = store
            .snapshot()
            .iter()
            .map(|r| r.user_id().to_string())
            .collect();
        users.sort();
        assert_eq!(users, vec!["alice", "carol"]);
        // One failed batch, then one call per image.
        assert_eq!(r.calls.load(std::sync::atomic::Ordering::SeqCst), 4);
    }

    /// Drops the last result of every call.
    struct ShortRepresenter(crate::collab::Pipeline);

    impl Representer for ShortRepresenter {
        fn represent(
            &self,
            images: &[ImageSource],
            options: &RepresentOptions,
        ) -> Result<Vec<Vec<FaceDetection>>> {
            let mut out = self.0.represent(images, options)?;
            out.pop();
            Ok(out)
        }
    }

    #[test]
    fn short_representer_output_is_not_zipped_away() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        put(&layout, "alice", "a.jpg", &[1]);
        put(&layout, "bob", "b.jpg", &[2]);

        let r = ShortRepresenter(pipeline());
        let store = StoreLoader::new(layout, options())
            .representer(&r, represent_opts())
            .load()
            .unwrap();
        // Every retry comes back empty too, so nothing is stored under the
        // wrong image.
        assert!(store.is_empty());
    }

    #[test]
    fn unreadable_image_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        let a = put(&layout, "alice", "a.jpg", &[1]);
        let gone = layout.images_dir().join("alice/gone.jpg");

        let p = pipeline();
        let mut records = Vec::new();
        let added = represent_images(
            &p,
            &represent_opts(),
            vec![("alice".into(), gone), ("alice".into(), a.clone())],
            &mut HashSet::new(),
            &mut records,
        )
        .unwrap();
        assert_eq!(added, 1);
        assert_eq!(records[0].image_path(), a.as_path());
    }

    #[test]
    fn without_representer_images_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        put(&layout, "alice", "a.jpg", &[1]);
        let store = StoreLoader::new(layout, StoreOptions::default()).load().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn bad_index_config_fails_first() {
        let dir = tempfile::tempdir().unwrap();
        let opts = StoreOptions {
            embedding_model: "Nope".into(),
            ..options()
        };
        assert!(StoreLoader::new(StoreLayout::new(dir.path()), opts).load().is_err());
        assert!(!dir.path().join("database").exists());
    }
}
