//! JSON snapshot of the record set.
//!
//! The file is an array of record objects. Image paths are stored relative
//! to the snapshot's directory so a database directory can be moved as a
//! whole.

use std::borrow::Cow;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{IdentityError, Result};
use crate::record::{FaceDetection, IdentityRecord};

/// Snapshot file name inside a database directory.
pub const SNAPSHOT_FILE: &str = "metadata.json";

#[derive(Serialize)]
struct RecordOut<'a> {
    image_path: Cow<'a, str>,
    user_id: &'a str,
    image_hash: &'a str,
    detected_faces: &'a [FaceDetection],
}

#[derive(Deserialize)]
struct RecordIn {
    image_path: String,
    user_id: String,
    image_hash: String,
    #[serde(default)]
    detected_faces: Vec<FaceDetection>,
}

/// What [`read_snapshot`] recovered and what it had to drop.
#[derive(Debug, Default)]
pub struct SnapshotLoad {
    pub records: Vec<IdentityRecord>,
    /// Entries that failed to decode.
    pub malformed: usize,
    /// Entries whose image file no longer exists.
    pub missing_images: usize,
}

fn relative_to<'a>(path: &'a Path, base: &Path) -> Cow<'a, str> {
    match path.strip_prefix(base) {
        Ok(rel) => rel.to_string_lossy(),
        Err(_) => path.to_string_lossy(),
    }
}

/// Writes `records` to `path` atomically (temp file, then rename).
pub fn write_snapshot(path: &Path, records: &[Arc<IdentityRecord>]) -> Result<()> {
    let base = path.parent().unwrap_or_else(|| Path::new(""));
    if !base.as_os_str().is_empty() {
        fs::create_dir_all(base).map_err(|e| IdentityError::io(base, e))?;
    }

    let out: Vec<RecordOut<'_>> = records
        .iter()
        .map(|r| RecordOut {
            image_path: relative_to(r.image_path(), base),
            user_id: r.user_id(),
            image_hash: r.content_hash(),
            detected_faces: r.detections(),
        })
        .collect();

    let tmp = tmp_path(path);
    {
        let file = fs::File::create(&tmp).map_err(|e| IdentityError::io(&tmp, e))?;
        let mut w = BufWriter::new(file);
        serde_json::to_writer(&mut w, &out)?;
        w.flush().map_err(|e| IdentityError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| IdentityError::io(path, e))?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Reads a snapshot, tolerating damage.
///
/// A missing file is an empty snapshot. An unreadable file, invalid JSON,
/// or a top level that is not an array is logged and treated as empty.
/// Individual entries that fail to decode, and records whose image file is
/// gone, are skipped with a warning.
pub fn read_snapshot(path: &Path) -> SnapshotLoad {
    let mut load = SnapshotLoad::default();
    if !path.exists() {
        info!(path = %path.display(), "no snapshot found, starting empty");
        return load;
    }

    let data = match fs::read(path) {
        Ok(d) => d,
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to read snapshot");
            return load;
        }
    };
    let entries = match serde_json::from_slice::<serde_json::Value>(&data) {
        Ok(serde_json::Value::Array(entries)) => entries,
        Ok(_) => {
            error!(path = %path.display(), "snapshot top level is not a list");
            return load;
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to parse snapshot");
            return load;
        }
    };

    let base = path.parent().unwrap_or_else(|| Path::new(""));
    for (i, entry) in entries.into_iter().enumerate() {
        let raw: RecordIn = match serde_json::from_value(entry) {
            Ok(r) => r,
            Err(e) => {
                warn!(entry = i, error = %e, "skipping malformed snapshot entry");
                load.malformed += 1;
                continue;
            }
        };
        let image_path = base.join(&raw.image_path);
        if !image_path.exists() {
            warn!(
                entry = i,
                image = %image_path.display(),
                "image file missing, dropping record; check the database base path"
            );
            load.missing_images += 1;
            continue;
        }
        match IdentityRecord::new(image_path, raw.user_id, raw.image_hash, raw.detected_faces) {
            Ok(record) => load.records.push(record),
            Err(e) => {
                warn!(entry = i, error = %e, "skipping invalid snapshot entry");
                load.malformed += 1;
            }
        }
    }
    info!(
        path = %path.display(),
        records = load.records.len(),
        malformed = load.malformed,
        missing_images = load.missing_images,
        "snapshot loaded"
    );
    load
}
