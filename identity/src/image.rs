use std::borrow::Cow;
use std::fs;
use std::path::{Component, Path, PathBuf};

use base64::Engine;
use sha2::{Digest, Sha256};

use crate::error::{IdentityError, Result};

/// An input image as handed over by the service layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
    /// Standard base64 of the encoded image bytes.
    Base64(String),
}

impl ImageSource {
    /// Resolves the source to encoded image bytes.
    pub fn bytes(&self) -> Result<Cow<'_, [u8]>> {
        match self {
            Self::Path(p) => fs::read(p)
                .map(Cow::Owned)
                .map_err(|e| IdentityError::io(p, e)),
            Self::Bytes(b) => Ok(Cow::Borrowed(b)),
            Self::Base64(s) => base64::engine::general_purpose::STANDARD
                .decode(s.trim())
                .map(Cow::Owned)
                .map_err(|e| IdentityError::InvalidImage(format!("bad base64: {e}"))),
        }
    }
}

impl From<PathBuf> for ImageSource {
    fn from(p: PathBuf) -> Self {
        Self::Path(p)
    }
}

impl From<&Path> for ImageSource {
    fn from(p: &Path) -> Self {
        Self::Path(p.to_path_buf())
    }
}

impl From<Vec<u8>> for ImageSource {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

/// Encoded image formats accepted for storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    /// Sniffs the format from magic bytes.
    pub fn detect(bytes: &[u8]) -> Result<Self> {
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Ok(Self::Jpeg)
        } else if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            Ok(Self::Png)
        } else {
            Err(IdentityError::InvalidImage(
                "unsupported image format, expected jpeg or png".into(),
            ))
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
        }
    }

    /// Maps a file extension (case-insensitive) to a format.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            _ => None,
        }
    }
}

/// Content fingerprint: lowercase hex SHA-256 of the image bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Rejects user ids that cannot safely name a directory.
pub fn validate_user_id(user_id: &str) -> Result<()> {
    let mut components = Path::new(user_id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !user_id.contains(['/', '\\']) => Ok(()),
        _ => Err(IdentityError::InvalidUserId(user_id.to_string())),
    }
}

/// Writes `bytes` to `<images_dir>/<user_id>/<timestamp>_<uuid>.<ext>` and
/// returns the new path. The format must already be known to be valid.
pub fn export_image(
    images_dir: &Path,
    user_id: &str,
    bytes: &[u8],
    format: ImageFormat,
) -> Result<PathBuf> {
    validate_user_id(user_id)?;
    let dir = images_dir.join(user_id);
    fs::create_dir_all(&dir).map_err(|e| IdentityError::io(&dir, e))?;

    let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
    let name = format!("{stamp}_{}.{}", uuid::Uuid::new_v4().simple(), format.extension());
    let path = dir.join(name);
    fs::write(&path, bytes).map_err(|e| IdentityError::io(&path, e))?;
    Ok(path)
}
