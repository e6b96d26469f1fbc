//! Per-request scratch storage.
//!
//! Every request works inside its own uniquely named directory under the
//! scratch root. The directory and everything in it is removed when the
//! [`ScratchDir`] is dropped, on success and failure alike.

use std::io;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat};
use tempfile::TempDir;
use tracing::debug;

use crate::error::ApiError;

#[derive(Debug, Clone)]
pub struct ScratchSpace {
    root: PathBuf,
}

impl ScratchSpace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the root on demand and opens a fresh request directory.
    pub fn session(&self) -> io::Result<ScratchDir> {
        std::fs::create_dir_all(&self.root)?;
        let dir = tempfile::Builder::new()
            .prefix("request-")
            .tempdir_in(&self.root)?;
        debug!(path = %dir.path().display(), "opened scratch directory");
        Ok(ScratchDir { dir })
    }
}

pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    /// Writes `bytes` under `name`, which must already be a safe file name.
    pub fn write(&self, name: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        let path = self.dir.path().join(name);
        std::fs::write(&path, bytes)?;
        Ok(path)
    }

    /// Saves `image` under `name` and reads the encoded file back. The format
    /// follows the extension, falling back to PNG.
    pub fn persist_image(&self, name: &str, image: &DynamicImage) -> Result<Vec<u8>, ApiError> {
        let path = self.dir.path().join(name);
        let format = ImageFormat::from_path(&path).unwrap_or(ImageFormat::Png);
        image.save_with_format(&path, format)?;
        Ok(std::fs::read(&path)?)
    }
}

/// Longest theme component embedded in an output name.
pub const MAX_THEME_LEN: usize = 64;

/// Longest uploaded name kept, so `processed_<theme>_<name>` stays within
/// the 255 byte file name limit of common filesystems.
pub const MAX_UPLOAD_NAME_LEN: usize = 255 - "processed__".len() - MAX_THEME_LEN;

const MAX_EXTENSION_LEN: usize = 16;

/// Reduces a client supplied name to a single path component of at most
/// `max_len` bytes, or `fallback` when nothing usable is left. Overlong names
/// lose the end of their stem; a short extension is kept.
pub fn safe_file_name(name: &str, fallback: &str, max_len: usize) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    let cleaned: String = last
        .chars()
        .filter(|c| !c.is_control() && *c != ':')
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => fallback.to_owned(),
        _ => truncate_name(cleaned, max_len),
    }
}

fn truncate_name(name: String, max_len: usize) -> String {
    if name.len() <= max_len {
        return name;
    }
    let (stem, extension) = match name.rfind('.') {
        Some(dot) if dot > 0 && name.len() - dot <= MAX_EXTENSION_LEN => name.split_at(dot),
        _ => (name.as_str(), ""),
    };
    let mut end = max_len.saturating_sub(extension.len()).min(stem.len());
    while !stem.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{extension}", &stem[..end])
}
