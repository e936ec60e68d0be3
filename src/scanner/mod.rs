pub mod discovery;
pub mod hashing;
pub mod metadata;

use std::path::{Path, PathBuf};

use crate::error::FilerError;

pub use discovery::{discover_images, is_media_file, Discovery};
pub use hashing::{bytes_hash, content_hash, short_hash};
pub use metadata::{CaptureSource, ImageMetadata};

/// Identity and metadata of one source file.
#[derive(Debug, Clone)]
pub struct ScannedPhoto {
    pub path: PathBuf,
    pub content_hash: String,
    pub metadata: ImageMetadata,
}

/// Hash a file and read its metadata.
pub fn scan_file(path: &Path) -> Result<ScannedPhoto, FilerError> {
    let content_hash = hashing::content_hash(path).map_err(|e| FilerError::filesystem(path, e))?;
    let metadata = metadata::extract_metadata(path).map_err(|e| FilerError::filesystem(path, e))?;

    Ok(ScannedPhoto {
        path: path.to_path_buf(),
        content_hash,
        metadata,
    })
}
