use anyhow::Result;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use crate::config::ScannerConfig;

/// NAS thumbnail folders that never hold originals.
const SKIP_DIR_NAMES: &[&str] = &["@eaDir"];

/// Outcome of walking the batch sources.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    /// Image and passthrough media files, sorted and de-duplicated.
    pub images: Vec<PathBuf>,
    /// Sources that were given explicitly but cannot be processed.
    pub rejected: Vec<(PathBuf, String)>,
}

/// Collect image files from a mix of directories and individual files.
///
/// Directories are walked recursively; explicitly named files are checked
/// for existence and extension so that the caller can report why they were
/// left out.
pub fn discover_images(sources: &[PathBuf], config: &ScannerConfig) -> Result<Discovery> {
    let mut images = BTreeSet::new();
    let mut rejected = Vec::new();

    for source in sources {
        if source.is_dir() {
            for entry in WalkDir::new(source)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| keep_entry(e, config.skip_hidden))
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                if entry.file_type().is_file() && is_accepted(path, config) {
                    images.insert(path.to_path_buf());
                }
            }
        } else if source.is_file() {
            if is_accepted(source, config) {
                images.insert(source.clone());
            } else {
                rejected.push((source.clone(), "unsupported file type".to_string()));
            }
        } else {
            rejected.push((source.clone(), "file not found".to_string()));
        }
    }

    Ok(Discovery {
        images: images.into_iter().collect(),
        rejected,
    })
}

fn keep_entry(entry: &DirEntry, skip_hidden: bool) -> bool {
    // The walk root is always kept, even if its own name is hidden.
    if entry.depth() == 0 {
        return true;
    }
    let name = entry.file_name().to_string_lossy();
    if skip_hidden && name.starts_with('.') {
        return false;
    }
    !(entry.file_type().is_dir() && SKIP_DIR_NAMES.contains(&name.as_ref()))
}

fn is_accepted(path: &Path, config: &ScannerConfig) -> bool {
    has_extension(path, &config.image_extensions) || is_media_file(path, config)
}

/// Video clips are filed alongside the photos but never embedded.
pub fn is_media_file(path: &Path, config: &ScannerConfig) -> bool {
    has_extension(path, &config.media_extensions)
}

pub fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| {
            let ext_lower = ext.to_string_lossy().to_lowercase();
            extensions.iter().any(|e| e.to_lowercase() == ext_lower)
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::tempdir;

    #[test]
    fn test_discover_images() {
        let dir = tempdir().unwrap();

        File::create(dir.path().join("photo1.jpg")).unwrap();
        File::create(dir.path().join("photo2.PNG")).unwrap();
        File::create(dir.path().join("document.txt")).unwrap();
        File::create(dir.path().join("clip.MOV")).unwrap();
        File::create(dir.path().join(".hidden.jpg")).unwrap();

        fs::create_dir(dir.path().join("subdir")).unwrap();
        File::create(dir.path().join("subdir/photo3.jpeg")).unwrap();
        fs::create_dir(dir.path().join("@eaDir")).unwrap();
        File::create(dir.path().join("@eaDir/thumb.jpg")).unwrap();

        let config = ScannerConfig::default();
        let found = discover_images(&[dir.path().to_path_buf()], &config).unwrap();

        assert_eq!(found.images.len(), 4);
        assert!(found.rejected.is_empty());
        assert!(is_media_file(&dir.path().join("clip.MOV"), &config));
        assert!(!is_media_file(&dir.path().join("photo1.jpg"), &config));
        let mut sorted = found.images.clone();
        sorted.sort();
        assert_eq!(found.images, sorted);
    }

    #[test]
    fn test_explicit_files_are_checked() {
        let dir = tempdir().unwrap();
        let photo = dir.path().join("a.heic");
        let text = dir.path().join("notes.txt");
        File::create(&photo).unwrap();
        File::create(&text).unwrap();
        let missing = dir.path().join("gone.jpg");

        let config = ScannerConfig::default();
        let sources = vec![photo.clone(), text.clone(), missing.clone(), photo.clone()];
        let found = discover_images(&sources, &config).unwrap();

        assert_eq!(found.images, vec![photo]);
        assert_eq!(found.rejected.len(), 2);
        assert_eq!(found.rejected[0].0, text);
        assert_eq!(found.rejected[1], (missing, "file not found".to_string()));
    }
}
