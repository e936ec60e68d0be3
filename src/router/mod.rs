//! File router: decides where each photo goes and puts it there.
//!
//! Layout under the output root:
//! ```text
//! /PhotoFiler/
//! ├── cats/
//! │   ├── IMG_0001.jpg
//! │   └── IMG_0001_3fa91c0d.jpg      (same name, different content)
//! ├── unclassified/
//! └── duplicates/
//! ```
//! With the `category-date` layout a `YYYYMMDD` folder is inserted below
//! the category.

use chrono::NaiveDateTime;
use image::{DynamicImage, ImageFormat};
use std::collections::HashSet;
use std::fs::File;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::{FileOperation, FolderLayout, OutputConfig, TargetFormat};
use crate::error::FilerError;
use crate::scanner::{bytes_hash, content_hash, short_hash};

const UNDATED_FOLDER: &str = "undated";
const UNTAGGED: &str = "untagged";

/// What the payload bytes are, as far as re-encoding is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadKind {
    #[default]
    Image,
    /// Could not be decoded; filed with its original bytes.
    Undecodable,
    /// Video or other passthrough media, never re-encoded.
    Media,
}

/// What the router needs to know about one image.
#[derive(Debug, Clone, Copy)]
pub struct FilingRequest<'a> {
    /// Original file; removed on move.
    pub source: &'a Path,
    /// Replaces the source file stem in the destination name.
    pub stem: Option<&'a str>,
    /// File whose bytes are filed: the source or its converted copy.
    pub payload: &'a Path,
    pub content_hash: &'a str,
    /// Category or bucket folder name.
    pub bucket: &'a str,
    pub captured_at: Option<NaiveDateTime>,
    pub kind: PayloadKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFiling {
    pub source: PathBuf,
    pub payload: PathBuf,
    pub destination: PathBuf,
    pub content_hash: String,
    /// Set when the payload has to be re-encoded into the target format.
    pub reencode: Option<ImageFormat>,
    /// The destination already holds exactly these bytes.
    pub already_filed: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilingAction {
    /// Dry run: nothing written.
    Planned,
    Reused,
    Copied,
    Moved,
}

#[derive(Debug, Clone)]
pub struct FilingOutcome {
    pub destination: PathBuf,
    pub action: FilingAction,
    pub warnings: Vec<String>,
}

pub struct Router {
    root: PathBuf,
    operation: FileOperation,
    layout: FolderLayout,
    target_format: TargetFormat,
    dry_run: bool,
    reserved: Mutex<HashSet<PathBuf>>,
}

impl Router {
    pub fn new(config: &OutputConfig) -> Self {
        Self {
            root: config.root.clone(),
            operation: config.operation,
            layout: config.layout,
            target_format: config.target_format,
            dry_run: config.dry_run,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Format `payload` has to be re-encoded into, if the configured target
    /// differs from what it already is.
    pub fn reencode_format(&self, payload: &Path) -> Option<ImageFormat> {
        let payload_ext = lowercase_extension(payload);
        self.target_format
            .extension()
            .filter(|target| normalize_ext(&payload_ext) != *target)
            .and_then(|_| image_format(self.target_format))
    }

    pub fn destination_dir(&self, bucket: &str, captured_at: Option<NaiveDateTime>) -> PathBuf {
        let dir = self.root.join(bucket);
        match self.layout {
            FolderLayout::Category => dir,
            FolderLayout::CategoryDate => match captured_at {
                Some(t) => dir.join(t.format("%Y%m%d").to_string()),
                None => dir.join(UNDATED_FOLDER),
            },
        }
    }

    /// Pick and reserve a destination. Safe to call from several threads:
    /// two requests never receive the same path.
    pub fn plan(&self, req: &FilingRequest<'_>) -> Result<PlannedFiling, FilerError> {
        let dir = self.destination_dir(req.bucket, req.captured_at);
        let stem = match req.stem {
            Some(stem) => stem.to_string(),
            None => file_stem(req.source)?,
        };

        let payload_ext = lowercase_extension(req.payload);
        let converted = req.payload != req.source;
        let mut warnings = Vec::new();
        let reencode = match req.kind {
            PayloadKind::Image => self.reencode_format(req.payload),
            PayloadKind::Media => None,
            PayloadKind::Undecodable => {
                if self.reencode_format(req.payload).is_some() {
                    warnings.push("cannot decode for re-encoding, filing original bytes".to_string());
                }
                None
            }
        };

        let ext = match self.target_format.extension() {
            Some(target) if req.kind == PayloadKind::Image => target.to_string(),
            _ if converted => payload_ext,
            _ => req
                .source
                .extension()
                .map(|e| e.to_string_lossy().to_string())
                .unwrap_or_default(),
        };

        let expected = || match reencode {
            Some(format) => encode_as(req.payload, format).ok().map(|bytes| bytes_hash(&bytes)),
            None if converted => content_hash(req.payload).ok(),
            None => Some(req.content_hash.to_string()),
        };

        let (destination, already_filed) =
            self.reserve(&dir, &stem, &ext, req.content_hash, expected)?;

        Ok(PlannedFiling {
            source: req.source.to_path_buf(),
            payload: req.payload.to_path_buf(),
            destination,
            content_hash: req.content_hash.to_string(),
            reencode,
            already_filed,
            warnings,
        })
    }

    /// Walk the candidate names `stem`, `stem_<hash>`, `stem_<hash>_1`, ...
    /// and take the first that is neither reserved nor occupied by other
    /// content. A candidate already holding the expected bytes is reused.
    fn reserve(
        &self,
        dir: &Path,
        stem: &str,
        ext: &str,
        hash: &str,
        expected: impl FnOnce() -> Option<String>,
    ) -> Result<(PathBuf, bool), FilerError> {
        let mut reserved = self
            .reserved
            .lock()
            .map_err(|e| FilerError::filesystem(dir, std::io::Error::other(e.to_string())))?;

        let dot_ext = if ext.is_empty() {
            String::new()
        } else {
            format!(".{}", ext)
        };
        let short = short_hash(hash);
        let mut expected = Some(expected);
        let mut expected_hash: Option<Option<String>> = None;

        let mut n = 0usize;
        loop {
            let name = match n {
                0 => format!("{}{}", stem, dot_ext),
                1 => format!("{}_{}{}", stem, short, dot_ext),
                _ => format!("{}_{}_{}{}", stem, short, n - 1, dot_ext),
            };
            n += 1;
            let candidate = dir.join(name);

            if reserved.contains(&candidate) {
                continue;
            }
            if candidate.exists() {
                if expected_hash.is_none() {
                    expected_hash = Some(expected.take().and_then(|f| f()));
                }
                let identical = matches!(
                    (expected_hash.as_ref().and_then(|h| h.as_deref()), content_hash(&candidate)),
                    (Some(want), Ok(have)) if want == have
                );
                if !identical {
                    continue;
                }
                reserved.insert(candidate.clone());
                return Ok((candidate, true));
            }

            reserved.insert(candidate.clone());
            return Ok((candidate, false));
        }
    }

    /// Carry out a plan. Nothing is written in dry-run mode, and a failure
    /// never leaves a partial file at the destination.
    pub fn execute(&self, plan: &PlannedFiling) -> Result<FilingOutcome, FilerError> {
        let outcome = |action| FilingOutcome {
            destination: plan.destination.clone(),
            action,
            warnings: plan.warnings.clone(),
        };

        if self.dry_run {
            return Ok(outcome(FilingAction::Planned));
        }

        if plan.already_filed {
            if self.operation == FileOperation::Move && plan.source != plan.destination {
                std::fs::remove_file(&plan.source)
                    .map_err(|e| FilerError::filesystem(&plan.source, e))?;
            }
            return Ok(outcome(FilingAction::Reused));
        }

        if let Some(dir) = plan.destination.parent() {
            std::fs::create_dir_all(dir).map_err(|e| FilerError::filesystem(dir, e))?;
        }

        let destination = &plan.destination;
        match plan.reencode {
            Some(format) => {
                let bytes = encode_as(&plan.payload, format).map_err(|e| FilerError::ConversionFailed {
                    path: plan.payload.clone(),
                    reason: e.to_string(),
                })?;
                write_atomic(destination, |file| file.write_all(&bytes))?;
            }
            None => {
                if self.operation == FileOperation::Move && plan.payload == plan.source {
                    move_file(&plan.source, destination)?;
                    return Ok(outcome(FilingAction::Moved));
                }
                copy_atomic(&plan.payload, destination)?;
            }
        }

        if self.operation == FileOperation::Move {
            std::fs::remove_file(&plan.source).map_err(|e| FilerError::filesystem(&plan.source, e))?;
            return Ok(outcome(FilingAction::Moved));
        }
        Ok(outcome(FilingAction::Copied))
    }
}

fn file_stem(path: &Path) -> Result<String, FilerError> {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .ok_or_else(|| {
            FilerError::filesystem(
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"),
            )
        })
}

/// `YYYYMMDD_HHMM_<tag>_<tag>...` for descriptive naming. Tags are made
/// safe for file names; missing parts become `undated` and `untagged`.
pub fn descriptive_stem(captured_at: Option<NaiveDateTime>, tags: &[String]) -> String {
    let date = captured_at
        .map(|t| t.format("%Y%m%d_%H%M").to_string())
        .unwrap_or_else(|| UNDATED_FOLDER.to_string());

    let tags: Vec<String> = tags
        .iter()
        .map(|tag| tag.trim().replace(|c: char| c.is_whitespace() || c == '/' || c == '\\', "_"))
        .filter(|tag| !tag.is_empty())
        .collect();
    let description = if tags.is_empty() {
        UNTAGGED.to_string()
    } else {
        tags.join("_")
    };

    format!("{}_{}", date, description)
}

fn lowercase_extension(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn normalize_ext(ext: &str) -> &str {
    match ext {
        "jpeg" => "jpg",
        other => other,
    }
}

fn image_format(target: TargetFormat) -> Option<ImageFormat> {
    match target {
        TargetFormat::Auto => None,
        TargetFormat::Jpg => Some(ImageFormat::Jpeg),
        TargetFormat::Png => Some(ImageFormat::Png),
    }
}

fn encode_as(path: &Path, format: ImageFormat) -> image::ImageResult<Vec<u8>> {
    let img = image::open(path)?;
    let mut buf = Cursor::new(Vec::new());
    match format {
        // JPEG has no alpha channel.
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8()).write_to(&mut buf, format)?,
        _ => img.write_to(&mut buf, format)?,
    }
    Ok(buf.into_inner())
}

/// Write through a temporary file in the destination directory and persist
/// it without replacing anything already there.
fn write_atomic(
    destination: &Path,
    write: impl FnOnce(&mut File) -> std::io::Result<()>,
) -> Result<(), FilerError> {
    let fs_err = |e| FilerError::filesystem(destination, e);
    let dir = destination.parent().unwrap_or_else(|| Path::new("."));

    let mut tmp = tempfile::Builder::new()
        .prefix(".photofiler-")
        .tempfile_in(dir)
        .map_err(fs_err)?;
    write(tmp.as_file_mut()).map_err(fs_err)?;
    tmp.as_file().sync_all().map_err(fs_err)?;
    tmp.persist_noclobber(destination).map_err(|e| fs_err(e.error))?;
    Ok(())
}

fn copy_atomic(source: &Path, destination: &Path) -> Result<(), FilerError> {
    let mut reader = File::open(source).map_err(|e| FilerError::filesystem(source, e))?;
    write_atomic(destination, |file| std::io::copy(&mut reader, file).map(|_| ()))
}

/// Rename when possible; across filesystems fall back to copy then remove.
fn move_file(source: &Path, destination: &Path) -> Result<(), FilerError> {
    if destination.exists() {
        return Err(FilerError::filesystem(
            destination,
            std::io::Error::new(std::io::ErrorKind::AlreadyExists, "destination appeared during filing"),
        ));
    }
    if std::fs::rename(source, destination).is_ok() {
        return Ok(());
    }
    copy_atomic(source, destination)?;
    std::fs::remove_file(source).map_err(|e| FilerError::filesystem(source, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Setup {
        _dir: tempfile::TempDir,
        src: PathBuf,
        out: PathBuf,
    }

    fn setup() -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let out = dir.path().join("out");
        std::fs::create_dir_all(&src).unwrap();
        Setup {
            _dir: dir,
            src,
            out,
        }
    }

    fn output(root: &Path) -> OutputConfig {
        OutputConfig {
            root: root.to_path_buf(),
            ..OutputConfig::default()
        }
    }

    fn write(path: &Path, bytes: &[u8]) -> String {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, bytes).unwrap();
        content_hash(path).unwrap()
    }

    fn request<'a>(path: &'a Path, hash: &'a str, bucket: &'a str) -> FilingRequest<'a> {
        FilingRequest {
            source: path,
            stem: None,
            payload: path,
            content_hash: hash,
            bucket,
            captured_at: None,
            kind: PayloadKind::Image,
        }
    }

    #[test]
    fn test_same_name_gets_hash_suffix() {
        let s = setup();
        let a = s.src.join("one/IMG_0001.jpg");
        let b = s.src.join("two/IMG_0001.jpg");
        let ha = write(&a, b"first photo");
        let hb = write(&b, b"second photo");

        let router = Router::new(&output(&s.out));
        let pa = router.plan(&request(&a, &ha, "cats")).unwrap();
        let pb = router.plan(&request(&b, &hb, "cats")).unwrap();

        assert_eq!(pa.destination, s.out.join("cats/IMG_0001.jpg"));
        assert_eq!(
            pb.destination,
            s.out.join(format!("cats/IMG_0001_{}.jpg", &hb[..8]))
        );

        router.execute(&pa).unwrap();
        router.execute(&pb).unwrap();
        assert_eq!(std::fs::read(&pa.destination).unwrap(), b"first photo");
        assert_eq!(std::fs::read(&pb.destination).unwrap(), b"second photo");
        assert!(a.exists(), "copy keeps the source");
    }

    #[test]
    fn test_rerun_reuses_identical_destinations() {
        let s = setup();
        let a = s.src.join("one/IMG_0001.jpg");
        let b = s.src.join("two/IMG_0001.jpg");
        let ha = write(&a, b"first photo");
        let hb = write(&b, b"second photo");

        let first = Router::new(&output(&s.out));
        let plans: Vec<_> = [(&a, &ha), (&b, &hb)]
            .iter()
            .map(|(p, h)| first.plan(&request(p, h, "cats")).unwrap())
            .collect();
        for plan in &plans {
            first.execute(plan).unwrap();
        }

        let second = Router::new(&output(&s.out));
        for ((p, h), earlier) in [(&a, &ha), (&b, &hb)].iter().zip(&plans) {
            let plan = second.plan(&request(p, h, "cats")).unwrap();
            assert_eq!(plan.destination, earlier.destination);
            assert!(plan.already_filed);
            assert_eq!(second.execute(&plan).unwrap().action, FilingAction::Reused);
        }
        assert_eq!(std::fs::read_dir(s.out.join("cats")).unwrap().count(), 2);
    }

    #[test]
    fn test_numbered_suffix_after_hash_suffix() {
        let s = setup();
        let a = s.src.join("IMG_0001.jpg");
        let ha = write(&a, b"new photo");
        write(&s.out.join("cats/IMG_0001.jpg"), b"other");
        write(&s.out.join(format!("cats/IMG_0001_{}.jpg", &ha[..8])), b"yet another");

        let router = Router::new(&output(&s.out));
        let plan = router.plan(&request(&a, &ha, "cats")).unwrap();
        assert_eq!(
            plan.destination,
            s.out.join(format!("cats/IMG_0001_{}_1.jpg", &ha[..8]))
        );
        assert!(!plan.already_filed);
    }

    #[test]
    fn test_concurrent_planning_never_collides() {
        let s = setup();
        let a = s.src.join("IMG_0001.jpg");
        let ha = write(&a, b"photo");
        let router = Router::new(&output(&s.out));

        let destinations: Vec<PathBuf> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| router.plan(&request(&a, &ha, "cats")).unwrap().destination))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let unique: HashSet<_> = destinations.iter().collect();
        assert_eq!(unique.len(), destinations.len());
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let s = setup();
        let a = s.src.join("IMG_0001.jpg");
        let ha = write(&a, b"photo");
        let mut config = output(&s.out);
        config.dry_run = true;

        let router = Router::new(&config);
        let plan = router.plan(&request(&a, &ha, "cats")).unwrap();
        let outcome = router.execute(&plan).unwrap();

        assert_eq!(outcome.action, FilingAction::Planned);
        assert!(!s.out.exists());
    }

    #[test]
    fn test_move_removes_source() {
        let s = setup();
        let a = s.src.join("IMG_0001.jpg");
        let ha = write(&a, b"photo");
        let mut config = output(&s.out);
        config.operation = FileOperation::Move;

        let router = Router::new(&config);
        let plan = router.plan(&request(&a, &ha, "dogs")).unwrap();
        let outcome = router.execute(&plan).unwrap();

        assert_eq!(outcome.action, FilingAction::Moved);
        assert!(!a.exists());
        assert_eq!(std::fs::read(s.out.join("dogs/IMG_0001.jpg")).unwrap(), b"photo");
    }

    #[test]
    fn test_target_format_reencodes() {
        let s = setup();
        let a = s.src.join("IMG_0002.png");
        image::RgbImage::from_pixel(8, 8, image::Rgb([200, 10, 10]))
            .save(&a)
            .unwrap();
        let ha = content_hash(&a).unwrap();
        let mut config = output(&s.out);
        config.target_format = TargetFormat::Jpg;

        let router = Router::new(&config);
        let plan = router.plan(&request(&a, &ha, "cats")).unwrap();
        assert_eq!(plan.reencode, Some(ImageFormat::Jpeg));
        let outcome = router.execute(&plan).unwrap();

        assert_eq!(outcome.destination, s.out.join("cats/IMG_0002.jpg"));
        let format = image::ImageReader::open(&outcome.destination)
            .unwrap()
            .with_guessed_format()
            .unwrap()
            .format();
        assert_eq!(format, Some(ImageFormat::Jpeg));
    }

    #[test]
    fn test_undecodable_payload_keeps_original_bytes() {
        let s = setup();
        let a = s.src.join("broken.png");
        let ha = write(&a, b"not really a png");
        let mut config = output(&s.out);
        config.target_format = TargetFormat::Jpg;

        let router = Router::new(&config);
        let plan = router
            .plan(&FilingRequest {
                kind: PayloadKind::Undecodable,
                ..request(&a, &ha, "cats")
            })
            .unwrap();
        // The fallback name is fixed while planning, not when writing.
        assert_eq!(plan.destination, s.out.join("cats/broken.png"));
        assert_eq!(plan.reencode, None);
        assert_eq!(plan.warnings.len(), 1);

        let outcome = router.execute(&plan).unwrap();
        assert_eq!(outcome.destination, plan.destination);
        assert_eq!(outcome.warnings, plan.warnings);
        assert_eq!(std::fs::read(&outcome.destination).unwrap(), b"not really a png");
    }

    #[test]
    fn test_failed_encode_leaves_no_file() {
        let s = setup();
        let a = s.src.join("broken.png");
        let ha = write(&a, b"not really a png");
        let mut config = output(&s.out);
        config.target_format = TargetFormat::Jpg;

        let router = Router::new(&config);
        let plan = router.plan(&request(&a, &ha, "cats")).unwrap();
        let err = router.execute(&plan).unwrap_err();

        assert!(matches!(err, FilerError::ConversionFailed { .. }));
        assert!(!plan.destination.exists());
    }

    #[test]
    fn test_media_is_never_reencoded() {
        let s = setup();
        let a = s.src.join("clip.mov");
        let ha = write(&a, b"moov");
        let mut config = output(&s.out);
        config.target_format = TargetFormat::Jpg;

        let router = Router::new(&config);
        let plan = router
            .plan(&FilingRequest {
                kind: PayloadKind::Media,
                ..request(&a, &ha, "unclassified")
            })
            .unwrap();
        assert_eq!(plan.destination, s.out.join("unclassified/clip.mov"));
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn test_descriptive_names() {
        let s = setup();
        let a = s.src.join("IMG_0001.JPG");
        let ha = write(&a, b"photo");
        let taken = chrono::NaiveDate::from_ymd_opt(2024, 3, 15)
            .and_then(|d| d.and_hms_opt(9, 30, 0));
        let tags = vec![
            "blue_water_pipe".to_string(),
            "open trench excavation".to_string(),
        ];

        let stem = descriptive_stem(taken, &tags);
        assert_eq!(stem, "20240315_0930_blue_water_pipe_open_trench_excavation");
        assert_eq!(descriptive_stem(None, &[]), "undated_untagged");

        let router = Router::new(&output(&s.out));
        let plan = router
            .plan(&FilingRequest {
                stem: Some(&stem),
                ..request(&a, &ha, "pipes")
            })
            .unwrap();
        assert_eq!(
            plan.destination,
            s.out.join(format!("pipes/{}.JPG", stem))
        );
    }

    #[test]
    fn test_category_date_layout() {
        let s = setup();
        let mut config = output(&s.out);
        config.layout = FolderLayout::CategoryDate;
        let router = Router::new(&config);

        let taken = chrono::NaiveDate::from_ymd_opt(2024, 3, 15)
            .and_then(|d| d.and_hms_opt(9, 30, 0));
        assert_eq!(router.destination_dir("cats", taken), s.out.join("cats/20240315"));
        assert_eq!(router.destination_dir("cats", None), s.out.join("cats/undated"));
    }
}
