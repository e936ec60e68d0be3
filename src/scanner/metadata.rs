use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Where a capture time was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSource {
    Exif,
    Modified,
}

#[derive(Debug, Clone, Default)]
pub struct ImageMetadata {
    pub format: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub size_bytes: u64,
    pub captured_at: Option<NaiveDateTime>,
    pub capture_source: Option<CaptureSource>,
}

impl ImageMetadata {
    /// Pixel count, when dimensions are known.
    pub fn resolution(&self) -> Option<u64> {
        match (self.width, self.height) {
            (Some(w), Some(h)) => Some(w as u64 * h as u64),
            _ => None,
        }
    }
}

/// Read format, dimensions and capture time.
///
/// Only the file size is mandatory; everything else is best effort because
/// HEIC and damaged files still need to be filed.
pub fn extract_metadata(path: &Path) -> std::io::Result<ImageMetadata> {
    let file_metadata = std::fs::metadata(path)?;
    let mut metadata = ImageMetadata {
        size_bytes: file_metadata.len(),
        ..Default::default()
    };

    metadata.format = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase());

    if let Ok(reader) = image::ImageReader::open(path).and_then(|r| r.with_guessed_format()) {
        if let Some(format) = reader.format() {
            metadata.format = Some(format!("{:?}", format).to_lowercase());
        }
        if let Ok((w, h)) = reader.into_dimensions() {
            metadata.width = Some(w);
            metadata.height = Some(h);
        }
    }

    if let Some(taken) = exif_capture_time(path) {
        metadata.captured_at = Some(taken);
        metadata.capture_source = Some(CaptureSource::Exif);
    } else if let Ok(modified) = file_metadata.modified() {
        let local: DateTime<Local> = modified.into();
        metadata.captured_at = Some(local.naive_local());
        metadata.capture_source = Some(CaptureSource::Modified);
    }

    Ok(metadata)
}

fn exif_capture_time(path: &Path) -> Option<NaiveDateTime> {
    let file = File::open(path).ok()?;
    let mut bufreader = BufReader::new(file);
    let exif = exif::Reader::new().read_from_container(&mut bufreader).ok()?;

    let field = exif.get_field(exif::Tag::DateTimeOriginal, exif::In::PRIMARY)?;
    let exif::Value::Ascii(ref values) = field.value else {
        return None;
    };
    let dt = exif::DateTime::from_ascii(values.first()?).ok()?;

    NaiveDate::from_ymd_opt(dt.year as i32, dt.month as u32, dt.day as u32)?
        .and_hms_opt(dt.hour as u32, dt.minute as u32, dt.second as u32)
}
