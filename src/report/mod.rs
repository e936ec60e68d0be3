//! CSV processing log, one row per image.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

use crate::pipeline::ImageRecord;
use crate::router::PayloadKind;

pub const LOG_FILE_NAME: &str = "photofiler_log.csv";

#[derive(Debug, Serialize)]
pub struct LogRow {
    pub original_path: String,
    pub final_path: String,
    pub category: String,
    pub score: String,
    pub rationale: String,
    pub duplicate_group: String,
    pub converted: bool,
    pub state: String,
    pub error: String,
    pub warnings: String,
    pub tags: String,
}

impl LogRow {
    pub fn from_record(record: &ImageRecord) -> Self {
        let classification = record.classification.as_ref();
        // Empty for unclassified images; multi-label results are joined.
        let category = classification
            .map(|c| c.labels.join(";"))
            .unwrap_or_default();
        let rationale = match classification {
            Some(c) => c.rationale.to_string(),
            None if record.payload_kind == PayloadKind::Media => "media".to_string(),
            None if record.unembeddable => "not-embedded".to_string(),
            None => String::new(),
        };

        LogRow {
            original_path: record.source.display().to_string(),
            final_path: record
                .destination
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            category,
            score: classification
                .and_then(|c| c.top_score())
                .map(|s| format!("{:.4}", s))
                .unwrap_or_default(),
            rationale,
            duplicate_group: record
                .duplicate
                .as_ref()
                .map(|d| d.group.to_string())
                .unwrap_or_default(),
            converted: record.normalized.is_some(),
            state: record.state.kind().to_string(),
            error: record.state.detail().unwrap_or_default(),
            warnings: record.warnings.join("; "),
            tags: record.name_tags.join(";"),
        }
    }
}

/// Write the log to `path`, replacing any previous one. Returns the number
/// of rows written.
pub fn write_log<'a>(path: &Path, records: impl IntoIterator<Item = &'a ImageRecord>) -> Result<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut count = 0;
    for record in records {
        wtr.serialize(LogRow::from_record(record))?;
        count += 1;
    }

    wtr.flush()?;
    Ok(count)
}
