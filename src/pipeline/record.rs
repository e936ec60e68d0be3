//! Per-image records and the arena that owns them for one batch.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::clip::Embedding;
use crate::error::FilerError;
use crate::matcher::ClassificationResult;
use crate::router::{FilingAction, PayloadKind, PlannedFiling};
use crate::scanner::ImageMetadata;

/// Index of a record in the batch arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(pub usize);

/// Where an image is in the pipeline.
#[derive(Debug)]
pub enum ImageState {
    Discovered,
    Embedding,
    Embedded,
    Classifying,
    Classified,
    DuplicateCheck,
    Filing,
    Done,
    Failed(FilerError),
    Skipped(String),
}

/// Payload-free view of [`ImageState`], used for counting and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateKind {
    Discovered,
    Embedding,
    Embedded,
    Classifying,
    Classified,
    DuplicateCheck,
    Filing,
    Done,
    Failed,
    Skipped,
}

impl StateKind {
    pub const ALL: [StateKind; 10] = [
        StateKind::Discovered,
        StateKind::Embedding,
        StateKind::Embedded,
        StateKind::Classifying,
        StateKind::Classified,
        StateKind::DuplicateCheck,
        StateKind::Filing,
        StateKind::Done,
        StateKind::Failed,
        StateKind::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StateKind::Discovered => "discovered",
            StateKind::Embedding => "embedding",
            StateKind::Embedded => "embedded",
            StateKind::Classifying => "classifying",
            StateKind::Classified => "classified",
            StateKind::DuplicateCheck => "duplicate-check",
            StateKind::Filing => "filing",
            StateKind::Done => "done",
            StateKind::Failed => "failed",
            StateKind::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StateKind::Done | StateKind::Failed | StateKind::Skipped)
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ImageState {
    pub fn kind(&self) -> StateKind {
        match self {
            ImageState::Discovered => StateKind::Discovered,
            ImageState::Embedding => StateKind::Embedding,
            ImageState::Embedded => StateKind::Embedded,
            ImageState::Classifying => StateKind::Classifying,
            ImageState::Classified => StateKind::Classified,
            ImageState::DuplicateCheck => StateKind::DuplicateCheck,
            ImageState::Filing => StateKind::Filing,
            ImageState::Done => StateKind::Done,
            ImageState::Failed(_) => StateKind::Failed,
            ImageState::Skipped(_) => StateKind::Skipped,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }

    /// Error or skip reason, if any.
    pub fn detail(&self) -> Option<String> {
        match self {
            ImageState::Failed(e) => Some(format!("{}: {}", e.kind(), e)),
            ImageState::Skipped(reason) => Some(reason.clone()),
            _ => None,
        }
    }
}

/// Membership of an image in a duplicate group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateMark {
    /// 1-based group number, in representative path order.
    pub group: usize,
    pub representative: ImageId,
}

#[derive(Debug)]
pub struct ImageRecord {
    pub id: ImageId,
    pub source: PathBuf,
    pub content_hash: Option<String>,
    pub metadata: Option<ImageMetadata>,
    /// Converted copy used instead of the source, if any.
    pub normalized: Option<PathBuf>,
    pub embedding: Option<Embedding>,
    pub from_cache: bool,
    /// Could be neither converted nor decoded; filed as unclassified.
    pub unembeddable: bool,
    pub payload_kind: PayloadKind,
    /// Colour heuristic tags, only computed for descriptive names.
    pub color_tags: Vec<String>,
    /// Tags used in the descriptive file name.
    pub name_tags: Vec<String>,
    pub classification: Option<ClassificationResult>,
    pub duplicate: Option<DuplicateMark>,
    pub plan: Option<PlannedFiling>,
    pub destination: Option<PathBuf>,
    pub action: Option<FilingAction>,
    pub warnings: Vec<String>,
    pub state: ImageState,
}

impl ImageRecord {
    fn new(id: ImageId, source: PathBuf) -> Self {
        Self {
            id,
            source,
            content_hash: None,
            metadata: None,
            normalized: None,
            embedding: None,
            from_cache: false,
            unembeddable: false,
            payload_kind: PayloadKind::Image,
            color_tags: Vec::new(),
            name_tags: Vec::new(),
            classification: None,
            duplicate: None,
            plan: None,
            destination: None,
            action: None,
            warnings: Vec::new(),
            state: ImageState::Discovered,
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(path = ?self.source, "{}", message);
        self.warnings.push(message);
    }

    /// Representative of a group it does not lead.
    pub fn is_redundant_duplicate(&self) -> bool {
        self.duplicate
            .as_ref()
            .is_some_and(|mark| mark.representative != self.id)
    }

    /// The file actually embedded and filed.
    pub fn payload(&self) -> &Path {
        self.normalized.as_deref().unwrap_or(&self.source)
    }
}

/// Owns every record of a batch. Ids are arena indices, so lookups are
/// direct and records never move.
#[derive(Debug, Default)]
pub struct RecordArena {
    records: Vec<ImageRecord>,
}

impl RecordArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, source: PathBuf) -> ImageId {
        let id = ImageId(self.records.len());
        self.records.push(ImageRecord::new(id, source));
        id
    }

    pub fn get(&self, id: ImageId) -> Option<&ImageRecord> {
        self.records.get(id.0)
    }

    pub fn get_mut(&mut self, id: ImageId) -> Option<&mut ImageRecord> {
        self.records.get_mut(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImageRecord> {
        self.records.iter()
    }

    pub fn records_mut(&mut self) -> &mut [ImageRecord] {
        &mut self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
