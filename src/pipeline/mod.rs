//! Batch orchestrator.
//!
//! Drives every discovered image through
//! `discovered -> embedding -> embedded -> classifying -> classified ->
//! duplicate-check -> filing -> done`, with `failed` reachable from any step
//! and `skipped` for cancelled images and suppressed duplicates.
//!
//! Embedding and filing run on a rayon pool; classification, duplicate
//! detection and destination planning are sequential so that the outcome
//! does not depend on thread scheduling.

pub mod events;
pub mod record;

use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::anchors::{self, AnchorSet};
use crate::cache::EmbeddingCache;
use crate::clip::EmbeddingProvider;
use crate::color;
use crate::config::{Config, DuplicateAction, FileNaming};
use crate::convert::{self, ConvertError, FormatConverter};
use crate::duplicates::{Candidate, DuplicateDetector};
use crate::error::{BatchError, FilerError};
use crate::matcher::Matcher;
use crate::report;
use crate::router::{descriptive_stem, FilingRequest, PayloadKind, Router};
use crate::scanner::{discover_images, is_media_file, scan_file};

pub use events::{BatchEvent, BatchSummary, CancelFlag, Stage, StateCounts};
pub use record::{DuplicateMark, ImageId, ImageRecord, ImageState, RecordArena, StateKind};

use events::ProgressTracker;

const CANCELLED: &str = "cancelled";
const ABORTED: &str = "batch aborted";

pub struct Pipeline {
    config: Config,
    provider: Arc<dyn EmbeddingProvider>,
    anchors: Arc<AnchorSet>,
    cache: Arc<EmbeddingCache>,
    converter: Box<dyn FormatConverter>,
    matcher: Matcher,
    detector: DuplicateDetector,
    router: Router,
    cancel: CancelFlag,
    events: Option<Sender<BatchEvent>>,
}

impl Pipeline {
    /// Validate the configuration, build the anchors and open the cache.
    /// Any failure here is fatal for the batch.
    pub fn new(config: Config, provider: Arc<dyn EmbeddingProvider>) -> Result<Self, BatchError> {
        config.validate()?;

        let definitions = if config.anchors.is_empty() {
            anchors::default_definitions()
        } else {
            config.anchors.clone()
        };
        let anchors = AnchorSet::build(&definitions, provider.as_ref())?;
        tracing::info!(
            categories = anchors.len(),
            model = provider.model_id(),
            "Anchor set built"
        );

        let cache = if config.cache.enabled {
            EmbeddingCache::open(&config.cache.path, provider.model_id())?
        } else {
            EmbeddingCache::in_memory(provider.model_id())?
        };

        Ok(Self {
            converter: convert::from_config(&config.converter),
            matcher: Matcher::new(&config.matching),
            detector: DuplicateDetector::new(&config.duplicates),
            router: Router::new(&config.output),
            anchors: Arc::new(anchors),
            cache: Arc::new(cache),
            provider,
            config,
            cancel: CancelFlag::new(),
            events: None,
        })
    }

    pub fn with_converter(mut self, converter: Box<dyn FormatConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn with_events(mut self, sender: Sender<BatchEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Process every image under `sources` (directories or single files).
    ///
    /// Per-image problems end up in the summary; only setup failures and
    /// systemic filesystem trouble abort the batch.
    pub fn run(&self, sources: &[PathBuf]) -> Result<BatchSummary, BatchError> {
        let started = Instant::now();
        let tracker = ProgressTracker::new(self.config.batch.progress_every, self.events.clone());
        let guard = FailureGuard::new(self.config.batch.max_consecutive_fs_failures);

        tracker.begin_stage(Stage::Discovery);
        let discovery = discover_images(sources, &self.config.scanner)
            .map_err(|e| BatchError::Discovery(format!("{:#}", e)))?;

        let mut rejected = discovery.rejected;
        let mut arena = RecordArena::new();
        let output_root = self.router.root().canonicalize().ok();
        for path in discovery.images {
            // Never re-file what an earlier run already filed, however the
            // source was spelled.
            let inside_output = path.starts_with(self.router.root())
                || output_root.as_ref().is_some_and(|root| {
                    path.canonicalize().is_ok_and(|p| p.starts_with(root))
                });
            if inside_output {
                rejected.push((path, "inside the output folder".to_string()));
                continue;
            }
            arena.push(path);
        }
        for (path, reason) in &rejected {
            tracing::warn!(path = ?path, reason = %reason, "Source rejected");
        }

        tracker.discovered(arena.len());
        tracker.send(BatchEvent::Started { total: arena.len() });
        tracing::info!(images = arena.len(), rejected = rejected.len(), "Discovery finished");

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.batch.workers)
            .thread_name(|i| format!("photofiler-{}", i))
            .build()
            .map_err(|e| BatchError::WorkerPool(e.to_string()))?;

        // Converted copies live here until filing is over.
        let workdir = tempfile::Builder::new()
            .prefix("photofiler-")
            .tempdir()
            .map_err(|e| FilerError::filesystem(std::env::temp_dir(), e))?;

        self.embed_all(&mut arena, &pool, workdir.path(), &tracker, &guard)?;
        self.classify_all(&mut arena, &tracker);
        self.check_duplicates(&mut arena, &tracker);
        self.plan_filing(&mut arena, &tracker, &guard)?;
        self.execute_filing(&mut arena, &pool, &tracker, &guard)?;

        let cancelled = self.cancel.is_cancelled();
        if cancelled {
            for record in arena.records_mut() {
                if !record.state.is_terminal() {
                    self.transition(record, ImageState::Skipped(CANCELLED.to_string()), &tracker);
                }
            }
            tracing::warn!("Batch cancelled");
            tracker.send(BatchEvent::Cancelled);
        }

        tracker.begin_stage(Stage::Report);
        let mut summary = self.summarize(&arena, rejected, cancelled);
        if self.config.output.write_log && summary.filed + summary.failed > 0 {
            summary.log_path = self.write_log(&arena);
        }

        let message = format!(
            "{} filed, {} unclassified, {} duplicates, {} failed, {} skipped in {:.1}s",
            summary.filed,
            summary.unclassified,
            summary.duplicates,
            summary.failed,
            summary.skipped,
            started.elapsed().as_secs_f64()
        );
        tracing::info!(
            cache_hits = summary.cache_hits,
            computed = summary.embeddings_computed,
            converted = summary.converted,
            "{}",
            message
        );
        tracker.send(BatchEvent::Completed { message });

        Ok(summary)
    }

    fn embed_all(
        &self,
        arena: &mut RecordArena,
        pool: &rayon::ThreadPool,
        workdir: &Path,
        tracker: &ProgressTracker,
        guard: &FailureGuard,
    ) -> Result<(), BatchError> {
        tracker.begin_stage(Stage::Embedding);
        let total = arena.len();

        pool.install(|| {
            arena.records_mut().par_iter_mut().for_each(|record| {
                match self.stop_reason(guard) {
                    Some(reason) => self.transition(record, ImageState::Skipped(reason.to_string()), tracker),
                    None => self.embed_one(record, workdir, tracker, guard),
                }
                tracker.step(Stage::Embedding, total);
            });
        });

        guard.check()
    }

    fn embed_one(
        &self,
        record: &mut ImageRecord,
        workdir: &Path,
        tracker: &ProgressTracker,
        guard: &FailureGuard,
    ) {
        self.transition(record, ImageState::Embedding, tracker);

        let scanned = match scan_file(&record.source) {
            Ok(scanned) => {
                guard.success();
                scanned
            }
            Err(e) => {
                guard.failure(&e);
                self.transition(record, ImageState::Failed(e), tracker);
                return;
            }
        };
        let hash = scanned.content_hash.clone();
        record.content_hash = Some(scanned.content_hash);
        record.metadata = Some(scanned.metadata);

        if is_media_file(&record.source, &self.config.scanner) {
            tracing::debug!(path = ?record.source, "Media file, filed without embedding");
            record.payload_kind = PayloadKind::Media;
            self.transition(record, ImageState::Embedded, tracker);
            return;
        }

        let mut conversion_failed = false;
        if convert::needs_conversion(&record.source, &self.config.converter) {
            match self.converter.convert(&record.source, workdir) {
                Ok(converted) => {
                    tracing::debug!(path = ?record.source, converted = ?converted, "Converted");
                    record.normalized = Some(converted);
                }
                Err(ConvertError::Unavailable { format }) => {
                    conversion_failed = true;
                    let err = FilerError::UnsupportedFormat {
                        path: record.source.clone(),
                        format,
                    };
                    record.warn(err.to_string());
                }
                Err(e) => {
                    conversion_failed = true;
                    let err = FilerError::ConversionFailed {
                        path: record.source.clone(),
                        reason: e.to_string(),
                    };
                    record.warn(err.to_string());
                }
            }
        }

        self.inspect_pixels(record);

        match self.cache.get(&hash) {
            Ok(Some(vector)) => {
                record.embedding = Some(vector);
                record.from_cache = true;
                self.transition(record, ImageState::Embedded, tracker);
                return;
            }
            Ok(None) => {}
            Err(e) => record.warn(format!("cache lookup failed: {}", e)),
        }

        let embed_started = Instant::now();
        let payload = record.payload().to_path_buf();
        match self.provider.embed_image(&payload) {
            Ok(vector) => {
                if let Err(e) = self.cache.put(&hash, &vector) {
                    record.warn(format!("cache write failed: {}", e));
                }
                record.embedding = Some(vector);
            }
            Err(e) if conversion_failed => {
                record.warn(format!("filed without classification: {}", e));
                record.unembeddable = true;
                self.transition(record, ImageState::Embedded, tracker);
                return;
            }
            Err(e) => {
                self.transition(record, ImageState::Failed(e), tracker);
                return;
            }
        }

        let elapsed = embed_started.elapsed();
        if let Some(budget) = self.time_budget() {
            if elapsed > budget {
                let err = FilerError::TimeBudgetExceeded {
                    path: record.source.clone(),
                    elapsed_ms: elapsed.as_millis(),
                    budget_ms: budget.as_millis(),
                };
                self.transition(record, ImageState::Failed(err), tracker);
                return;
            }
        }

        self.transition(record, ImageState::Embedded, tracker);
    }

    /// Decode the payload when filing needs more than the embedding: colour
    /// tags for descriptive names, or a decodability check before re-encoding.
    fn inspect_pixels(&self, record: &mut ImageRecord) {
        let output = &self.config.output;
        let wants_colors = output.naming == FileNaming::Descriptive && output.color_tags;
        let reencode = self.router.reencode_format(record.payload()).is_some();
        if !wants_colors && !reencode {
            return;
        }

        match image::open(record.payload()) {
            Ok(img) => {
                if wants_colors {
                    record.color_tags = color::color_tags(&img);
                }
            }
            Err(e) => {
                tracing::debug!(path = ?record.source, error = %e, "Payload not decodable");
                if reencode {
                    record.payload_kind = PayloadKind::Undecodable;
                }
            }
        }
    }

    fn classify_all(&self, arena: &mut RecordArena, tracker: &ProgressTracker) {
        tracker.begin_stage(Stage::Classification);
        let total = arena
            .iter()
            .filter(|r| matches!(r.state, ImageState::Embedded))
            .count();

        for record in arena.records_mut() {
            if !matches!(record.state, ImageState::Embedded) {
                continue;
            }
            if self.cancel.is_cancelled() {
                self.transition(record, ImageState::Skipped(CANCELLED.to_string()), tracker);
                continue;
            }

            self.transition(record, ImageState::Classifying, tracker);
            let result = record
                .embedding
                .as_ref()
                .map(|embedding| self.matcher.classify(embedding, &self.anchors));
            if let Some(result) = &result {
                tracing::debug!(
                    path = ?record.source,
                    rationale = %result.rationale,
                    category = result.primary().unwrap_or("-"),
                    "Classified"
                );
            }
            record.classification = result;
            self.transition(record, ImageState::Classified, tracker);
            tracker.step(Stage::Classification, total);
        }
    }

    fn check_duplicates(&self, arena: &mut RecordArena, tracker: &ProgressTracker) {
        tracker.begin_stage(Stage::DuplicateCheck);

        for record in arena.records_mut() {
            if !matches!(record.state, ImageState::Classified) {
                continue;
            }
            let next = if self.cancel.is_cancelled() {
                ImageState::Skipped(CANCELLED.to_string())
            } else {
                ImageState::DuplicateCheck
            };
            self.transition(record, next, tracker);
        }

        if !self.config.duplicates.enabled {
            return;
        }

        let groups = {
            let candidates: Vec<Candidate<'_>> = arena
                .iter()
                .filter(|r| matches!(r.state, ImageState::DuplicateCheck))
                .filter_map(|r| {
                    let metadata = r.metadata.as_ref();
                    Some(Candidate {
                        id: r.id.0,
                        path: &r.source,
                        embedding: r.embedding.as_deref()?,
                        captured_at: metadata.and_then(|m| m.captured_at),
                        resolution: metadata.and_then(|m| m.resolution()),
                        size_bytes: metadata.map_or(0, |m| m.size_bytes),
                    })
                })
                .collect();
            self.detector.find_groups(&candidates)
        };

        for (index, group) in groups.iter().enumerate() {
            for &member in &group.members {
                if let Some(record) = arena.get_mut(ImageId(member)) {
                    record.duplicate = Some(DuplicateMark {
                        group: index + 1,
                        representative: ImageId(group.representative),
                    });
                }
            }
        }

        tracing::info!(groups = groups.len(), "Duplicate check finished");
    }

    /// Choose destinations sequentially in source path order, so the same
    /// inputs always produce the same plan.
    fn plan_filing(
        &self,
        arena: &mut RecordArena,
        tracker: &ProgressTracker,
        guard: &FailureGuard,
    ) -> Result<(), BatchError> {
        tracker.begin_stage(Stage::Filing);
        let output = &self.config.output;

        for index in 0..arena.len() {
            let id = ImageId(index);
            let representative = arena
                .get(id)
                .and_then(|r| r.duplicate.as_ref())
                .and_then(|mark| arena.get(mark.representative))
                .map(|r| r.source.clone());
            let Some(record) = arena.get_mut(id) else {
                continue;
            };
            if !matches!(record.state, ImageState::DuplicateCheck) {
                continue;
            }
            if let Some(reason) = self.stop_reason(guard) {
                self.transition(record, ImageState::Skipped(reason.to_string()), tracker);
                continue;
            }

            let category = record
                .classification
                .as_ref()
                .and_then(|c| c.primary())
                .unwrap_or(output.unclassified_bucket.as_str())
                .to_string();
            let bucket = if record.is_redundant_duplicate() {
                match self.config.duplicates.action {
                    DuplicateAction::FileAll => category,
                    DuplicateAction::Relocate => output.duplicates_bucket.clone(),
                    DuplicateAction::Skip => {
                        let reason = match &representative {
                            Some(rep) => format!("duplicate of {}", rep.display()),
                            None => "duplicate".to_string(),
                        };
                        self.transition(record, ImageState::Skipped(reason), tracker);
                        continue;
                    }
                }
            } else {
                category
            };

            let captured_at = record.metadata.as_ref().and_then(|m| m.captured_at);
            let stem = match output.naming {
                FileNaming::Original => None,
                FileNaming::Descriptive => {
                    record.name_tags = self.name_tags(record);
                    Some(descriptive_stem(captured_at, &record.name_tags))
                }
            };

            let hash = record.content_hash.clone().unwrap_or_default();
            let planned = self.router.plan(&FilingRequest {
                source: &record.source,
                stem: stem.as_deref(),
                payload: record.payload(),
                content_hash: &hash,
                bucket: &bucket,
                captured_at,
                kind: record.payload_kind,
            });

            match planned {
                Ok(plan) => {
                    guard.success();
                    record.plan = Some(plan);
                    self.transition(record, ImageState::Filing, tracker);
                }
                Err(e) => {
                    guard.failure(&e);
                    self.transition(record, ImageState::Failed(e), tracker);
                }
            }
        }

        guard.check()
    }

    /// Colour tags first, then categories by rank, without repeats.
    fn name_tags(&self, record: &ImageRecord) -> Vec<String> {
        let ranked = record
            .classification
            .iter()
            .flat_map(|c| c.ranked.iter().map(|(name, _)| name));

        let mut tags: Vec<String> = Vec::new();
        for tag in record.color_tags.iter().chain(ranked) {
            if tags.len() == self.config.output.name_tags {
                break;
            }
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        tags
    }

    fn execute_filing(
        &self,
        arena: &mut RecordArena,
        pool: &rayon::ThreadPool,
        tracker: &ProgressTracker,
        guard: &FailureGuard,
    ) -> Result<(), BatchError> {
        let total = arena
            .iter()
            .filter(|r| matches!(r.state, ImageState::Filing))
            .count();

        pool.install(|| {
            arena
                .records_mut()
                .par_iter_mut()
                .filter(|r| matches!(r.state, ImageState::Filing))
                .for_each(|record| {
                    self.file_one(record, tracker, guard);
                    tracker.step(Stage::Filing, total);
                });
        });

        guard.check()
    }

    fn file_one(&self, record: &mut ImageRecord, tracker: &ProgressTracker, guard: &FailureGuard) {
        if let Some(reason) = self.stop_reason(guard) {
            self.transition(record, ImageState::Skipped(reason.to_string()), tracker);
            return;
        }
        let Some(plan) = record.plan.as_ref() else {
            return;
        };

        match self.router.execute(plan) {
            Ok(outcome) => {
                guard.success();
                record.destination = Some(outcome.destination);
                record.action = Some(outcome.action);
                for warning in outcome.warnings {
                    record.warn(warning);
                }
                self.transition(record, ImageState::Done, tracker);
            }
            Err(e) => {
                guard.failure(&e);
                self.transition(record, ImageState::Failed(e), tracker);
            }
        }
    }

    /// Move a record to `state`, keeping counts current and announcing
    /// terminal states.
    fn transition(&self, record: &mut ImageRecord, state: ImageState, tracker: &ProgressTracker) {
        let from = record.state.kind();
        let to = state.kind();
        record.state = state;
        tracker.transfer(from, to);

        if !to.is_terminal() {
            return;
        }
        match &record.state {
            ImageState::Failed(e) => {
                tracing::warn!(path = ?record.source, kind = e.kind(), error = %e, "Image failed");
            }
            ImageState::Skipped(reason) => {
                tracing::debug!(path = ?record.source, reason = %reason, "Image skipped");
            }
            _ => {
                tracing::debug!(path = ?record.source, destination = ?record.destination, "Image filed");
            }
        }
        tracker.send(BatchEvent::ImageFinished {
            id: record.id,
            path: record.source.clone(),
            state: to,
            destination: record.destination.clone(),
            detail: record.state.detail(),
        });
    }

    fn stop_reason(&self, guard: &FailureGuard) -> Option<&'static str> {
        if self.cancel.is_cancelled() {
            Some(CANCELLED)
        } else if guard.tripped() {
            Some(ABORTED)
        } else {
            None
        }
    }

    fn time_budget(&self) -> Option<Duration> {
        self.config
            .batch
            .time_budget_secs
            .map(Duration::from_secs_f64)
    }

    fn summarize(
        &self,
        arena: &RecordArena,
        rejected: Vec<(PathBuf, String)>,
        cancelled: bool,
    ) -> BatchSummary {
        let mut summary = BatchSummary {
            total: arena.len(),
            cancelled,
            dry_run: self.router.is_dry_run(),
            rejected,
            ..BatchSummary::default()
        };

        for record in arena.iter() {
            if record.normalized.is_some() {
                summary.converted += 1;
            }
            if record.is_redundant_duplicate() {
                summary.duplicates += 1;
            }
            if record.embedding.is_some() {
                if record.from_cache {
                    summary.cache_hits += 1;
                } else {
                    summary.embeddings_computed += 1;
                }
            }
            summary.warnings += record.warnings.len();

            match &record.state {
                ImageState::Done => {
                    summary.filed += 1;
                    let unclassified = record
                        .classification
                        .as_ref()
                        .map_or(true, |c| c.is_unclassified());
                    if unclassified && !record.is_redundant_duplicate() {
                        summary.unclassified += 1;
                    }
                    if let Some(destination) = &record.destination {
                        let folder = destination
                            .strip_prefix(self.router.root())
                            .ok()
                            .and_then(|rel| rel.components().next())
                            .map(|c| c.as_os_str().to_string_lossy().to_string())
                            .unwrap_or_default();
                        *summary.per_category.entry(folder).or_insert(0) += 1;
                        summary.plan.push((record.source.clone(), destination.clone()));
                    }
                }
                ImageState::Failed(e) => {
                    summary.failed += 1;
                    summary
                        .failures
                        .push((record.source.clone(), format!("{}: {}", e.kind(), e)));
                }
                ImageState::Skipped(_) => summary.skipped += 1,
                _ => {}
            }
        }

        summary
    }

    fn write_log(&self, arena: &RecordArena) -> Option<PathBuf> {
        let path = if self.router.is_dry_run() {
            PathBuf::from(report::LOG_FILE_NAME)
        } else {
            self.router.root().join(report::LOG_FILE_NAME)
        };

        match report::write_log(&path, arena.iter()) {
            Ok(rows) => {
                tracing::info!(path = ?path, rows, "Processing log written");
                Some(path)
            }
            Err(e) => {
                tracing::warn!(path = ?path, error = %e, "Could not write processing log");
                None
            }
        }
    }
}

/// Counts consecutive filesystem failures across workers and trips once
/// the configured limit is reached. A limit of 0 disables it.
struct FailureGuard {
    limit: usize,
    consecutive: AtomicUsize,
    tripped: AtomicBool,
    last: Mutex<Option<String>>,
}

impl FailureGuard {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            consecutive: AtomicUsize::new(0),
            tripped: AtomicBool::new(false),
            last: Mutex::new(None),
        }
    }

    fn success(&self) {
        if !self.tripped() {
            self.consecutive.store(0, Ordering::SeqCst);
        }
    }

    fn failure(&self, error: &FilerError) {
        if !matches!(error, FilerError::Filesystem { .. }) {
            return;
        }
        if let Ok(mut last) = self.last.lock() {
            *last = Some(error.to_string());
        }
        let count = self.consecutive.fetch_add(1, Ordering::SeqCst) + 1;
        if self.limit > 0 && count >= self.limit {
            self.tripped.store(true, Ordering::SeqCst);
        }
    }

    fn tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), BatchError> {
        if !self.tripped() {
            return Ok(());
        }
        let last = self
            .last
            .lock()
            .ok()
            .and_then(|l| l.clone())
            .unwrap_or_default();
        tracing::error!(count = self.limit, last = %last, "Aborting batch");
        Err(BatchError::SystemicFilesystem {
            count: self.limit,
            last,
        })
    }
}
