//! Progress reporting, cancellation and the batch summary.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use super::record::{ImageId, StateKind};

/// Cooperative cancellation shared between the caller and the workers.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Discovery,
    Embedding,
    Classification,
    DuplicateCheck,
    Filing,
    Report,
}

impl Stage {
    pub fn display_name(&self) -> &'static str {
        match self {
            Stage::Discovery => "Discovery",
            Stage::Embedding => "Embedding",
            Stage::Classification => "Classification",
            Stage::DuplicateCheck => "Duplicate check",
            Stage::Filing => "Filing",
            Stage::Report => "Report",
        }
    }
}

/// Number of images in each state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateCounts([usize; StateKind::ALL.len()]);

impl StateCounts {
    pub fn get(&self, kind: StateKind) -> usize {
        self.0[kind as usize]
    }

    pub fn add(&mut self, kind: StateKind) {
        self.0[kind as usize] += 1;
    }

    pub fn transfer(&mut self, from: StateKind, to: StateKind) {
        self.0[from as usize] = self.0[from as usize].saturating_sub(1);
        self.0[to as usize] += 1;
    }

    pub fn total(&self) -> usize {
        self.0.iter().sum()
    }

    /// Images that reached done, failed or skipped.
    pub fn finished(&self) -> usize {
        StateKind::ALL
            .iter()
            .filter(|k| k.is_terminal())
            .map(|&k| self.get(k))
            .sum()
    }

    /// Non-zero counts as `(state, count)`.
    pub fn non_zero(&self) -> Vec<(StateKind, usize)> {
        StateKind::ALL
            .iter()
            .map(|&k| (k, self.get(k)))
            .filter(|(_, n)| *n > 0)
            .collect()
    }
}

/// Updates sent to the presentation layer while a batch runs.
#[derive(Debug, Clone)]
pub enum BatchEvent {
    /// Discovery finished with this many images.
    Started { total: usize },
    /// A stage boundary, with the counts at that point.
    StageStarted { stage: Stage, counts: StateCounts },
    /// Aggregate progress within a stage.
    Progress {
        stage: Stage,
        processed: usize,
        total: usize,
        counts: StateCounts,
    },
    /// An image reached done, failed or skipped.
    ImageFinished {
        id: ImageId,
        path: PathBuf,
        state: StateKind,
        destination: Option<PathBuf>,
        detail: Option<String>,
    },
    Cancelled,
    Completed { message: String },
}

/// Shared between workers of a stage: keeps counts current and decides
/// when to emit aggregate progress.
pub(crate) struct ProgressTracker {
    counts: Mutex<StateCounts>,
    processed: AtomicUsize,
    every: usize,
    sender: Option<Sender<BatchEvent>>,
}

impl ProgressTracker {
    pub(crate) fn new(every: usize, sender: Option<Sender<BatchEvent>>) -> Self {
        Self {
            counts: Mutex::new(StateCounts::default()),
            processed: AtomicUsize::new(0),
            every: every.max(1),
            sender,
        }
    }

    pub(crate) fn send(&self, event: BatchEvent) {
        if let Some(tx) = &self.sender {
            // A dropped receiver only means nobody is watching.
            let _ = tx.send(event);
        }
    }

    pub(crate) fn discovered(&self, n: usize) {
        if let Ok(mut counts) = self.counts.lock() {
            for _ in 0..n {
                counts.add(StateKind::Discovered);
            }
        }
    }

    pub(crate) fn transfer(&self, from: StateKind, to: StateKind) {
        if from == to {
            return;
        }
        if let Ok(mut counts) = self.counts.lock() {
            counts.transfer(from, to);
        }
    }

    pub(crate) fn snapshot(&self) -> StateCounts {
        self.counts.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub(crate) fn begin_stage(&self, stage: Stage) {
        self.processed.store(0, Ordering::SeqCst);
        tracing::info!(stage = stage.display_name(), "Stage started");
        self.send(BatchEvent::StageStarted {
            stage,
            counts: self.snapshot(),
        });
    }

    /// Count one image as handled by `stage`; emits progress every
    /// `every` images and on the last one.
    pub(crate) fn step(&self, stage: Stage, total: usize) {
        let processed = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        if processed % self.every == 0 || processed == total {
            self.send(BatchEvent::Progress {
                stage,
                processed,
                total,
                counts: self.snapshot(),
            });
        }
    }
}

/// Result of a batch, returned to the caller.
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub total: usize,
    pub filed: usize,
    pub unclassified: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub skipped: usize,
    pub converted: usize,
    pub cache_hits: usize,
    pub embeddings_computed: usize,
    pub cancelled: bool,
    pub dry_run: bool,
    /// Filed images per destination folder.
    pub per_category: BTreeMap<String, usize>,
    /// `(source, destination)` for every filed image, in source path order.
    pub plan: Vec<(PathBuf, PathBuf)>,
    /// `(source, error)` for failed images.
    pub failures: Vec<(PathBuf, String)>,
    /// Sources given explicitly that could not be processed.
    pub rejected: Vec<(PathBuf, String)>,
    pub warnings: usize,
    pub log_path: Option<PathBuf>,
}
