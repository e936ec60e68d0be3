use anyhow::{Context, Result};
use clap::Parser;
use photofiler::{
    anchors,
    clip::{ClipModel, EmbeddingProvider},
    config::{Config, FileNaming, FileOperation, FolderLayout, MatchPolicy, TargetFormat},
    logging,
    pipeline::{BatchEvent, BatchSummary, CancelFlag, Pipeline, StateKind},
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{mpsc, Arc};

#[derive(Parser)]
#[command(name = "photofiler")]
#[command(about = "Sort photos into category folders by what they show")]
#[command(version)]
#[command(after_help = "ENVIRONMENT:\n    PHOTOFILER_CONFIG   Path to config file (overrides default location)\n    PHOTOFILER_LOG      Log level (debug, info, warn, error)")]
struct Cli {
    /// Folders or individual photos to file
    #[arg(value_name = "SOURCE", required = true)]
    sources: Vec<PathBuf>,

    /// Path to config file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Output root (overrides config)
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Directory with the CLIP model files (overrides config)
    #[arg(long, value_name = "DIR")]
    model_dir: Option<PathBuf>,

    /// Category to file into; repeat for several. Replaces configured anchors.
    #[arg(short, long = "tag", value_name = "TAG")]
    tags: Vec<String>,

    /// best-match, threshold-margin or multi-label
    #[arg(long)]
    policy: Option<MatchPolicy>,

    /// auto, jpg or png
    #[arg(long)]
    target_format: Option<TargetFormat>,

    /// original (keep file names) or descriptive (date and tags)
    #[arg(long)]
    naming: Option<FileNaming>,

    /// Move photos instead of copying them
    #[arg(long = "move")]
    move_files: bool,

    /// Group each category by capture date
    #[arg(long)]
    by_date: bool,

    /// Plan and report without touching the output folder
    #[arg(long)]
    dry_run: bool,

    /// Do not write photofiler_log.csv
    #[arg(long)]
    no_log: bool,

    /// Do not read or write the embedding cache
    #[arg(long)]
    no_cache: bool,

    /// Worker threads (0 = one per CPU)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Mirror logs to stderr
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        let path = self
            .config
            .clone()
            .or_else(|| std::env::var_os("PHOTOFILER_CONFIG").map(PathBuf::from));

        let mut config = match path {
            Some(path) => Config::load_from(&path)?,
            None => Config::load()?,
        };

        if let Some(output) = &self.output {
            config.output.root = output.clone();
        }
        if let Some(dir) = &self.model_dir {
            config.model.dir = dir.clone();
        }
        if !self.tags.is_empty() {
            config.anchors = anchors::definitions_from_tags(&self.tags[..]);
        }
        if let Some(policy) = self.policy {
            config.matching.policy = policy;
        }
        if let Some(format) = self.target_format {
            config.output.target_format = format;
        }
        if let Some(naming) = self.naming {
            config.output.naming = naming;
        }
        if self.move_files {
            config.output.operation = FileOperation::Move;
        }
        if self.by_date {
            config.output.layout = FolderLayout::CategoryDate;
        }
        if self.dry_run {
            config.output.dry_run = true;
        }
        if self.no_log {
            config.output.write_log = false;
        }
        if self.no_cache {
            config.cache.enabled = false;
        }
        if let Some(workers) = self.workers {
            config.batch.workers = workers;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging (uses journald on Linux, file fallback otherwise)
    let _ = logging::init(Some(Config::config_dir().join("logs")), cli.verbose);

    let config = cli.load_config()?;
    tracing::info!(
        sources = cli.sources.len(),
        output = ?config.output.root,
        dry_run = config.output.dry_run,
        "photofiler starting"
    );

    let model = ClipModel::load(&config.model.dir, config.model.intra_threads)
        .with_context(|| format!("Cannot load CLIP model from {}", config.model.dir.display()))?;
    let provider: Arc<dyn EmbeddingProvider> = Arc::new(model);

    let (tx, rx) = mpsc::channel();
    let cancel = CancelFlag::new();
    let pipeline = Pipeline::new(config, provider)?
        .with_events(tx)
        .with_cancel_flag(cancel.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight images");
            cancel.cancel();
        }
    });

    let printer = tokio::task::spawn_blocking(move || print_events(rx));
    let sources = cli.sources;
    let summary = tokio::task::spawn_blocking(move || pipeline.run(&sources))
        .await
        .context("Batch worker panicked")??;
    let _ = printer.await;

    print_summary(&summary);

    Ok(if summary.cancelled {
        ExitCode::from(130)
    } else if summary.failed > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}

/// Render batch events until the pipeline drops its sender.
fn print_events(rx: mpsc::Receiver<BatchEvent>) {
    for event in rx {
        match event {
            BatchEvent::Started { total } => eprintln!("Found {} photos", total),
            BatchEvent::StageStarted { stage, .. } => eprintln!("{}...", stage.display_name()),
            BatchEvent::Progress {
                stage,
                processed,
                total,
                ..
            } => {
                if processed == total || processed % 50 == 0 {
                    eprintln!("  {}: {}/{}", stage.display_name(), processed, total);
                }
            }
            BatchEvent::ImageFinished {
                path,
                state: StateKind::Failed,
                detail,
                ..
            } => {
                eprintln!(
                    "  failed: {} ({})",
                    path.display(),
                    detail.unwrap_or_default()
                );
            }
            BatchEvent::ImageFinished { .. } => {}
            BatchEvent::Cancelled => eprintln!("Cancelled, skipping remaining photos"),
            BatchEvent::Completed { message } => eprintln!("{}", message),
        }
    }
}

fn print_summary(summary: &BatchSummary) {
    if summary.dry_run {
        println!("Dry run, nothing was written:");
        for (source, destination) in &summary.plan {
            println!("  {} -> {}", source.display(), destination.display());
        }
        println!();
    }

    println!("Photos:        {}", summary.total);
    println!("Filed:         {}", summary.filed);
    for (category, count) in &summary.per_category {
        println!("  {:<20} {}", category, count);
    }
    println!("Unclassified:  {}", summary.unclassified);
    println!("Duplicates:    {}", summary.duplicates);
    println!("Converted:     {}", summary.converted);
    println!(
        "Embeddings:    {} computed, {} cached",
        summary.embeddings_computed, summary.cache_hits
    );
    println!("Skipped:       {}", summary.skipped);
    println!("Failed:        {}", summary.failed);
    if summary.warnings > 0 {
        println!("Warnings:      {}", summary.warnings);
    }

    for (path, reason) in &summary.rejected {
        println!("  rejected: {} ({})", path.display(), reason);
    }
    for (path, error) in &summary.failures {
        println!("  failed: {} ({})", path.display(), error);
    }

    if let Some(log) = &summary.log_path {
        println!("Log written to {}", log.display());
    }
}
