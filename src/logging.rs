//! Logging configuration with journald support on Linux.
//!
//! Batch runs log through `tracing`. On Linux the journal is preferred; on
//! other platforms, or when journald is unavailable, logs go to a daily
//! rolling file. Interactive runs can mirror everything to stderr.

use anyhow::Result;
use std::path::PathBuf;
use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the logging system.
///
/// Log level is controlled via the `PHOTOFILER_LOG` environment variable
/// (`debug`, `info`, `warn`, `error`); the default is `info`.
///
/// With `stderr` set, a human-readable layer writing to stderr is added on
/// top of the journald or file backend.
pub fn init(log_dir: Option<PathBuf>, stderr: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_env("PHOTOFILER_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(journald_layer)
                .with(stderr_layer(stderr))
                .try_init()?;

            tracing::debug!("Logging initialized with journald backend");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("photofiler")
            .join("logs")
    });

    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "photofiler.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // The writer stops flushing once the guard drops; keep it for the process lifetime.
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(stderr_layer(stderr))
        .try_init()?;

    tracing::debug!(dir = ?log_dir, "Logging initialized with file backend");
    Ok(())
}

fn stderr_layer<S>(enabled: bool) -> Option<Box<dyn Layer<S> + Send + Sync>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    enabled.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed()
    })
}
