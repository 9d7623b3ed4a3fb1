//! Common utilities and types for directory mirroring
//!
//! This crate provides the engine behind the `rmirror` tool: it keeps a destination directory
//! tree up to date with a source tree, either with full-tree syncs (once or on a schedule) or
//! by reacting to filesystem change notifications.
//!
//! # Core Modules
//!
//! - [`filter`] - substring allow-list deciding which files take part in mirroring
//! - [`staleness`] - modification-time comparison deciding whether a file must be copied
//! - [`transfer`] - whole-file copy with progress, fsync and permission preservation
//! - [`sync`] - depth-first full-tree sync with a bounded number of concurrent transfers
//! - [`watch`] - change-notification driven mirroring
//! - [`schedule`] - selects between a single sync, scheduled syncs and watching
//! - [`progress`] - run-wide counters and per-file progress sinks
//! - [`preserve`] - mode bits carried from source to destination
//!
//! # Concurrency
//!
//! Full-tree syncs bound concurrent transfers through the `throttle` crate's
//! `TransferLimiter`; one task walks the tree and every admitted transfer runs on its own tokio
//! task. Transfers started from change notifications are not bounded.
//!
//! # Error Handling
//!
//! Sync operations return [`sync::Error`], which carries a [`Summary`] of the work done before
//! the failure. Problems found before any transfer starts are reported as [`SetupError`].
//! Failed copies of single files are logged and counted without stopping the run.
//!
//! # Entry Point
//!
//! [`run`] sets up logging and the tokio runtime, executes an async function with the run-wide
//! progress counters and sink, and prints the outcome.

pub mod config;
pub mod filter;
pub mod preserve;
pub mod progress;
pub mod schedule;
pub mod staleness;
pub mod sync;
pub mod transfer;
pub mod watch;

#[cfg(test)]
mod testutils;

pub use config::{
    MirrorConfig, OutputConfig, RunMode, RuntimeConfig, SetupError, SyncTarget, parse_interval,
};
pub use filter::InclusionRule;
pub use progress::{ProgressSettings, ProgressType};
pub use sync::{Summary, SyncContext};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn init_tracing(output: &OutputConfig) {
    let level = if output.quiet {
        "off"
    } else {
        match output.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    if let Err(error) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
    {
        eprintln!("Failed to initialize logging: {error}");
    }
}

fn build_runtime(runtime: &RuntimeConfig) -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    builder.build()
}

/// Print run-wide status to stderr every `delay` until `token` is cancelled.
async fn print_text_updates(
    progress: Arc<progress::Progress>,
    delay: std::time::Duration,
    token: CancellationToken,
) {
    let mut printer = progress::ProgressPrinter::new(&progress);
    let mut ticker = tokio::time::interval(delay);
    // the first tick completes right away
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => eprintln!("{}", printer.print()),
        }
    }
}

/// Run `func` on a freshly built runtime and report its outcome.
///
/// `func` receives the run-wide progress counters and the per-file progress sink selected by
/// `progress_settings`. Returns the summary on success; on failure the error is printed (unless
/// `quiet`) and `None` is returned so the caller can exit with a non-zero status.
pub fn run<Fut, F>(
    progress_settings: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: F,
) -> Option<Summary>
where
    F: FnOnce(Arc<progress::Progress>, Arc<dyn progress::ProgressSink>) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
{
    init_tracing(&output);
    let runtime = match build_runtime(&runtime) {
        Ok(runtime) => runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("Failed to start the tokio runtime: {error}");
            }
            return None;
        }
    };
    let res = runtime.block_on(async move {
        let progress = Arc::new(progress::Progress::new());
        let sink = progress::make_sink(progress_settings.as_ref())?;
        let printer_token = CancellationToken::new();
        let printer = match &progress_settings {
            Some(settings) if settings.progress_type.resolve() == ProgressType::TextUpdates => {
                Some(tokio::spawn(print_text_updates(
                    progress.clone(),
                    settings.delay()?,
                    printer_token.clone(),
                )))
            }
            _ => None,
        };
        let res = func(progress.clone(), sink).await;
        printer_token.cancel();
        if let Some(printer) = printer
            && let Err(error) = printer.await
        {
            tracing::warn!("progress printer failed: {}", &error);
        }
        tracing::debug!("finished after {:?}", progress.get_duration());
        res
    });
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{}", &summary);
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{:#}", &error);
            }
            None
        }
    }
}
