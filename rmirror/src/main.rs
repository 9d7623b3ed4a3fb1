use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rmirror",
    version,
    about = "Mirror a directory tree - continuously or on a schedule",
    long_about = "`rmirror` keeps a destination directory up to date with a source directory.

Without an interval it watches the source for changes and copies every created or written file
as soon as the change is reported. With an interval it walks the whole source tree right away
and then once per interval, copying files that are newer than their mirrored copy.

Files removed from the source are never removed from the destination.

EXAMPLES:
    # Watch a directory and mirror changes as they happen
    rmirror -s /data -d /mnt/backup/data

    # Full sync every 30 minutes, at most 4 files at a time
    rmirror -s /data -d /mnt/backup/data -i 30m -m 4

    # Mirror only reports and the photos folder, once
    rmirror -s /data -d /mnt/backup/data -e report,photos --once"
)]
struct Args {
    // Mirror options
    /// Directory to mirror
    #[arg(short = 's', long, value_name = "DIR", help_heading = "Mirror options")]
    source: std::path::PathBuf,

    /// Directory receiving the mirror, created if missing
    #[arg(short = 'd', long, value_name = "DIR", help_heading = "Mirror options")]
    destination: std::path::PathBuf,

    /// Run a full sync now and then every INTERVAL
    ///
    /// Accepts a human readable duration, e.g. "30m", "1h", "1day". When missing or 0, the
    /// source is watched for changes instead.
    #[arg(short = 'i', long, value_name = "INTERVAL", value_parser = common::parse_interval, help_heading = "Mirror options")]
    interval: Option<std::time::Duration>,

    /// Run a single full sync and exit
    ///
    /// Exits with an error when any file failed to copy.
    #[arg(long, help_heading = "Mirror options")]
    once: bool,

    /// Maximum number of files copied at the same time during full syncs
    ///
    /// Files copied in response to change notifications are not limited.
    #[arg(
        short = 'm',
        long,
        default_value = "1",
        value_name = "N",
        help_heading = "Mirror options"
    )]
    max_transfers: std::num::NonZeroUsize,

    // Filtering options
    /// Only mirror files whose name or containing folder contains PATTERN
    ///
    /// Patterns are plain case-sensitive substrings (no wildcards). Separate several patterns
    /// with commas or repeat the flag. When patterns name folders directly under the source,
    /// watch mode only watches those folders.
    #[arg(short = 'e', long, value_name = "PATTERN", value_delimiter = ',', action = clap::ArgAction::Append, help_heading = "Filtering")]
    include: Vec<String>,

    /// Read include patterns from file, one per line
    ///
    /// Empty lines and lines starting with '#' are ignored.
    #[arg(long, value_name = "PATH", conflicts_with = "include", help_heading = "Filtering")]
    include_file: Option<std::path::PathBuf>,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Toggles the type of progress to show
    ///
    /// If specified, --progress flag is implied.
    ///
    /// Options are: `ProgressBar` (animated per-file progress bars), `TextUpdates` (periodic
    /// status appropriate for logging), Auto (default, will choose between `ProgressBar` or
    /// `TextUpdates` depending on the type of terminal attached to stderr)
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<common::ProgressType>,

    /// Sets the delay between progress updates
    ///
    /// - For the interactive (--progress-type=ProgressBar), the default is 200ms.
    /// - For the non-interactive (--progress-type=TextUpdates), the default is 10s.
    ///
    /// If specified, --progress flag is implied.
    ///
    /// This option accepts a human readable duration, e.g. "200ms", "10s", "5min" etc.
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,
}

impl Args {
    fn include_rule(&self) -> Result<common::InclusionRule> {
        if let Some(ref path) = self.include_file {
            return common::InclusionRule::from_file(path);
        }
        Ok(common::InclusionRule::new(self.include.iter().cloned()))
    }
}

/// First Ctrl-C cancels `token` and lets running transfers finish, a second one exits right away.
async fn cancel_on_ctrl_c(token: CancellationToken) {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("cannot listen for Ctrl-C: {}", &error);
        return;
    }
    tracing::info!("interrupted, waiting for running transfers (Ctrl-C again to exit now)");
    token.cancel();
    if tokio::signal::ctrl_c().await.is_ok() {
        eprintln!("interrupted again, exiting without waiting for running transfers");
        std::process::exit(130);
    }
}

#[instrument(skip(progress, sink))]
async fn async_main(
    args: Args,
    progress: Arc<common::progress::Progress>,
    sink: Arc<dyn common::progress::ProgressSink>,
) -> Result<common::Summary> {
    let mode = common::RunMode::from_interval(args.interval, args.once);
    let config = common::MirrorConfig::new(
        common::SyncTarget::new(&args.source, &args.destination),
        mode,
    )
    .with_include(args.include_rule()?)
    .with_max_transfers(args.max_transfers)
    .prepare()
    .await?;
    tracing::info!(
        "mirroring {:?} -> {:?} ({})",
        &config.target.source_root,
        &config.target.dest_root,
        mode
    );
    let token = CancellationToken::new();
    // a single sync keeps the default SIGINT behavior
    let interrupt = mode
        .is_continuous()
        .then(|| tokio::spawn(cancel_on_ctrl_c(token.clone())));
    let ctx = common::SyncContext::new(config, progress, sink);
    let res = common::schedule::run(ctx, token).await;
    if let Some(interrupt) = interrupt {
        interrupt.abort();
    }
    res
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        |progress, sink| async_main(args, progress, sink)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = common::run(
        if args.progress || args.progress_type.is_some() || args.progress_delay.is_some() {
            Some(common::ProgressSettings {
                progress_type: args.progress_type.unwrap_or_default(),
                progress_delay: args.progress_delay,
            })
        } else {
            None
        },
        output,
        runtime,
        func,
    );
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
