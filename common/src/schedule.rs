use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::RunMode;
use crate::sync::{self, Summary, SyncContext};
use crate::watch;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Run the mirror in the configured mode until it finishes or `token` is cancelled.
///
/// A single sync reports walk and copy failures as an error. Scheduled and watch runs only stop
/// on cancellation and log failures as they happen.
#[instrument(skip(ctx, token), fields(mode = %ctx.config.mode))]
pub async fn run(ctx: SyncContext, token: CancellationToken) -> anyhow::Result<Summary> {
    match ctx.config.mode {
        RunMode::Once => run_once(&ctx).await,
        RunMode::Scheduled(period) => Ok(run_scheduled(ctx, period, token).await),
        RunMode::Watch => {
            let watcher = watch::Watcher::new(ctx).await?;
            watcher.run(token).await
        }
    }
}

async fn run_once(ctx: &SyncContext) -> anyhow::Result<Summary> {
    match sync::sync(ctx).await {
        Ok(summary) if summary.files_failed == 0 => Ok(summary),
        Ok(summary) => Err(anyhow::anyhow!(
            "{} file(s) failed to copy\n\n{}",
            summary.files_failed,
            &summary
        )),
        Err(error) => Err(anyhow::anyhow!("{}\n\n{}", &error, &error.summary)),
    }
}

async fn scheduled_sync(ctx: SyncContext) -> Summary {
    tracing::info!("Starting scheduled sync at {}", timestamp());
    match sync::sync(&ctx).await {
        Ok(summary) => {
            tracing::info!("Scheduled sync completed at {}", timestamp());
            summary
        }
        Err(error) => {
            tracing::error!("Error during scheduled sync: {:#}", &error);
            error.summary
        }
    }
}

/// Sync now and then once every `period`. A tick never waits for or aborts the previous sync,
/// so runs may overlap when one takes longer than the period.
pub async fn run_scheduled(
    ctx: SyncContext,
    period: std::time::Duration,
    token: CancellationToken,
) -> Summary {
    tracing::info!("scheduling a sync every {}", humantime::format_duration(period));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut runs = tokio::task::JoinSet::new();
    let mut summary = Summary::default();
    let mut reap = |res: Result<Summary, tokio::task::JoinError>| match res {
        Ok(run_summary) => summary += run_summary,
        Err(join_error) => tracing::error!("scheduled sync task failed: {}", &join_error),
    };
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                tracing::info!("schedule cancelled, waiting for {} running sync(s)", runs.len());
                break;
            }
            _ = ticker.tick() => {
                runs.spawn(scheduled_sync(ctx.clone()));
            }
            Some(res) = runs.join_next(), if !runs.is_empty() => reap(res),
        }
    }
    while let Some(res) = runs.join_next().await {
        reap(res);
    }
    summary
}
