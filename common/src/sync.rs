use anyhow::Context;
use async_recursion::async_recursion;
use std::sync::Arc;
use tracing::instrument;

use crate::config::MirrorConfig;
use crate::filter::{FilterResult, FilterScope};
use crate::preserve;
use crate::progress;
use crate::staleness;
use crate::transfer::{self, TransferTask};

pub use crate::transfer::{Error, Summary};

/// Shared state handed to every sync, scheduled tick and watcher
#[derive(Clone, Debug)]
pub struct SyncContext {
    pub config: Arc<MirrorConfig>,
    pub progress: Arc<progress::Progress>,
    pub sink: Arc<dyn progress::ProgressSink>,
}

impl SyncContext {
    pub fn new(
        config: MirrorConfig,
        progress: Arc<progress::Progress>,
        sink: Arc<dyn progress::ProgressSink>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            progress,
            sink,
        }
    }
}

type Transfers = tokio::task::JoinSet<Result<Summary, Error>>;

/// Mirror the whole source tree once.
///
/// Transfers are bounded by the configured `max_transfers`. Every dispatched transfer is joined
/// before returning, also when the walk itself fails.
pub async fn sync(ctx: &SyncContext) -> Result<Summary, Error> {
    let limiter = throttle::TransferLimiter::new(ctx.config.max_transfers);
    sync_with_limiter(ctx, &limiter).await
}

#[instrument(skip(ctx, limiter), fields(source = ?ctx.config.target.source_root))]
pub async fn sync_with_limiter(
    ctx: &SyncContext,
    limiter: &throttle::TransferLimiter,
) -> Result<Summary, Error> {
    let target = &ctx.config.target;
    tracing::info!(
        "syncing {:?} -> {:?} (include: {}, max transfers: {:?})",
        &target.source_root,
        &target.dest_root,
        &ctx.config.include,
        limiter.max_transfers()
    );
    let mut transfers = Transfers::new();
    let walked = walk(
        ctx,
        limiter,
        &target.source_root,
        &target.dest_root,
        &mut transfers,
    )
    .await;
    let mut summary = match &walked {
        Ok(summary) => *summary,
        Err(error) => error.summary,
    };
    while let Some(res) = transfers.join_next().await {
        match res {
            Ok(Ok(transferred)) => summary += transferred,
            Ok(Err(error)) => {
                tracing::error!("{:#}", &error);
                summary += error.summary;
            }
            Err(join_error) => {
                tracing::error!("transfer task failed: {}", &join_error);
                ctx.progress.files_failed.inc();
                summary.files_failed += 1;
            }
        }
    }
    tracing::debug!("peak in-flight transfers: {}", limiter.peak_in_flight());
    match walked {
        Ok(_) => Ok(summary),
        Err(error) => Err(Error::new(error.source, summary)),
    }
}

/// Create `dst` with the mode of `src_metadata` unless the directory already exists.
async fn ensure_dir(
    prog_track: &progress::Progress,
    src_metadata: &std::fs::Metadata,
    dst: &std::path::Path,
) -> anyhow::Result<Summary> {
    match tokio::fs::metadata(dst).await {
        Ok(dst_metadata) if dst_metadata.is_dir() => {
            tracing::debug!("directory {:?} already exists", dst);
            prog_track.directories_unchanged.inc();
            Ok(Summary {
                directories_unchanged: 1,
                ..Default::default()
            })
        }
        Ok(_) => Err(anyhow::anyhow!(
            "cannot mirror directory into {:?}: path exists and is not a directory",
            dst
        )),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::DirBuilder::new()
                .recursive(true)
                .create(dst)
                .await
                .with_context(|| format!("cannot create directory {:?}", dst))?;
            preserve::set_dir_permissions(src_metadata, dst).await?;
            prog_track.directories_created.inc();
            Ok(Summary {
                directories_created: 1,
                ..Default::default()
            })
        }
        Err(error) => {
            Err(error).with_context(|| format!("failed reading metadata from {:?}", dst))
        }
    }
}

#[instrument(skip(ctx, limiter, transfers))]
#[async_recursion]
async fn walk(
    ctx: &SyncContext,
    limiter: &throttle::TransferLimiter,
    src: &std::path::Path,
    dst: &std::path::Path,
    transfers: &mut Transfers,
) -> Result<Summary, Error> {
    let config = &ctx.config;
    let prog_track = &ctx.progress;
    let mut summary = Summary::default();
    let src_metadata = tokio::fs::metadata(src)
        .await
        .with_context(|| format!("failed reading metadata from {:?}", src))
        .map_err(|err| Error::new(err, summary))?;
    let dir_summary = ensure_dir(prog_track, &src_metadata, dst)
        .await
        .map_err(|err| Error::new(err, summary))?;
    summary += dir_summary;
    let mut entries = tokio::fs::read_dir(src)
        .await
        .with_context(|| format!("cannot open directory {:?} for reading", src))
        .map_err(|err| Error::new(err, summary))?;
    let mut listing = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", src))
        .map_err(|err| Error::new(err, summary))?
    {
        listing.push(entry);
    }
    listing.sort_by_key(|entry| entry.file_name());
    for entry in listing {
        let entry_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let entry_metadata = tokio::fs::symlink_metadata(&entry_path)
            .await
            .with_context(|| format!("failed reading metadata from {:?}", &entry_path))
            .map_err(|err| Error::new(err, summary))?;
        if entry_metadata.is_dir() {
            match walk(ctx, limiter, &entry_path, &dst_path, transfers).await {
                Ok(nested) => summary += nested,
                Err(error) => return Err(Error::new(error.source, summary + error.summary)),
            }
            continue;
        }
        if !entry_metadata.is_file() {
            tracing::debug!("skipping {:?}: not a regular file", &entry_path);
            continue;
        }
        match config.include.should_include(
            &entry_path,
            &config.target.source_root,
            FilterScope::FileOrDirectory,
        ) {
            FilterResult::ExcludedByDefault => {
                tracing::debug!("skipping {:?}: no include pattern matches", &entry_path);
                prog_track.files_filtered.inc();
                summary.files_filtered += 1;
                continue;
            }
            FilterResult::IncludedByPattern(pattern) => {
                tracing::trace!("{:?} included by {:?}", &entry_path, pattern);
            }
            FilterResult::Included => {}
        }
        if !staleness::needs_copy(&entry_metadata, &dst_path).await {
            tracing::debug!("{:?} is up to date", &dst_path);
            prog_track.files_unchanged.inc();
            summary.files_unchanged += 1;
            continue;
        }
        let permit = limiter.acquire().await;
        let task = TransferTask::new(entry_path, dst_path);
        let progress = ctx.progress.clone();
        let sink = ctx.sink.clone();
        transfers.spawn(async move {
            let _permit = permit;
            transfer::transfer(&progress, sink.as_ref(), &task).await
        });
    }
    Ok(summary)
}

// Every test owns its destination tree: the staleness check and the copy are not one atomic
// step, so a mirror is only correct with a single writer per destination.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RunMode, SyncTarget};
    use crate::filter::InclusionRule;
    use crate::progress::testing::RecordingSink;
    use crate::testutils;
    use filetime::FileTime;
    use std::num::NonZeroUsize;
    use std::os::unix::fs::PermissionsExt;
    use tracing_test::traced_test;

    fn context(
        src: &std::path::Path,
        dst: &std::path::Path,
        include: InclusionRule,
        max_transfers: usize,
    ) -> (SyncContext, RecordingSink) {
        let sink = RecordingSink::default();
        let config = MirrorConfig::new(SyncTarget::new(src, dst), RunMode::Once)
            .with_include(include)
            .with_max_transfers(NonZeroUsize::new(max_transfers).unwrap());
        let ctx = SyncContext::new(
            config,
            Arc::new(progress::Progress::new()),
            Arc::new(sink.clone()),
        );
        (ctx, sink)
    }

    #[tokio::test]
    #[traced_test]
    async fn mirrors_file_and_subdirectory() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        std::fs::create_dir_all(src.join("sub"))?;
        std::fs::write(src.join("a.txt"), "alpha")?;
        std::fs::write(src.join("sub").join("b.jpg"), "jpeg bytes")?;
        std::fs::set_permissions(src.join("sub"), std::fs::Permissions::from_mode(0o750))?;
        let (ctx, sink) = context(&src, &dst, InclusionRule::match_all(), 1);
        let summary = sync(&ctx).await?;
        assert_eq!(summary.files_copied, 2);
        assert_eq!(summary.bytes_copied, 15);
        assert_eq!(summary.directories_created, 2);
        assert_eq!(std::fs::read_to_string(dst.join("a.txt"))?, "alpha");
        assert_eq!(
            std::fs::read_to_string(dst.join("sub").join("b.jpg"))?,
            "jpeg bytes"
        );
        assert_eq!(
            std::fs::metadata(dst.join("sub"))?.permissions().mode() & 0o7777,
            0o750
        );
        assert_eq!(sink.recorded().len(), 2);
        testutils::check_dirs_identical(&src, &dst).await?;
        Ok(())
    }

    #[tokio::test]
    async fn second_run_copies_nothing() -> anyhow::Result<()> {
        let tmp = testutils::setup_test_dir().await?;
        let src = tmp.path().join("foo");
        let dst = tmp.path().join("mirror");
        let (ctx, _) = context(&src, &dst, InclusionRule::match_all(), 2);
        let first = sync(&ctx).await?;
        assert_eq!(first.files_copied, 5);
        let second = sync(&ctx).await?;
        assert_eq!(second.files_copied, 0);
        assert_eq!(second.bytes_copied, 0);
        assert_eq!(second.files_unchanged, 5);
        assert_eq!(second.directories_created, 0);
        assert_eq!(second.directories_unchanged, 3);
        Ok(())
    }

    #[tokio::test]
    async fn modified_file_is_overwritten() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        std::fs::create_dir(&src)?;
        std::fs::write(src.join("notes.txt"), "first")?;
        let (ctx, _) = context(&src, &dst, InclusionRule::match_all(), 1);
        sync(&ctx).await?;
        filetime::set_file_mtime(dst.join("notes.txt"), FileTime::from_unix_time(1_000, 0))?;
        std::fs::write(src.join("notes.txt"), "second, longer")?;
        std::fs::set_permissions(src.join("notes.txt"), std::fs::Permissions::from_mode(0o600))?;
        let summary = sync(&ctx).await?;
        assert_eq!(summary.files_copied, 1);
        assert_eq!(
            std::fs::read_to_string(dst.join("notes.txt"))?,
            "second, longer"
        );
        assert_eq!(
            std::fs::metadata(dst.join("notes.txt"))?.permissions().mode() & 0o7777,
            0o600
        );
        Ok(())
    }

    #[tokio::test]
    async fn deletions_are_not_propagated() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        std::fs::create_dir(&src)?;
        std::fs::write(src.join("keep.txt"), "keep")?;
        std::fs::write(src.join("gone.txt"), "gone")?;
        let (ctx, _) = context(&src, &dst, InclusionRule::match_all(), 1);
        sync(&ctx).await?;
        std::fs::remove_file(src.join("gone.txt"))?;
        sync(&ctx).await?;
        assert_eq!(std::fs::read_to_string(dst.join("gone.txt"))?, "gone");
        assert!(dst.join("keep.txt").exists());
        Ok(())
    }

    #[tokio::test]
    async fn newer_destination_is_left_alone() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        std::fs::create_dir(&src)?;
        std::fs::create_dir(&dst)?;
        std::fs::write(src.join("a.txt"), "source")?;
        std::fs::write(dst.join("a.txt"), "edited in the mirror")?;
        filetime::set_file_mtime(src.join("a.txt"), FileTime::from_unix_time(1_000, 0))?;
        filetime::set_file_mtime(dst.join("a.txt"), FileTime::from_unix_time(2_000, 0))?;
        let (ctx, sink) = context(&src, &dst, InclusionRule::match_all(), 1);
        let summary = sync(&ctx).await?;
        assert_eq!(summary.bytes_copied, 0);
        assert_eq!(summary.files_unchanged, 1);
        assert!(sink.recorded().is_empty());
        assert_eq!(
            std::fs::read_to_string(dst.join("a.txt"))?,
            "edited in the mirror"
        );
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn include_patterns_limit_transfers() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        std::fs::create_dir(&src)?;
        std::fs::write(src.join("report.csv"), "a,b\n1,2\n")?;
        std::fs::write(src.join("image.png"), "png")?;
        let (ctx, sink) = context(&src, &dst, InclusionRule::new(["report"]), 1);
        let summary = sync(&ctx).await?;
        assert_eq!(summary.files_copied, 1);
        assert_eq!(summary.files_filtered, 1);
        assert!(dst.join("report.csv").exists());
        assert!(!dst.join("image.png").exists());
        let names: Vec<_> = sink.recorded().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["report.csv".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn include_pattern_matches_folder() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        std::fs::create_dir_all(src.join("photos").join("2024"))?;
        std::fs::create_dir_all(src.join("music"))?;
        std::fs::write(src.join("photos").join("2024").join("a.jpg"), "a")?;
        std::fs::write(src.join("music").join("b.mp3"), "b")?;
        let (ctx, _) = context(&src, &dst, InclusionRule::new(["photos"]), 1);
        let summary = sync(&ctx).await?;
        assert_eq!(summary.files_copied, 1);
        assert!(dst.join("photos").join("2024").join("a.jpg").exists());
        assert!(!dst.join("music").join("b.mp3").exists());
        // directory structure is mirrored regardless of the filter
        assert!(dst.join("music").is_dir());
        Ok(())
    }

    #[tokio::test]
    async fn symlinks_are_skipped() -> anyhow::Result<()> {
        let tmp = testutils::setup_test_dir().await?;
        let src = tmp.path().join("foo");
        let dst = tmp.path().join("mirror");
        std::os::unix::fs::symlink(src.join("0.txt"), src.join("link.txt"))?;
        let (ctx, _) = context(&src, &dst, InclusionRule::match_all(), 1);
        sync(&ctx).await?;
        assert!(dst.join("0.txt").exists());
        assert!(std::fs::symlink_metadata(dst.join("link.txt")).is_err());
        Ok(())
    }

    async fn check_limit(max_transfers: usize) -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        std::fs::create_dir_all(src.join("nested"))?;
        for i in 0..12 {
            std::fs::write(src.join(format!("{i}.bin")), vec![i as u8; 64 * 1024])?;
            std::fs::write(src.join("nested").join(format!("{i}.bin")), vec![i as u8; 512])?;
        }
        let (ctx, sink) = context(&src, &dst, InclusionRule::match_all(), max_transfers);
        let limiter = throttle::TransferLimiter::new(ctx.config.max_transfers);
        let summary = sync_with_limiter(&ctx, &limiter).await?;
        assert_eq!(summary.files_copied, 24);
        assert!(limiter.peak_in_flight() <= max_transfers);
        assert!(sink.peak_active() <= max_transfers);
        assert_eq!(limiter.in_flight(), 0);
        testutils::check_dirs_identical(&src, &dst).await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_transfer_at_a_time() -> anyhow::Result<()> {
        check_limit(1).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn two_transfers_at_a_time() -> anyhow::Result<()> {
        check_limit(2).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn limit_above_file_count() -> anyhow::Result<()> {
        check_limit(100).await
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_copy_does_not_stop_siblings() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        std::fs::create_dir_all(&dst)?;
        std::fs::create_dir(&src)?;
        std::fs::write(src.join("a.txt"), "a")?;
        std::fs::write(src.join("b.txt"), "b")?;
        std::fs::write(src.join("c.txt"), "c")?;
        // a directory at the destination path makes the file copy fail
        std::fs::create_dir(dst.join("b.txt"))?;
        filetime::set_file_mtime(dst.join("b.txt"), FileTime::from_unix_time(1_000, 0))?;
        let (ctx, _) = context(&src, &dst, InclusionRule::match_all(), 1);
        let summary = sync(&ctx).await?;
        assert_eq!(summary.files_copied, 2);
        assert_eq!(summary.files_failed, 1);
        assert!(dst.join("a.txt").is_file());
        assert!(dst.join("c.txt").is_file());
        assert!(logs_contain("b.txt"));
        Ok(())
    }

    #[tokio::test]
    async fn walk_error_waits_for_dispatched_transfers() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        std::fs::create_dir_all(src.join("b_dir"))?;
        std::fs::write(src.join("a.txt"), "a")?;
        std::fs::create_dir_all(&dst)?;
        // a file where the mirrored directory should go fails the walk
        std::fs::write(dst.join("b_dir"), "in the way")?;
        std::fs::write(src.join("b_dir").join("inner.txt"), "inner")?;
        let (ctx, _) = context(&src, &dst, InclusionRule::match_all(), 1);
        let error = sync(&ctx).await.unwrap_err();
        assert!(format!("{error:#}").contains("b_dir"));
        assert_eq!(error.summary.files_copied, 1);
        assert_eq!(std::fs::read_to_string(dst.join("a.txt"))?, "a");
        Ok(())
    }

    #[tokio::test]
    async fn missing_source_is_a_walk_error() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let (ctx, _) = context(
            &tmp.path().join("missing"),
            &tmp.path().join("dst"),
            InclusionRule::match_all(),
            1,
        );
        let error = sync(&ctx).await.unwrap_err();
        assert!(format!("{error}").contains("missing"));
        Ok(())
    }
}
