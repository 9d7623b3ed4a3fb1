//! Continuous mirroring driven by filesystem change notifications
//!
//! The watcher registers every directory of its subscription non-recursively at startup. Each
//! create or write event on a regular file that passes the inclusion filter starts a transfer
//! right away on its own task. These transfers do not go through the bounded limiter and skip
//! the staleness check: the event itself says the file changed.
//!
//! Directories created after startup are not registered, so files written inside them are only
//! picked up by a full sync.

use anyhow::Context;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher as _};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::SetupError;
use crate::filter::{FilterResult, FilterScope};
use crate::sync::{Error, Summary, SyncContext};
use crate::transfer::{self, TransferTask};

type Transfers = tokio::task::JoinSet<Result<Summary, Error>>;

/// What a notification means for the mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Created,
    Written,
}

/// Map a notification kind to the changes the mirror reacts to. Removals, metadata updates,
/// rename sources and plain access are ignored.
pub fn classify(kind: &EventKind) -> Option<Change> {
    match kind {
        EventKind::Create(_) => Some(Change::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(Change::Created),
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            Some(Change::Written)
        }
        _ => None,
    }
}

/// Directories to register: the include patterns that name existing directories under the
/// source root, or the whole source root when none do.
async fn subscription_roots(ctx: &SyncContext) -> Vec<PathBuf> {
    let source_root = &ctx.config.target.source_root;
    let mut roots = BTreeSet::new();
    for pattern in ctx.config.include.patterns() {
        if pattern.is_empty() {
            continue;
        }
        let candidate = match tokio::fs::canonicalize(source_root.join(pattern)).await {
            Ok(candidate) => candidate,
            Err(_) => continue,
        };
        if !candidate.starts_with(source_root) {
            tracing::debug!("include pattern {:?} points outside of the source", pattern);
            continue;
        }
        if tokio::fs::metadata(&candidate)
            .await
            .is_ok_and(|metadata| metadata.is_dir())
        {
            roots.insert(candidate);
        }
    }
    if roots.is_empty() {
        roots.insert(source_root.clone());
    }
    roots.into_iter().collect()
}

/// Every directory under `roots`, roots included, without following symlinks.
async fn list_directories(roots: &[PathBuf]) -> Result<Vec<PathBuf>, SetupError> {
    let mut directories = BTreeSet::new();
    let mut pending: Vec<PathBuf> = roots.to_vec();
    while let Some(dir) = pending.pop() {
        if !directories.insert(dir.clone()) {
            continue;
        }
        let list_error = |source| SetupError::ListDirectories {
            path: dir.clone(),
            source,
        };
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(list_error)?;
        while let Some(entry) = entries.next_entry().await.map_err(list_error)? {
            if entry.file_type().await.map_err(list_error)?.is_dir() {
                pending.push(entry.path());
            }
        }
    }
    Ok(directories.into_iter().collect())
}

/// A live subscription to change notifications below the source root
pub struct Watcher {
    ctx: SyncContext,
    limiter: throttle::TransferLimiter,
    subscription: Vec<PathBuf>,
    events: tokio::sync::mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    // dropping the handle ends the subscription
    _handle: notify::RecommendedWatcher,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Register every directory of the subscription.
    #[instrument(skip(ctx))]
    pub async fn new(ctx: SyncContext) -> Result<Self, SetupError> {
        let source_root = ctx.config.target.source_root.clone();
        let roots = subscription_roots(&ctx).await;
        let subscription = list_directories(&roots).await?;
        let (tx, events) = tokio::sync::mpsc::unbounded_channel();
        let mut handle = notify::RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                // the receiver only goes away once the loop has stopped
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(|source| SetupError::Subscribe {
            path: source_root.clone(),
            source,
        })?;
        for dir in &subscription {
            handle
                .watch(dir, RecursiveMode::NonRecursive)
                .map_err(|source| SetupError::Subscribe {
                    path: dir.clone(),
                    source,
                })?;
        }
        tracing::info!(
            "watching {} directories under {:?}",
            subscription.len(),
            &source_root
        );
        Ok(Self {
            ctx,
            limiter: throttle::TransferLimiter::unbounded(),
            subscription,
            events,
            _handle: handle,
        })
    }

    /// Directories registered for notifications
    pub fn subscription(&self) -> &[PathBuf] {
        &self.subscription
    }

    /// React to notifications until `token` is cancelled or the notification channel closes.
    ///
    /// Transfers still running at that point are awaited and their results are part of the
    /// returned summary.
    #[instrument(skip(self, token))]
    pub async fn run(mut self, token: CancellationToken) -> anyhow::Result<Summary> {
        let mut transfers = Transfers::new();
        let mut summary = Summary::default();
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("watch cancelled");
                    break;
                }
                event = self.events.recv() => match event {
                    Some(Ok(event)) => summary += self.handle_event(event, &mut transfers).await,
                    Some(Err(error)) => tracing::error!("watch error: {}", &error),
                    None => {
                        tracing::warn!("change notifications stopped");
                        break;
                    }
                },
                Some(res) = transfers.join_next(), if !transfers.is_empty() => {
                    summary += self.reap(res);
                }
            }
        }
        self.events.close();
        while let Some(res) = transfers.join_next().await {
            summary += self.reap(res);
        }
        Ok(summary)
    }

    fn reap(&self, res: Result<Result<Summary, Error>, tokio::task::JoinError>) -> Summary {
        match res {
            Ok(Ok(summary)) => summary,
            Ok(Err(error)) => {
                tracing::error!("{:#}", &error);
                error.summary
            }
            Err(join_error) => {
                tracing::error!("transfer task failed: {}", &join_error);
                self.ctx.progress.files_failed.inc();
                Summary {
                    files_failed: 1,
                    ..Default::default()
                }
            }
        }
    }

    /// Start transfers for the files an event touches. Returns the counts of files that were
    /// rejected before any transfer started.
    pub async fn handle_event(&self, event: notify::Event, transfers: &mut Transfers) -> Summary {
        let Some(change) = classify(&event.kind) else {
            tracing::trace!("ignoring {:?}", &event);
            return Summary::default();
        };
        self.ctx.progress.events_received.inc();
        let mut summary = Summary::default();
        for path in event.paths {
            tracing::info!("{:?}: {:?}", change, &path);
            summary += self.handle_path(path, transfers).await;
        }
        summary
    }

    async fn handle_path(&self, path: PathBuf, transfers: &mut Transfers) -> Summary {
        let config = &self.ctx.config;
        let metadata = match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) => metadata,
            Err(error) => {
                tracing::debug!("{:?} is gone: {}", &path, &error);
                return Summary::default();
            }
        };
        if !metadata.is_file() {
            tracing::trace!("ignoring {:?}: not a regular file", &path);
            return Summary::default();
        }
        if let FilterResult::ExcludedByDefault = config.include.should_include(
            &path,
            &config.target.source_root,
            FilterScope::FileOrDirectory,
        ) {
            tracing::debug!("skipping {:?}: no include pattern matches", &path);
            self.ctx.progress.files_filtered.inc();
            return Summary {
                files_filtered: 1,
                ..Default::default()
            };
        }
        let Some(dst) = config.target.dest_for(&path) else {
            tracing::error!("{:?} is not under the source root", &path);
            return Summary::default();
        };
        if let Err(error) = create_parent(&dst).await {
            tracing::error!("{:#}", &error);
            self.ctx.progress.files_failed.inc();
            return Summary {
                files_failed: 1,
                ..Default::default()
            };
        }
        let permit = self.limiter.acquire().await;
        let task = TransferTask::new(path, dst);
        let progress = self.ctx.progress.clone();
        let sink = self.ctx.sink.clone();
        transfers.spawn(async move {
            let _permit = permit;
            transfer::transfer(&progress, sink.as_ref(), &task).await
        });
        Summary::default()
    }
}

async fn create_parent(dst: &Path) -> anyhow::Result<()> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("cannot create directory {:?}", parent))?;
    }
    Ok(())
}
