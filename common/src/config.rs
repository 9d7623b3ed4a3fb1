//! Configuration types for the mirror, the runtime and the output settings

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use crate::filter::InclusionRule;

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// Errors that stop the mirror before any file is transferred
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("source {path:?} is not a readable directory")]
    InvalidSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("source {0:?} is not a directory")]
    SourceNotDirectory(PathBuf),
    #[error("cannot create destination {path:?}")]
    CreateDestination {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("destination {0:?} is not a directory")]
    DestinationNotDirectory(PathBuf),
    #[error("destination {dest:?} lies inside of source {source_root:?}")]
    DestinationInsideSource { source_root: PathBuf, dest: PathBuf },
    #[error("cannot list directories under {path:?}")]
    ListDirectories {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot watch {path:?}")]
    Subscribe {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// Source and destination roots of a mirror
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    pub source_root: PathBuf,
    pub dest_root: PathBuf,
}

impl SyncTarget {
    pub fn new(source_root: impl Into<PathBuf>, dest_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            dest_root: dest_root.into(),
        }
    }

    /// Destination path mirroring `path`, or `None` when `path` is not under the source root.
    pub fn dest_for(&self, path: &Path) -> Option<PathBuf> {
        let relative = path.strip_prefix(&self.source_root).ok()?;
        Some(self.dest_root.join(relative))
    }

    /// Check the source, create the destination and resolve both roots to absolute paths.
    ///
    /// A missing destination root is created together with any missing ancestors and given the
    /// mode of the source root.
    pub async fn prepare(&self) -> Result<Self, SetupError> {
        let source_metadata = tokio::fs::metadata(&self.source_root)
            .await
            .map_err(|source| SetupError::InvalidSource {
                path: self.source_root.clone(),
                source,
            })?;
        if !source_metadata.is_dir() {
            return Err(SetupError::SourceNotDirectory(self.source_root.clone()));
        }
        let source_root = tokio::fs::canonicalize(&self.source_root)
            .await
            .map_err(|source| SetupError::InvalidSource {
                path: self.source_root.clone(),
                source,
            })?;
        let create_destination = |source: anyhow::Error| SetupError::CreateDestination {
            path: self.dest_root.clone(),
            source,
        };
        let missing = match tokio::fs::metadata(&self.dest_root).await {
            Ok(metadata) if !metadata.is_dir() => {
                return Err(SetupError::DestinationNotDirectory(self.dest_root.clone()));
            }
            Ok(_) => false,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => true,
            Err(error) => return Err(create_destination(error.into())),
        };
        // nothing may be created inside the source tree, so containment is checked first
        let dest_root = resolve_missing(&self.dest_root)
            .await
            .map_err(|error| create_destination(error.into()))?;
        if dest_root.starts_with(&source_root) {
            return Err(SetupError::DestinationInsideSource {
                source_root,
                dest: dest_root,
            });
        }
        if missing {
            tracing::info!("creating destination {:?}", &self.dest_root);
            tokio::fs::create_dir_all(&self.dest_root)
                .await
                .map_err(|error| create_destination(error.into()))?;
            crate::preserve::set_dir_permissions(&source_metadata, &self.dest_root)
                .await
                .map_err(create_destination)?;
        }
        let dest_root = tokio::fs::canonicalize(&self.dest_root)
            .await
            .map_err(|error| create_destination(error.into()))?;
        Ok(Self {
            source_root,
            dest_root,
        })
    }
}

/// Absolute form of a path that may not exist yet: the deepest existing ancestor is resolved
/// and the missing components are appended to it.
async fn resolve_missing(path: &Path) -> std::io::Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut missing = Vec::new();
    loop {
        match tokio::fs::canonicalize(&existing).await {
            Ok(mut resolved) => {
                for name in missing.into_iter().rev() {
                    resolved.push(name);
                }
                return Ok(resolved);
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                let Some(name) = existing.file_name().map(|name| name.to_os_string()) else {
                    return Err(error);
                };
                missing.push(name);
                if !existing.pop() {
                    return Err(error);
                }
                if existing.as_os_str().is_empty() {
                    existing = PathBuf::from(".");
                }
            }
            Err(error) => return Err(error),
        }
    }
}

/// How the mirror runs after startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// one full-tree sync
    Once,
    /// full-tree sync now and then every period
    Scheduled(std::time::Duration),
    /// react to change notifications until cancelled
    Watch,
}

impl RunMode {
    /// A missing or zero interval selects watch mode.
    pub fn from_interval(interval: Option<std::time::Duration>, once: bool) -> Self {
        if once {
            return RunMode::Once;
        }
        match interval {
            Some(period) if !period.is_zero() => RunMode::Scheduled(period),
            _ => RunMode::Watch,
        }
    }

    /// Whether the mode keeps running until it is cancelled.
    pub fn is_continuous(&self) -> bool {
        !matches!(self, RunMode::Once)
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            RunMode::Once => write!(f, "once"),
            RunMode::Scheduled(period) => {
                write!(f, "every {}", humantime::format_duration(*period))
            }
            RunMode::Watch => write!(f, "watch"),
        }
    }
}

/// Parse a schedule interval such as "30m", "1h" or "0".
pub fn parse_interval(value: &str) -> anyhow::Result<std::time::Duration> {
    let value = value.trim();
    if value == "0" {
        return Ok(std::time::Duration::ZERO);
    }
    humantime::parse_duration(value)
        .map_err(|err| anyhow::anyhow!("invalid interval {:?}: {}", value, err))
}

/// Everything a mirror run needs, built once at startup
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub target: SyncTarget,
    pub include: InclusionRule,
    pub max_transfers: NonZeroUsize,
    pub mode: RunMode,
}

impl MirrorConfig {
    pub fn new(target: SyncTarget, mode: RunMode) -> Self {
        Self {
            target,
            include: InclusionRule::match_all(),
            max_transfers: NonZeroUsize::MIN,
            mode,
        }
    }

    #[must_use]
    pub fn with_include(mut self, include: InclusionRule) -> Self {
        self.include = include;
        self
    }

    #[must_use]
    pub fn with_max_transfers(mut self, max_transfers: NonZeroUsize) -> Self {
        self.max_transfers = max_transfers;
        self
    }

    /// Validate the roots and return a config pointing at their resolved locations.
    pub async fn prepare(self) -> Result<Self, SetupError> {
        let target = self.target.prepare().await?;
        Ok(Self { target, ..self })
    }
}
