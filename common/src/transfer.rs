use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;

use crate::preserve;
use crate::progress;

const BUFFER_SIZE: usize = 128 * 1024;
const MIB: f64 = 1024.0 * 1024.0;

/// Error type for mirror operations that preserves the operation summary even on failure.
///
/// # Logging Convention
/// The Display implementation shows the full error chain, so it can be logged with any format
/// specifier:
/// ```ignore
/// tracing::error!("sync failed: {}", &error);
/// tracing::error!("sync failed: {:#}", &error);
/// ```
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub bytes_copied: u64,
    pub files_copied: usize,
    pub files_unchanged: usize,
    pub files_filtered: usize,
    pub files_failed: usize,
    pub directories_created: usize,
    pub directories_unchanged: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_copied: self.bytes_copied + other.bytes_copied,
            files_copied: self.files_copied + other.files_copied,
            files_unchanged: self.files_unchanged + other.files_unchanged,
            files_filtered: self.files_filtered + other.files_filtered,
            files_failed: self.files_failed + other.files_failed,
            directories_created: self.directories_created + other.directories_created,
            directories_unchanged: self.directories_unchanged + other.directories_unchanged,
        }
    }
}

impl std::ops::AddAssign for Summary {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes copied: {}\n\
            files copied: {}\n\
            files unchanged: {}\n\
            files filtered out: {}\n\
            files failed: {}\n\
            directories created: {}\n\
            directories unchanged: {}",
            bytesize::ByteSize(self.bytes_copied),
            self.files_copied,
            self.files_unchanged,
            self.files_filtered,
            self.files_failed,
            self.directories_created,
            self.directories_unchanged,
        )
    }
}

/// One file scheduled for copying. Each task is owned by the single transfer executing it.
///
/// Size and mode are read from the opened source when the transfer runs, so a file changed
/// after it was scheduled is copied as it is at that point.
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub src: std::path::PathBuf,
    pub dst: std::path::PathBuf,
}

impl TransferTask {
    pub fn new(src: std::path::PathBuf, dst: std::path::PathBuf) -> Self {
        Self { src, dst }
    }
}

/// MiB per second, 0 when no measurable time has passed.
pub fn throughput_mib(bytes: u64, elapsed: std::time::Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    bytes as f64 / (secs * MIB)
}

pub fn completion_line(name: &str, bytes: u64, elapsed: std::time::Duration) -> String {
    format!(
        "Copied {} ({}) in {:.2}s ({:.2} MiB/s)",
        name,
        bytesize::ByteSize(bytes),
        elapsed.as_secs_f64(),
        throughput_mib(bytes, elapsed)
    )
}

async fn copy_contents(
    reader: &mut tokio::fs::File,
    writer: &mut tokio::fs::File,
    task: &TransferTask,
    bar: &mut dyn progress::TransferProgress,
) -> anyhow::Result<u64> {
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut throttle = progress::UpdateThrottle::default();
    let mut copied = 0u64;
    let mut reported = None;
    loop {
        let read = reader
            .read(&mut buffer)
            .await
            .with_context(|| format!("failed reading from {:?}", &task.src))?;
        if read == 0 {
            break;
        }
        writer
            .write_all(&buffer[..read])
            .await
            .with_context(|| format!("failed writing to {:?}", &task.dst))?;
        copied += read as u64;
        if throttle.ready() {
            bar.update(copied);
            reported = Some(copied);
        }
    }
    if reported != Some(copied) {
        bar.update(copied);
    }
    writer
        .flush()
        .await
        .with_context(|| format!("failed flushing {:?}", &task.dst))?;
    Ok(copied)
}

/// Copy one file, streaming progress to `sink`.
///
/// The destination's parent directory must exist. The destination is created or truncated,
/// synced to stable storage and given the source's mode. On failure whatever was already
/// written stays in place.
#[instrument(skip(prog_track, sink))]
pub async fn transfer(
    prog_track: &progress::Progress,
    sink: &dyn progress::ProgressSink,
    task: &TransferTask,
) -> Result<Summary, Error> {
    let _transfer_guard = prog_track.transfers.guard();
    let failed = || {
        prog_track.files_failed.inc();
        Summary {
            files_failed: 1,
            ..Default::default()
        }
    };
    tracing::debug!("opening 'src' for reading and 'dst' for writing");
    let mut reader = tokio::fs::File::open(&task.src)
        .await
        .with_context(|| format!("cannot open {:?} for reading", &task.src))
        .map_err(|err| Error::new(err, failed()))?;
    let mut writer = tokio::fs::File::create(&task.dst)
        .await
        .with_context(|| format!("cannot open {:?} for writing", &task.dst))
        .map_err(|err| Error::new(err, failed()))?;
    let src_metadata = reader
        .metadata()
        .await
        .with_context(|| format!("failed reading metadata from {:?}", &task.src))
        .map_err(|err| Error::new(err, failed()))?;
    let name = task
        .src
        .file_name()
        .unwrap_or(task.src.as_os_str())
        .to_string_lossy()
        .into_owned();
    let mut bar = sink.start(&name, src_metadata.len());
    let start = std::time::Instant::now();
    let result = async {
        let copied = copy_contents(&mut reader, &mut writer, task, bar.as_mut()).await?;
        let elapsed = start.elapsed();
        tracing::debug!("syncing data");
        writer
            .sync_all()
            .await
            .with_context(|| format!("failed syncing {:?}", &task.dst))?;
        tracing::debug!("setting permissions");
        preserve::set_file_permissions(&src_metadata, &writer, &task.dst).await?;
        Ok::<_, anyhow::Error>((copied, elapsed))
    }
    .await;
    match result {
        Ok((copied, elapsed)) => {
            bar.finish(&completion_line(&name, copied, elapsed));
            prog_track.files_copied.inc();
            prog_track.bytes_copied.add(copied);
            Ok(Summary {
                bytes_copied: copied,
                files_copied: 1,
                ..Default::default()
            })
        }
        Err(err) => {
            bar.abandon();
            Err(Error::new(err, failed()))
        }
    }
}
