use std::os::unix::fs::MetadataExt;
use tracing::instrument;

/// Whether `src` was modified strictly after `dst`, compared at nanosecond resolution.
pub fn modified_after(src: &std::fs::Metadata, dst: &std::fs::Metadata) -> bool {
    (src.mtime(), src.mtime_nsec()) > (dst.mtime(), dst.mtime_nsec())
}

/// Decide whether the destination must be (re)written from a source with `src_metadata`.
///
/// A missing destination always needs a copy. Any other stat failure answers `false`: an
/// ambiguous error must not turn into an overwrite.
#[instrument(skip(src_metadata))]
pub async fn needs_copy(src_metadata: &std::fs::Metadata, dst: &std::path::Path) -> bool {
    match tokio::fs::metadata(dst).await {
        Ok(dst_metadata) => modified_after(src_metadata, &dst_metadata),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => true,
        Err(error) => {
            tracing::warn!("cannot stat {:?}, skipping: {}", dst, &error);
            false
        }
    }
}
