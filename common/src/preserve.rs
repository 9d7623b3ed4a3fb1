use anyhow::{Context, Result};
use std::os::unix::prelude::PermissionsExt;
use tracing::instrument;

/// Permission bits carried over from the source: rwx for all classes plus setuid, setgid and
/// sticky.
pub const MODE_MASK: u32 = 0o7777;

pub fn mode_of(metadata: &std::fs::Metadata) -> u32 {
    metadata.permissions().mode() & MODE_MASK
}

/// Give an open destination file the same mode bits as its source.
#[instrument(skip(metadata, file))]
pub async fn set_file_permissions(
    metadata: &std::fs::Metadata,
    file: &tokio::fs::File,
    path: &std::path::Path,
) -> Result<()> {
    let permissions = std::fs::Permissions::from_mode(mode_of(metadata));
    file.set_permissions(permissions.clone())
        .await
        .with_context(|| format!("cannot set {:?} permissions to {:?}", &path, &permissions))?;
    Ok(())
}

/// Give a freshly created directory the same mode bits as its source. Creation goes through
/// the umask, so the mode is applied again explicitly.
#[instrument(skip(metadata))]
pub async fn set_dir_permissions(
    metadata: &std::fs::Metadata,
    path: &std::path::Path,
) -> Result<()> {
    let permissions = std::fs::Permissions::from_mode(mode_of(metadata));
    tokio::fs::set_permissions(path, permissions.clone())
        .await
        .with_context(|| format!("cannot set {:?} permissions to {:?}", &path, &permissions))?;
    Ok(())
}
