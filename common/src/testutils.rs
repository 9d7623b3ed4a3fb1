use anyhow::Context;
use async_recursion::async_recursion;

/// Create a scratch tree and return the directory holding it:
///
/// ```text
/// foo
/// |- 0.txt
/// |- bar
///    |- 1.txt
///    |- 2.txt
///    |- 3.txt
/// |- baz
///    |- 4.txt
///    |- 5.txt -> ../bar/2.txt
///    |- 6.txt -> (absolute path) .../foo/bar/3.txt
/// ```
pub async fn setup_test_dir() -> anyhow::Result<tempfile::TempDir> {
    let tmp_dir = tempfile::tempdir()?;
    let foo_path = tmp_dir.path().join("foo");
    tokio::fs::create_dir(&foo_path).await?;
    tokio::fs::write(foo_path.join("0.txt"), "0").await?;
    let bar_path = foo_path.join("bar");
    tokio::fs::create_dir(&bar_path).await?;
    tokio::fs::write(bar_path.join("1.txt"), "1").await?;
    tokio::fs::write(bar_path.join("2.txt"), "2").await?;
    tokio::fs::write(bar_path.join("3.txt"), "3").await?;
    let baz_path = foo_path.join("baz");
    tokio::fs::create_dir(&baz_path).await?;
    tokio::fs::write(baz_path.join("4.txt"), "4").await?;
    tokio::fs::symlink("../bar/2.txt", baz_path.join("5.txt")).await?;
    tokio::fs::symlink(bar_path.join("3.txt"), baz_path.join("6.txt")).await?;
    Ok(tmp_dir)
}

/// Check that every regular file and directory under `src` has a counterpart with the same
/// content under `dst`. Extra entries in `dst` are allowed; symlinks in `src` are ignored.
#[async_recursion]
pub async fn check_dirs_identical(
    src: &std::path::Path,
    dst: &std::path::Path,
) -> anyhow::Result<()> {
    let mut src_entries = tokio::fs::read_dir(src).await?;
    while let Some(src_entry) = src_entries.next_entry().await? {
        let src_entry_path = src_entry.path();
        let dst_entry_path = dst.join(src_entry.file_name());
        let src_md = tokio::fs::symlink_metadata(&src_entry_path)
            .await
            .with_context(|| format!("Source file {:?} is missing!", &src_entry_path))?;
        if src_md.is_symlink() {
            continue;
        }
        let dst_md = tokio::fs::symlink_metadata(&dst_entry_path)
            .await
            .with_context(|| format!("Destination file {:?} is missing!", &dst_entry_path))?;
        assert_eq!(
            src_md.is_file(),
            dst_md.is_file(),
            "type mismatch for {:?}",
            &dst_entry_path
        );
        if src_md.is_file() {
            let src_contents = tokio::fs::read(&src_entry_path).await?;
            let dst_contents = tokio::fs::read(&dst_entry_path).await?;
            assert_eq!(src_contents, dst_contents, "{:?} differs", &dst_entry_path);
        } else {
            check_dirs_identical(&src_entry_path, &dst_entry_path).await?;
        }
    }
    Ok(())
}

/// Poll `condition` every 50ms until it holds or `timeout` passes.
pub async fn wait_for(timeout: std::time::Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
