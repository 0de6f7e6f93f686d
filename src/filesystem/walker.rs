use std::path::Path;

use tracing::warn;

use crate::error::Result;

/// Pre-order walk of the tree below `root`, invoking `visit` for every entry.
///
/// Symlinks are reported but never followed, so link cycles cannot loop the
/// walk and linked-to trees outside the root are never touched. Failing to
/// read a single entry or descend into a subdirectory is logged and skipped;
/// only an unreadable walk root aborts. Dropping the returned future between
/// directory reads aborts the walk cleanly.
pub(crate) async fn walk<F>(root: &Path, mut visit: F) -> Result<()>
where
    F: FnMut(&Path, &std::fs::Metadata),
{
    let mut pending = vec![root.to_path_buf()];
    let mut at_root = true;

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if at_root => return Err(err.into()),
            Err(err) => {
                warn!("skipping unreadable directory {:?} during walk: {}", dir, err);
                continue;
            }
        };
        at_root = false;

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!("abandoning directory {:?} mid-walk: {}", dir, err);
                    break;
                }
            };

            // DirEntry::metadata does not traverse symlinks, so links show
            // up as links and are never descended into.
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!("skipping unstatable entry {:?} during walk: {}", entry.path(), err);
                    continue;
                }
            };

            let path = entry.path();
            visit(&path, &metadata);

            if metadata.is_dir() {
                pending.push(path);
            }
        }
    }

    Ok(())
}

/// Total size in bytes of the regular files below `root`. Directories,
/// symlinks, and special files contribute nothing.
pub(crate) async fn total_file_size(root: &Path) -> Result<u64> {
    let mut total = 0u64;
    walk(root, |_, metadata| {
        if metadata.is_file() {
            total += metadata.len();
        }
    })
    .await?;
    Ok(total)
}
