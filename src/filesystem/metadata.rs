use std::cmp::Ordering;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A single entry as reported to callers of the management surface.
///
/// Carries only the root-relative path; the absolute host location never
/// leaves this crate.
#[derive(Debug, Clone, Serialize)]
pub struct FileStat {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub directory: bool,
    pub symlink: bool,
    /// Permission bits (the low nine mode bits).
    pub mode: u32,
    pub mime: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl FileStat {
    /// Builds a record from host metadata. `relative` is the path below the
    /// server root; `sniff` is an optional prefix of the file's bytes used
    /// to type the content beyond what the extension gives away.
    pub(crate) fn from_metadata(
        relative: &Path,
        metadata: &std::fs::Metadata,
        sniff: Option<&[u8]>,
    ) -> Self {
        Self {
            name: relative
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            path: relative.to_string_lossy().to_string(),
            size: metadata.len(),
            directory: metadata.is_dir(),
            symlink: metadata.file_type().is_symlink(),
            mode: permission_bits(metadata),
            mime: detect_mime(relative, metadata, sniff).to_string(),
            created: timestamp(metadata.created().ok()),
            modified: timestamp(metadata.modified().ok()),
        }
    }
}

/// Orders listings the way the panel presents them: directories first, then
/// case-insensitive name order.
pub(crate) fn listing_order(a: &FileStat, b: &FileStat) -> Ordering {
    b.directory
        .cmp(&a.directory)
        .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
}

fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o777
}

fn detect_mime(path: &Path, metadata: &std::fs::Metadata, sniff: Option<&[u8]>) -> &'static str {
    if metadata.is_dir() {
        return "inode/directory";
    }
    if metadata.file_type().is_symlink() {
        return "inode/symlink";
    }

    if let Some(buffer) = sniff {
        if let Some(kind) = infer::get(buffer) {
            return kind.mime_type();
        }
        if let Some(mime) = new_mime_guess::from_path(path).iter_raw().next() {
            return mime;
        }
        if buffer.is_empty() || std::str::from_utf8(buffer).is_ok() {
            return "text/plain";
        }
        return "application/octet-stream";
    }

    new_mime_guess::from_path(path)
        .iter_raw()
        .next()
        .unwrap_or("application/octet-stream")
}

fn timestamp(time: Option<SystemTime>) -> DateTime<Utc> {
    time.map(DateTime::<Utc>::from).unwrap_or_default()
}
