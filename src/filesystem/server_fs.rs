use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::unistd::{Gid, Uid};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::config::{OwnershipConfig, SystemConfig};
use crate::error::{PinionError, Result};

use super::metadata::{self, FileStat};
use super::resolver;
use super::usage::{DiskAccountant, DiskUsage};
use super::walker;

/// Bytes of a `writefile` source buffered in memory to learn its size before
/// anything reaches disk. Sources that fit are quota-checked exactly; larger
/// sources are admitted on this prefix and reconciled after the stream ends.
const WRITE_PROBE_LIMIT: usize = 512 * 1024;

/// Bytes read from the head of a file when sniffing its content type.
const MIME_SNIFF_LEN: usize = 512;

/// A filesystem confined to one server's root directory.
///
/// Every operation takes a user-supplied path and pushes it through the
/// containment layer before touching the host; see [`resolver`]. Mutations
/// keep the disk accountant in step so quota decisions stay O(1).
#[derive(Debug)]
pub struct ServerFileSystem {
    root: PathBuf,
    accountant: DiskAccountant,
    ownership: Option<OwnershipConfig>,
}

impl ServerFileSystem {
    /// Builds an instance rooted at `root`, which must already exist; the
    /// instance never creates its own root. A `disk_limit_bytes` of 0 means
    /// unlimited.
    pub async fn new(root: PathBuf, disk_limit_bytes: u64, system: &SystemConfig) -> Result<Self> {
        let root = fs::canonicalize(&root).await?;
        if !fs::metadata(&root).await?.is_dir() {
            return Err(PinionError::Io(std::io::Error::other(
                "server root is not a directory",
            )));
        }

        Ok(Self {
            root,
            accountant: DiskAccountant::new(
                disk_limit_bytes,
                Duration::from_secs(system.disk_check_interval),
            ),
            ownership: system.user,
        })
    }

    /// Absolute host path of the server root.
    pub fn path(&self) -> &Path {
        &self.root
    }

    fn safe_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        resolver::resolve(&self.root, path)
    }

    pub(crate) fn accountant(&self) -> &DiskAccountant {
        &self.accountant
    }

    /// Whether a mutation growing usage by `delta` bytes fits under the
    /// quota.
    pub fn has_space_for(&self, delta: i64) -> bool {
        self.accountant.has_space_for(delta)
    }

    /// Replaces the quota, e.g. when the panel resizes the server.
    pub fn set_disk_limit(&self, limit_bytes: u64) {
        self.accountant.set_limit(limit_bytes);
    }

    /// Current usage snapshot. Triggers a full recount when the previous one
    /// has aged past the configured check interval; a failed recount keeps
    /// the previous estimate.
    pub async fn disk_usage(&self) -> DiskUsage {
        if let Err(err) = self
            .accountant
            .recount_with(false, walker::total_file_size(&self.root))
            .await
        {
            warn!("disk usage recount failed, keeping previous estimate: {}", err);
        }
        self.accountant.snapshot()
    }

    /// Forces a full recount, e.g. after restoring a backup into the root.
    pub async fn recount(&self) -> Result<()> {
        self.accountant
            .recount_with(true, walker::total_file_size(&self.root))
            .await
    }

    /// Whether `path` names an existing entry inside the root. Paths that
    /// escape the sandbox read as absent.
    pub async fn exists(&self, path: &str) -> bool {
        match self.safe_path(path) {
            Ok(cleaned) => fs::symlink_metadata(&cleaned).await.is_ok(),
            Err(_) => false,
        }
    }

    /// Copies the file's bytes into `sink`.
    pub async fn open<W>(&self, path: &str, sink: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let cleaned = self.safe_path(path)?;

        let metadata = fs::metadata(&cleaned).await?;
        if metadata.is_dir() {
            return Err(PinionError::IsDirectory);
        }

        let mut file = fs::File::open(&cleaned).await?;
        tokio::io::copy(&mut file, sink).await?;
        Ok(())
    }

    /// Reads the whole file into memory. Unbounded by design; callers
    /// enforce their own size limits.
    pub async fn readfile(&self, path: &str) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.open(path, &mut buffer).await?;
        Ok(buffer)
    }

    /// Writes `source` to `path` with create-or-truncate semantics, mode
    /// 0644, creating missing parents with mode 0755. The write is admitted
    /// against the quota before any byte reaches disk when the source fits
    /// the probe buffer; partial bytes written on a stream error are still
    /// recorded, and the next recount reconciles.
    pub async fn writefile<R>(&self, path: &str, mut source: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let cleaned = self.safe_path(path)?;

        let old_size = match fs::metadata(&cleaned).await {
            Ok(metadata) if metadata.is_dir() => return Err(PinionError::IsDirectory),
            Ok(metadata) => metadata.len() as i64,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };

        let mut probe = Vec::new();
        let size_known = read_probe(&mut source, &mut probe).await?;

        // With the full source in memory this check is exact; otherwise the
        // prefix is the admission estimate and the stream below records the
        // real delta.
        let delta = probe.len() as i64 - old_size;
        if !self.accountant.has_space_for(delta) {
            return Err(self.no_space(delta));
        }

        let created = self.create_dir_chain(cleaned.parent().unwrap_or(&self.root)).await?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&cleaned)
            .await?;

        let mut written = 0i64;
        let result = async {
            file.write_all(&probe).await?;
            written += probe.len() as i64;

            if !size_known {
                let mut buffer = [0u8; 16 * 1024];
                loop {
                    let n = source.read(&mut buffer).await?;
                    if n == 0 {
                        break;
                    }
                    file.write_all(&buffer[..n]).await?;
                    written += n as i64;
                }
            }

            file.sync_all().await?;
            Ok::<(), PinionError>(())
        }
        .await;

        // Partial bytes written on error exist on disk all the same.
        self.accountant.add(written - old_size);
        result?;
        drop(file);

        self.apply_ownership(&cleaned).await;
        for dir in created {
            self.apply_ownership(&dir).await;
        }

        Ok(())
    }

    /// Creates `parent/name` and any missing ancestors with mode 0755.
    /// Directory metadata is never charged to the quota.
    pub async fn create_directory(&self, name: &str, parent: &str) -> Result<()> {
        let cleaned = self.safe_path(Path::new(parent).join(name))?;

        let created = self.create_dir_chain(&cleaned).await?;
        for dir in created {
            self.apply_ownership(&dir).await;
        }
        Ok(())
    }

    /// Moves `from` to `to`, creating missing parents of `to`. Falls back to
    /// copy-then-delete when the two sit on different devices. Sizes stay
    /// inside the root either way, so the accountant is untouched.
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let old = self.safe_path(from)?;
        let new = self.safe_path(to)?;

        // Destination checks run first: the root is never a valid target and
        // an occupied destination is never clobbered.
        if new == self.root || fs::symlink_metadata(&new).await.is_ok() {
            return Err(PinionError::AlreadyExists);
        }
        if old == self.root {
            return Err(PinionError::AlreadyExists);
        }
        fs::symlink_metadata(&old).await?;

        let created = self.create_dir_chain(new.parent().unwrap_or(&self.root)).await?;

        match fs::rename(&old, &new).await {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EXDEV) => {
                copy_tree(&old, &new).await?;
                remove_any(&old).await?;
            }
            Err(err) => return Err(err.into()),
        }

        for dir in created {
            self.apply_ownership(&dir).await;
        }
        Ok(())
    }

    /// Duplicates a regular file alongside itself, naming the duplicate by
    /// the copy-suffix rule: `stem copy.ext`, then `stem copy 1.ext`,
    /// `stem copy 2.ext`, … The name is claimed with an exclusive create so
    /// concurrent copies cannot collide.
    pub async fn copy(&self, path: &str) -> Result<()> {
        let cleaned = self.safe_path(path)?;

        let metadata = fs::metadata(&cleaned).await?;
        if !metadata.is_file() {
            // Directories and special files cannot be duplicated this way;
            // mirror the missing-file signal.
            return Err(PinionError::NotFound);
        }

        let size = metadata.len() as i64;
        if !self.accountant.has_space_for(size) {
            return Err(self.no_space(size));
        }

        let parent = cleaned.parent().unwrap_or(&self.root).to_path_buf();
        let (stem, extension) = split_copy_name(&cleaned);
        let mode = metadata.permissions().mode() & 0o777;

        let mut index = 0u32;
        let (destination, mut target) = loop {
            let name = if index == 0 {
                format!("{stem} copy{extension}")
            } else {
                format!("{stem} copy {index}{extension}")
            };
            let candidate = parent.join(name);

            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(mode)
                .open(&candidate)
                .await
            {
                Ok(file) => break (candidate, file),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => index += 1,
                Err(err) => return Err(err.into()),
            }
        };

        let mut source = fs::File::open(&cleaned).await?;
        match tokio::io::copy(&mut source, &mut target).await {
            Ok(copied) => {
                target.sync_all().await?;
                drop(target);
                self.accountant.add(copied as i64);
                self.apply_ownership(&destination).await;
                Ok(())
            }
            Err(err) => {
                // The partial duplicate stays on disk; account what landed
                // and let the caller retry or delete it.
                let partial = fs::metadata(&destination)
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0);
                self.accountant.add(partial as i64);
                Err(err.into())
            }
        }
    }

    /// Removes `path`, recursing through directories, and returns the bytes
    /// to the accountant. Deleting something already gone is success; the
    /// root itself is never deletable.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let cleaned = self.safe_path(path)?;
        if cleaned == self.root {
            return Err(PinionError::CannotDeleteRoot);
        }

        let metadata = match fs::symlink_metadata(&cleaned).await {
            Ok(metadata) => metadata,
            // Gone already is the desired postcondition.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let size = if metadata.is_dir() {
            walker::total_file_size(&cleaned).await?
        } else if metadata.is_file() {
            metadata.len()
        } else {
            0
        };

        if metadata.is_dir() {
            fs::remove_dir_all(&cleaned).await?;
        } else {
            fs::remove_file(&cleaned).await?;
        }

        self.accountant.add(-(size as i64));
        Ok(())
    }

    /// Stat record for a single entry, with content-sniffed mime typing for
    /// regular files.
    pub async fn stat(&self, path: &str) -> Result<FileStat> {
        let cleaned = self.safe_path(path)?;
        let metadata = fs::metadata(&cleaned).await?;

        let sniff = if metadata.is_file() {
            let mut file = fs::File::open(&cleaned).await?;
            let mut buffer = vec![0u8; MIME_SNIFF_LEN];
            let n = file.read(&mut buffer).await?;
            buffer.truncate(n);
            Some(buffer)
        } else {
            None
        };

        Ok(FileStat::from_metadata(
            self.relative(&cleaned),
            &metadata,
            sniff.as_deref(),
        ))
    }

    /// Stat records for the direct children of `path`, directories first,
    /// then case-insensitive name order. Mime typing is extension-only here
    /// to keep listings cheap.
    pub async fn list_directory(&self, path: &str) -> Result<Vec<FileStat>> {
        let cleaned = self.safe_path(path)?;

        let mut entries = fs::read_dir(&cleaned).await?;
        let mut listing = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!("skipping unstatable entry {:?} in listing: {}", entry.path(), err);
                    continue;
                }
            };

            let path = entry.path();
            listing.push(FileStat::from_metadata(self.relative(&path), &metadata, None));
        }

        listing.sort_by(metadata::listing_order);
        Ok(listing)
    }

    /// Applies the configured ownership to `path`, recursing through
    /// directories. A no-op when no ownership is configured; symlinks
    /// encountered in the walk are left alone rather than chowned through.
    pub async fn chown(&self, path: &str) -> Result<()> {
        let Some(owner) = self.ownership else {
            return Ok(());
        };

        let cleaned = self.safe_path(path)?;
        let metadata = fs::metadata(&cleaned).await?;

        chown_path(&cleaned, owner)?;
        if metadata.is_dir() {
            walker::walk(&cleaned, |entry, entry_metadata| {
                if entry_metadata.file_type().is_symlink() {
                    return;
                }
                if let Err(err) = chown_path(entry, owner) {
                    warn!("failed to change ownership of {:?}: {}", entry, err);
                }
            })
            .await?;
        }
        Ok(())
    }

    /// Strips the root, leaving the path callers are allowed to see.
    fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }

    fn no_space(&self, requested: i64) -> PinionError {
        PinionError::NotEnoughDiskSpace {
            requested,
            available: self.accountant.headroom(),
        }
    }

    /// Creates `target` and any missing ancestors inside the root with mode
    /// 0755, returning the directories actually created (shallowest first)
    /// so ownership can be applied to them.
    async fn create_dir_chain(&self, target: &Path) -> Result<Vec<PathBuf>> {
        let mut missing = Vec::new();
        let mut cursor = target.to_path_buf();

        while cursor.starts_with(&self.root) && cursor != self.root {
            if fs::symlink_metadata(&cursor).await.is_ok() {
                break;
            }
            missing.push(cursor.clone());
            match cursor.parent() {
                Some(parent) => cursor = parent.to_path_buf(),
                None => break,
            }
        }

        if missing.is_empty() {
            if !fs::metadata(target).await?.is_dir() {
                return Err(PinionError::AlreadyExists);
            }
            return Ok(missing);
        }

        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        builder.mode(0o755);
        builder.create(target).await?;

        missing.reverse();
        Ok(missing)
    }

    /// Best-effort ownership application after a mutation; failures are
    /// logged, not propagated.
    async fn apply_ownership(&self, path: &Path) {
        if let Some(owner) = self.ownership {
            if let Err(err) = chown_path(path, owner) {
                warn!("failed to change ownership of {:?}: {}", path, err);
            }
        }
    }
}

fn chown_path(path: &Path, owner: OwnershipConfig) -> std::io::Result<()> {
    nix::unistd::chown(
        path,
        Some(Uid::from_raw(owner.uid)),
        Some(Gid::from_raw(owner.gid)),
    )
    .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
}

/// Reads from `source` into `probe` until EOF or the probe limit is passed.
/// Returns whether the source was fully consumed, i.e. its size is known.
async fn read_probe<R>(source: &mut R, probe: &mut Vec<u8>) -> Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; 16 * 1024];
    while probe.len() <= WRITE_PROBE_LIMIT {
        let n = source.read(&mut buffer).await?;
        if n == 0 {
            return Ok(true);
        }
        probe.extend_from_slice(&buffer[..n]);
    }
    Ok(false)
}

fn split_copy_name(path: &Path) -> (String, String) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (stem, extension)
}

/// Replicates `from` at `to`, preserving modes and recreating symlinks with
/// their original targets. Used by the cross-device rename fallback.
async fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(from).await?;

    if metadata.file_type().is_symlink() {
        let target = fs::read_link(from).await?;
        fs::symlink(target, to).await?;
        return Ok(());
    }

    if metadata.is_file() {
        copy_file(from, to, metadata.permissions().mode() & 0o777).await?;
        return Ok(());
    }

    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];
    while let Some((src, dst)) = pending.pop() {
        let src_metadata = fs::symlink_metadata(&src).await?;
        let mut builder = fs::DirBuilder::new();
        builder.mode(src_metadata.permissions().mode() & 0o777);
        builder.create(&dst).await?;

        let mut entries = fs::read_dir(&src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let entry_metadata = entry.metadata().await?;
            let entry_src = entry.path();
            let entry_dst = dst.join(entry.file_name());

            if entry_metadata.is_dir() {
                pending.push((entry_src, entry_dst));
            } else if entry_metadata.file_type().is_symlink() {
                let target = fs::read_link(&entry_src).await?;
                fs::symlink(target, &entry_dst).await?;
            } else {
                copy_file(
                    &entry_src,
                    &entry_dst,
                    entry_metadata.permissions().mode() & 0o777,
                )
                .await?;
            }
        }
    }

    Ok(())
}

async fn copy_file(src: &Path, dst: &Path, mode: u32) -> Result<u64> {
    let mut reader = fs::File::open(src).await?;
    let mut writer = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(dst)
        .await?;

    let copied = tokio::io::copy(&mut reader, &mut writer).await?;
    writer.sync_all().await?;
    Ok(copied)
}

async fn remove_any(path: &Path) -> Result<()> {
    if fs::symlink_metadata(path).await?.is_dir() {
        fs::remove_dir_all(path).await?;
    } else {
        fs::remove_file(path).await?;
    }
    Ok(())
}
