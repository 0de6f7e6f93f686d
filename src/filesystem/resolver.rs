use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{PinionError, Result};

/// Upper bound on symlink indirections chased while resolving one path.
const MAX_SYMLINK_HOPS: usize = 32;

/// Resolves a user-supplied path to an absolute host path confined to `root`.
///
/// `root` must already be canonicalized. The user path is interpreted
/// relative to the root (a leading root prefix is stripped when a caller
/// passes an absolute form back in), lexically cleaned, then resolved against
/// the live filesystem so symlinks cannot smuggle the result outside the
/// sandbox. Escapes surface as [`PinionError::NotFound`], indistinguishable
/// from a genuinely missing file.
pub(crate) fn resolve(root: &Path, user_path: impl AsRef<Path>) -> Result<PathBuf> {
    let user_path = user_path.as_ref();
    let relative = user_path.strip_prefix(root).unwrap_or(user_path);

    let Some(cleaned) = lexical_clean(relative) else {
        debug!("path {:?} climbs out of the server root", user_path);
        return Err(PinionError::NotFound);
    };

    let resolved = chase_links(root.join(cleaned)).map_err(PinionError::from)?;

    if !resolved.starts_with(root) {
        debug!(
            "path {:?} resolves to {:?}, outside the server root",
            user_path, resolved
        );
        return Err(PinionError::NotFound);
    }

    Ok(resolved)
}

/// Collapses `.` and `..` without touching the filesystem. Returns `None`
/// when a `..` would climb above the root.
fn lexical_clean(path: &Path) -> Option<PathBuf> {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::ParentDir => {
                if !cleaned.pop() {
                    return None;
                }
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Some(cleaned)
}

/// Resolves symlinks along `candidate`: the longest existing prefix is
/// canonicalized, a dangling symlink sitting at the first missing component
/// is chased so its target participates in the containment check, and any
/// components that do not exist yet are appended verbatim.
fn chase_links(candidate: PathBuf) -> io::Result<PathBuf> {
    let mut path = candidate;

    for _ in 0..MAX_SYMLINK_HOPS {
        match std::fs::canonicalize(&path) {
            Ok(resolved) => return Ok(resolved),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }

        let (prefix, tail) = split_existing_prefix(&path)?;

        let mut tail_iter = tail.iter();
        let first = match tail_iter.next() {
            Some(first) => prefix.join(first),
            None => return Ok(prefix),
        };

        match std::fs::read_link(&first) {
            Ok(target) => {
                let mut next = if target.is_absolute() {
                    target
                } else {
                    prefix.join(target)
                };
                for rest in tail_iter {
                    next.push(rest);
                }
                path = next;
            }
            // Not a symlink: the tail simply does not exist yet.
            Err(_) => {
                let mut resolved = prefix;
                resolved.push(first.file_name().unwrap_or_default());
                for rest in tail_iter {
                    resolved.push(rest);
                }
                return Ok(resolved);
            }
        }
    }

    Err(io::Error::other("too many levels of symbolic links"))
}

/// Splits `path` into its deepest canonicalizable ancestor and the missing
/// components below it, shallowest first.
fn split_existing_prefix(path: &Path) -> io::Result<(PathBuf, Vec<OsString>)> {
    let mut tail: Vec<OsString> = Vec::new();
    let mut current = path.to_path_buf();

    loop {
        match std::fs::canonicalize(&current) {
            Ok(prefix) => {
                tail.reverse();
                return Ok((prefix, tail));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                match (current.file_name(), current.parent()) {
                    (Some(name), Some(parent)) => {
                        tail.push(name.to_os_string());
                        current = parent.to_path_buf();
                    }
                    _ => return Err(err),
                }
            }
            Err(err) => return Err(err),
        }
    }
}
