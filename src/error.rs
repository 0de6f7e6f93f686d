use thiserror::Error;

pub type Result<T> = std::result::Result<T, PinionError>;

/// Error taxonomy exposed by the filesystem layer.
///
/// A path that resolves outside a server root surfaces as
/// [`PinionError::NotFound`], the same variant a genuinely missing file
/// produces. Callers learn nothing about the host layout from the error.
#[derive(Error, Debug)]
pub enum PinionError {
    #[error("file does not exist")]
    NotFound,

    #[error("filesystem path is a directory")]
    IsDirectory,

    #[error("file or directory already exists")]
    AlreadyExists,

    #[error("not enough disk space is available: requested {requested} bytes with {available} bytes free")]
    NotEnoughDiskSpace { requested: i64, available: i64 },

    #[error("cannot delete root server directory")]
    CannotDeleteRoot,

    #[error("IO error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for PinionError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists,
            _ => Self::Io(err),
        }
    }
}

impl PinionError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}
