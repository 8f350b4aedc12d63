use thiserror::Error;

/// Stable error kinds surfaced by the cache.
///
/// Most internal plumbing propagates `anyhow::Error` through the `Other`
/// variant; the named variants are the ones callers are expected to match
/// on.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("object not found")]
    NotFound,

    #[error("is a file, not a directory")]
    IsFile,

    #[error("is a directory, not a file")]
    IsDir,

    #[error("directory not empty")]
    DirNotEmpty,

    #[error("can't move - not supported or upload already started")]
    CantMove,

    #[error("can't copy - not supported or upload already started")]
    CantCopy,

    #[error("can't move directory - not supported")]
    CantDirMove,

    /// All read retries exhausted while workers were still running. Shaped
    /// like an unexpected EOF so stream consumers terminate cleanly.
    #[error("unexpected EOF while waiting for chunk")]
    ChunkMiss,

    /// A chunk was requested with no worker left to fetch it.
    #[error("chunk not found in cache")]
    ChunkNotFound,

    #[error("metadata store is locked by another instance")]
    StoreBusy,

    #[error("invalid cache configuration: {0}")]
    ConfigInvalid(String),

    #[error("operation canceled")]
    Canceled,

    #[error("file handle already closed")]
    AlreadyClosed,

    #[error("operation not supported by this remote")]
    NotSupported,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound)
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => FsError::NotFound,
            _ => FsError::Other(err.into()),
        }
    }
}

impl From<FsError> for std::io::Error {
    fn from(err: FsError) -> Self {
        match err {
            FsError::NotFound => std::io::Error::new(std::io::ErrorKind::NotFound, err),
            FsError::ChunkMiss => {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, err)
            }
            FsError::Canceled => std::io::Error::new(std::io::ErrorKind::TimedOut, err),
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}
