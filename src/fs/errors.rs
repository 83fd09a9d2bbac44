use crate::path::PathError;
use crate::shuffle::ReconcileError;
use crate::store::StoreError;
use thiserror::Error;

/// Conditions reported to the protocol layer. Each maps to a distinct CIFS
/// status.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("file not found")]
    FileNotFound,

    /// A parent component of the path does not exist.
    #[error("path not found")]
    PathNotFound,

    /// A parent component of the path is a file.
    #[error("not a directory")]
    NotADirectory,

    #[error("file exists")]
    FileExists,

    #[error("access denied")]
    AccessDenied,

    #[error("directory not empty")]
    DirectoryNotEmpty,

    #[error("invalid file handle")]
    InvalidHandle,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("name too long")]
    NameTooLong,

    /// A write or truncate would grow the buffer past `MAX_FILE_SIZE`.
    #[error("file too large")]
    FileTooLarge,

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<PathError> for FsError {
    fn from(err: PathError) -> Self {
        match err {
            PathError::InvalidComponent(_) => FsError::InvalidArgument,
            PathError::NameTooLong(_) => FsError::NameTooLong,
        }
    }
}

impl From<StoreError> for FsError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NodeNotFound(_) => FsError::FileNotFound,
            StoreError::NameExists(_) => FsError::FileExists,
            StoreError::ParentNotFolder(_) => FsError::NotADirectory,
            StoreError::AccessDenied(_) => FsError::AccessDenied,
            StoreError::NotArchived(_) | StoreError::Unavailable(_) => FsError::Io(err.to_string()),
        }
    }
}

impl From<ReconcileError> for FsError {
    fn from(err: ReconcileError) -> Self {
        FsError::Io(err.to_string())
    }
}
