//! Error types for keep-fuse
//!
//! `FsError` is what the FUSE handlers report; every variant maps onto one
//! errno. The collaborator errors convert into it at the handler boundary.

use thiserror::Error;

use crate::api::ApiError;
use crate::keep::KeepError;

/// Errors reported by the protocol handlers.
#[derive(Debug, Error)]
pub enum FsError {
    /// Missing inode, missing child name or unresolvable locator
    #[error("not found: {0}")]
    NotFound(String),

    /// A file operation was attempted on a directory
    #[error("inode {0} is a directory")]
    IsADirectory(u64),

    /// A directory operation was attempted on a file
    #[error("inode {0} is not a directory")]
    NotADirectory(u64),

    /// Any attempted mutation
    #[error("read-only filesystem")]
    ReadOnly,

    /// Unknown or already released file handle
    #[error("bad file handle: {0}")]
    BadHandle(u64),

    /// Storage or network failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl FsError {
    pub fn not_found(item: impl Into<String>) -> Self {
        Self::NotFound(item.into())
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }

    /// The errno reported to the kernel for this error.
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::ReadOnly => libc::EROFS,
            FsError::BadHandle(_) => libc::EBADF,
            FsError::Io(_) => libc::EIO,
        }
    }
}

impl From<KeepError> for FsError {
    fn from(err: KeepError) -> Self {
        match err {
            KeepError::NotFound(locator) => FsError::NotFound(locator),
            other => FsError::Io(other.to_string()),
        }
    }
}

impl From<ApiError> for FsError {
    fn from(err: ApiError) -> Self {
        FsError::Io(err.to_string())
    }
}
