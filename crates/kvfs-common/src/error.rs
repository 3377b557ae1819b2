//! Error types for kvfs
//!
//! This module defines the common error type used throughout the system.

use thiserror::Error;

/// Common result type for kvfs operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for kvfs
#[derive(Debug, Error)]
pub enum Error {
    // Namespace errors
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Handle errors
    #[error("stale handle: {0}")]
    StaleHandle(u64),

    #[error("handle limit reached: {max} open handles")]
    HandleLimit { max: usize },

    // Storage errors
    #[error("corrupt metadata at {key}: {reason}")]
    CorruptMetadata { key: String, reason: String },

    #[error("store failure: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a not found error
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a corrupt metadata error
    pub fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptMetadata {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Get the errno an OS-call adapter should report for this error
    #[must_use]
    pub const fn errno(&self) -> i32 {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::NotEmpty(_) => libc::ENOTEMPTY,
            Self::NotADirectory(_) => libc::ENOTDIR,
            Self::IsADirectory(_) => libc::EISDIR,
            Self::InvalidArgument(_) | Self::Configuration(_) => libc::EINVAL,
            Self::StaleHandle(_) => libc::EBADF,
            Self::HandleLimit { .. } => libc::EMFILE,
            Self::CorruptMetadata { .. } | Self::Store(_) | Self::Io(_) => libc::EIO,
        }
    }
}
