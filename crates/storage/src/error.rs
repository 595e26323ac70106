//! Error types for the storage engine.

use std::io;

use thiserror::Error;

/// Storage error type covering every failure mode of the engine.
///
/// Security failures (`PathTraversal`, `OutsideRoot`) carry at most the
/// caller's own input, never the resolved absolute path.
#[derive(Debug, Error)]
pub enum StorageError {
    // Sandbox errors
    /// The path contains a parent-directory segment or a NUL byte.
    #[error("path traversal rejected: {0:?}")]
    PathTraversal(String),

    /// The path resolved to a location outside the storage root.
    #[error("path resolves outside the storage root")]
    OutsideRoot,

    // Filesystem errors
    /// The requested path does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested path is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// The requested path is a directory where a file was expected.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// A rename target is not a bare entry name.
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    /// The storage root itself cannot be deleted or renamed.
    #[error("operation not permitted on the storage root")]
    RootProtected,

    // Thumbnail errors
    /// The file is not in the image allow-list.
    #[error("not an image: {0}")]
    NotAnImage(String),

    /// The requested thumbnail dimension is unusable.
    #[error("invalid thumbnail dimension: {0}")]
    InvalidDimension(u32),

    /// The source image could not be decoded.
    #[error("image decode failed: {0}")]
    Decode(String),

    /// The thumbnail could not be encoded.
    #[error("image encode failed: {0}")]
    Encode(String),

    // Archive errors
    /// More paths were requested than the archive file limit allows.
    #[error("too many files: {count} exceeds limit of {limit}")]
    TooManyFiles {
        /// Number of requested paths.
        count: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// Adding the next entry would exceed the archive byte quota.
    #[error("archive size would reach {attempted} bytes, exceeding limit of {limit} bytes")]
    QuotaExceeded {
        /// Running total including the rejected entry.
        attempted: u64,
        /// Configured maximum.
        limit: u64,
    },

    /// An entry cannot be represented in the archive.
    #[error("archive write failed: {0}")]
    Archive(String),

    // Request lifecycle
    /// The request was cancelled by its caller.
    #[error("operation cancelled")]
    Cancelled,

    /// The request deadline passed.
    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Coarse error category an upstream layer maps onto a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Missing, or outside the sandbox. The two are deliberately merged.
    NotFound,
    /// The request itself is malformed.
    BadRequest,
    /// A count or byte quota was hit; the caller can retry with less.
    PayloadTooLarge,
    /// Cancelled or past its deadline.
    Timeout,
    /// The content could not be processed.
    Unprocessable,
    /// Anything else.
    Internal,
}

impl StorageError {
    /// Classify this error for an external caller.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::PathTraversal(_) | Self::OutsideRoot | Self::NotFound(_) => ErrorClass::NotFound,
            Self::NotADirectory(_)
            | Self::IsADirectory(_)
            | Self::InvalidName(_)
            | Self::RootProtected
            | Self::NotAnImage(_)
            | Self::InvalidDimension(_) => ErrorClass::BadRequest,
            Self::TooManyFiles { .. } | Self::QuotaExceeded { .. } => ErrorClass::PayloadTooLarge,
            Self::Cancelled | Self::DeadlineExceeded => ErrorClass::Timeout,
            Self::Decode(_) => ErrorClass::Unprocessable,
            Self::Encode(_) | Self::Archive(_) | Self::Io(_) => ErrorClass::Internal,
        }
    }

    /// Whether this error is a sandbox violation.
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::PathTraversal(_) | Self::OutsideRoot)
    }

    /// Message safe to show an external caller.
    ///
    /// Sandbox violations and missing paths produce the same text.
    pub fn public_message(&self) -> String {
        match self.class() {
            ErrorClass::NotFound => "not found".to_string(),
            ErrorClass::Internal => "internal error".to_string(),
            _ => self.to_string(),
        }
    }

    /// Map an IO error for `rel`, turning `NotFound` into the typed variant.
    pub(crate) fn from_io(rel: &str, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Self::NotFound(rel.to_string())
        } else {
            Self::Io(err)
        }
    }
}

impl From<image::ImageError> for StorageError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::IoError(e) => StorageError::Io(e),
            image::ImageError::Encoding(e) => StorageError::Encode(e.to_string()),
            other => StorageError::Decode(other.to_string()),
        }
    }
}
