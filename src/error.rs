//! Domain error type shared by the upload pipeline, chunking, quota and tree code

use crate::storage::{LockError, StorageError};
use std::fmt;
use thiserror::Error;

/// What went wrong, independent of the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Target or parent not updatable/creatable/deletable
    PermissionDenied,
    /// Filename fails validity rules
    InvalidPath,
    /// Counted bytes differ from the declared length
    SizeMismatch,
    /// Malformed request input (headers, destination)
    BadRequest,
    /// Declared length exceeds free space
    QuotaExceeded,
    /// Content rejected by a validation check
    UnsupportedContent,
    /// Entity exceeds the hard size ceiling
    TooLarge,
    /// Protocol- or storage-level lock conflict
    Locked,
    /// Transient backend failure; safe to retry
    StorageUnavailable,
    /// Rename outcome ambiguous or postcondition failed
    PromotionFailed,
    /// Malformed chunking metadata
    NotImplemented,
    NotFound,
    /// Parent collection missing or similar structural conflict
    Conflict,
    PreconditionFailed,
    MethodNotAllowed,
    Internal,
}

impl ErrorKind {
    /// Exception label used in error bodies
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::PermissionDenied => "Forbidden",
            ErrorKind::InvalidPath => "InvalidPath",
            ErrorKind::SizeMismatch => "BadRequest",
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::QuotaExceeded => "InsufficientStorage",
            ErrorKind::UnsupportedContent => "UnsupportedMediaType",
            ErrorKind::TooLarge => "EntityTooLarge",
            ErrorKind::Locked => "FileLocked",
            ErrorKind::StorageUnavailable => "ServiceUnavailable",
            ErrorKind::PromotionFailed => "Exception",
            ErrorKind::NotImplemented => "NotImplemented",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::PreconditionFailed => "PreconditionFailed",
            ErrorKind::MethodNotAllowed => "MethodNotAllowed",
            ErrorKind::Internal => "Exception",
        }
    }

    /// Whether a client may retry the same request unchanged later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Locked | ErrorKind::StorageUnavailable)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Tagged error returned by every DAV operation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct DavError {
    pub kind: ErrorKind,
    pub message: String,
}

impl DavError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn size_mismatch(expected: u64, actual: u64) -> Self {
        Self::new(
            ErrorKind::SizeMismatch,
            format!("expected filesize {} got {}", expected, actual),
        )
    }

    pub fn not_found(path: &str) -> Self {
        Self::new(ErrorKind::NotFound, format!("File not found: {}", path))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

pub type DavResult<T> = Result<T, DavError>;

impl From<StorageError> for DavError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(p) => DavError::not_found(&p),
            StorageError::AlreadyExists(p) => {
                DavError::new(ErrorKind::Conflict, format!("Already exists: {}", p))
            }
            StorageError::NotPermitted(p) => {
                DavError::forbidden(format!("Not permitted: {}", p))
            }
            StorageError::InvalidPath(msg) => DavError::new(ErrorKind::InvalidPath, msg),
            StorageError::DiskFull => {
                DavError::new(ErrorKind::QuotaExceeded, "Insufficient storage")
            }
            StorageError::TooLarge { size, max } => DavError::new(
                ErrorKind::TooLarge,
                format!("Entity of {} bytes exceeds the maximum of {} bytes", size, max),
            ),
            StorageError::InvalidContent(msg) => DavError::new(ErrorKind::UnsupportedContent, msg),
            StorageError::Locked(p) => {
                DavError::new(ErrorKind::Locked, format!("\"{}\" is locked", p))
            }
            StorageError::EncryptionNotReady(msg) => {
                DavError::new(ErrorKind::StorageUnavailable, format!("Encryption not ready: {}", msg))
            }
            StorageError::Unavailable(msg) => DavError::new(ErrorKind::StorageUnavailable, msg),
            StorageError::Io(e) => {
                DavError::new(ErrorKind::Internal, format!("Could not write file contents: {}", e))
            }
            StorageError::Other(msg) => DavError::new(ErrorKind::Internal, msg),
        }
    }
}

impl From<LockError> for DavError {
    fn from(err: LockError) -> Self {
        DavError::new(ErrorKind::Locked, err.to_string())
    }
}
