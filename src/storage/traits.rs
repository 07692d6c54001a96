//! Storage backend trait definitions

use crate::types::{FileInfo, FreeSpace};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not permitted: {0}")]
    NotPermitted(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Insufficient storage")]
    DiskFull,

    #[error("Entity too large: {size} bytes (max: {max} bytes)")]
    TooLarge { size: u64, max: u64 },

    #[error("Invalid content: {0}")]
    InvalidContent(String),

    #[error("Locked: {0}")]
    Locked(String),

    #[error("Encryption not ready: {0}")]
    EncryptionNotReady(String),

    #[error("Storage not available: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Other(String),
}

/// Writable stream returned by `FilesystemView::open_write`.
pub type WriteHandle = Box<dyn AsyncWrite + Send + Unpin>;

/// Readable stream returned by `FilesystemView::open_read`.
pub type ReadHandle = Box<dyn AsyncRead + Send + Unpin>;

/// Path-scoped view of one user's file namespace.
///
/// Paths are logical, normalized (`/dir/file`) and relative to the user's
/// root. Boolean results mirror the storage layer's "did it work" answer;
/// errors are reserved for causes the caller must translate.
///
/// This trait is object-safe and is used as `Arc<dyn FilesystemView>`.
#[async_trait]
pub trait FilesystemView: Send + Sync {
    /// Check if a path exists
    async fn exists(&self, path: &str) -> bool;

    /// Check if a path exists and is a directory
    async fn is_dir(&self, path: &str) -> bool;

    /// Open a file for writing, truncating or creating it
    async fn open_write(&self, path: &str) -> Result<WriteHandle, StorageError>;

    /// Open a file for reading
    async fn open_read(&self, path: &str) -> Result<ReadHandle, StorageError>;

    /// Rename a file or directory, replacing an existing destination file
    async fn rename(&self, from: &str, to: &str) -> Result<bool, StorageError>;

    /// Delete a file or a directory tree
    async fn unlink(&self, path: &str) -> bool;

    /// Set the modification time of a node
    async fn touch(&self, path: &str, mtime: DateTime<Utc>) -> Result<bool, StorageError>;

    /// Create a single directory
    async fn mkdir(&self, path: &str) -> Result<bool, StorageError>;

    /// List the leaf names of a directory's direct children
    async fn read_dir(&self, path: &str) -> Result<Vec<String>, StorageError>;

    /// Copy a single file's content
    async fn copy_file(&self, from: &str, to: &str) -> Result<bool, StorageError>;

    /// Remaining space available below `path`
    async fn free_space(&self, path: &str) -> FreeSpace;

    /// Whether writes to `path` must go through a staging file first.
    /// Backends that are already transactional return `false`.
    fn needs_staging(&self, path: &str) -> bool;

    /// Metadata of a node, possibly served from cache
    async fn file_info(&self, path: &str) -> Result<Option<FileInfo>, StorageError>;

    /// Re-read a node's metadata from storage and refresh the cache
    async fn scan(&self, path: &str) -> Result<Option<FileInfo>, StorageError>;

    /// Drop cached metadata for `path`; the next lookup re-reads storage
    fn mark_dirty(&self, path: &str);
}
