//! WebDAV file semantics: uploads, chunked transfers, quota, locking and tree operations
//!
//! Everything here works on logical paths through a `RequestContext`; the
//! HTTP layer in `api` only parses requests and renders responses.

pub mod chunking;
pub mod locking;
pub mod quota;
pub mod service;
pub mod tree;
pub mod upload;

pub use chunking::ChunkAssembler;
pub use locking::LockCoordinator;
pub use quota::QuotaGate;
pub use service::{DavService, ServiceOptions};
pub use tree::ObjectTree;
pub use upload::{parse_mtime, PutOutcome, PutRequest, UploadPipeline, UploadTransfer};

#[cfg(test)]
pub(crate) mod test_support {
    use crate::context::RequestContext;
    use crate::events::EventBus;
    use crate::storage::{
        FilesystemView, LocalView, LockProvider, ReadHandle, StorageError, ViewOptions,
        WriteHandle,
    };
    use crate::types::{FileInfo, FreeSpace};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    pub async fn test_context() -> (TempDir, RequestContext) {
        test_context_with(ViewOptions::default()).await
    }

    pub async fn test_context_with(options: ViewOptions) -> (TempDir, RequestContext) {
        let dir = TempDir::new().unwrap();
        let user_dir = dir.path().join("alice");
        let view = LocalView::new(user_dir.join("files"), options).await.unwrap();
        let ctx = RequestContext::new(
            "alice",
            Arc::new(view),
            LockProvider::new(),
            EventBus::new(),
            user_dir.join("uploads"),
        );
        (dir, ctx)
    }

    pub async fn read_file(ctx: &RequestContext, path: &str) -> Vec<u8> {
        let mut handle = ctx.view.open_read(path).await.unwrap();
        let mut buf = Vec::new();
        handle.read_to_end(&mut buf).await.unwrap();
        buf
    }

    pub async fn write_file(ctx: &RequestContext, path: &str, data: &[u8]) {
        use tokio::io::AsyncWriteExt;
        let mut handle = ctx.view.open_write(path).await.unwrap();
        handle.write_all(data).await.unwrap();
        handle.shutdown().await.unwrap();
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Fault {
        Nothing,
        RenameReturnsFalse,
        OpenUnavailable,
        OpenEncryptionNotReady,
        OpenInvalidContent,
        OpenDiskFull,
        OpenNotPermitted,
        OpenLocked,
    }

    /// Wraps a real view and injects one failure.
    pub struct FaultyView {
        inner: Arc<dyn FilesystemView>,
        fault: Fault,
        staging: bool,
        free: Option<FreeSpace>,
        renames: AtomicUsize,
    }

    impl FaultyView {
        pub fn new(inner: Arc<dyn FilesystemView>) -> Self {
            Self {
                inner,
                fault: Fault::Nothing,
                staging: true,
                free: None,
                renames: AtomicUsize::new(0),
            }
        }

        pub fn with_fault(mut self, fault: Fault) -> Self {
            self.fault = fault;
            self
        }

        pub fn without_staging(mut self) -> Self {
            self.staging = false;
            self
        }

        pub fn with_free_space(mut self, free: FreeSpace) -> Self {
            self.free = Some(free);
            self
        }

        pub fn renames(&self) -> usize {
            self.renames.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FilesystemView for FaultyView {
        async fn exists(&self, path: &str) -> bool {
            self.inner.exists(path).await
        }

        async fn is_dir(&self, path: &str) -> bool {
            self.inner.is_dir(path).await
        }

        async fn open_write(&self, path: &str) -> Result<WriteHandle, StorageError> {
            let p = path.to_string();
            match self.fault {
                Fault::OpenUnavailable => Err(StorageError::Unavailable(p)),
                Fault::OpenEncryptionNotReady => Err(StorageError::EncryptionNotReady(p)),
                Fault::OpenInvalidContent => Err(StorageError::InvalidContent(p)),
                Fault::OpenDiskFull => Err(StorageError::DiskFull),
                Fault::OpenNotPermitted => Err(StorageError::NotPermitted(p)),
                Fault::OpenLocked => Err(StorageError::Locked(p)),
                _ => self.inner.open_write(path).await,
            }
        }

        async fn open_read(&self, path: &str) -> Result<ReadHandle, StorageError> {
            self.inner.open_read(path).await
        }

        async fn rename(&self, from: &str, to: &str) -> Result<bool, StorageError> {
            self.renames.fetch_add(1, Ordering::SeqCst);
            if self.fault == Fault::RenameReturnsFalse {
                return Ok(false);
            }
            self.inner.rename(from, to).await
        }

        async fn unlink(&self, path: &str) -> bool {
            self.inner.unlink(path).await
        }

        async fn touch(&self, path: &str, mtime: DateTime<Utc>) -> Result<bool, StorageError> {
            self.inner.touch(path, mtime).await
        }

        async fn mkdir(&self, path: &str) -> Result<bool, StorageError> {
            self.inner.mkdir(path).await
        }

        async fn read_dir(&self, path: &str) -> Result<Vec<String>, StorageError> {
            self.inner.read_dir(path).await
        }

        async fn copy_file(&self, from: &str, to: &str) -> Result<bool, StorageError> {
            self.inner.copy_file(from, to).await
        }

        async fn free_space(&self, path: &str) -> FreeSpace {
            match self.free {
                Some(free) => free,
                None => self.inner.free_space(path).await,
            }
        }

        fn needs_staging(&self, _path: &str) -> bool {
            self.staging
        }

        async fn file_info(&self, path: &str) -> Result<Option<FileInfo>, StorageError> {
            self.inner.file_info(path).await
        }

        async fn scan(&self, path: &str) -> Result<Option<FileInfo>, StorageError> {
            self.inner.scan(path).await
        }

        fn mark_dirty(&self, path: &str) {
            self.inner.mark_dirty(path)
        }
    }
}
