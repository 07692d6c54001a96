//! Entry point used by the HTTP layer: per-user views and method orchestration

use super::chunking::ChunkAssembler;
use super::locking::LockCoordinator;
use super::quota::QuotaGate;
use super::tree::ObjectTree;
use super::upload::{PutOutcome, PutRequest, UploadPipeline};
use crate::context::{RequestContext, DEFAULT_CHUNK_TTL, DEFAULT_MAX_UPLOAD_SIZE};
use crate::error::{DavError, DavResult, ErrorKind};
use crate::events::EventBus;
use crate::storage::{FilesystemView, LocalView, LockProvider, ReadHandle, StorageError, ViewOptions};
use crate::types::{verify_filename, FileInfo};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tracing::{debug, info, instrument, warn};

/// Settings the service needs, derived from `Config`.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub data_dir: PathBuf,
    pub view: ViewOptions,
    pub max_upload_size: u64,
    pub chunk_ttl: Duration,
}

impl ServiceOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            view: ViewOptions::default(),
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
            chunk_ttl: DEFAULT_CHUNK_TTL,
        }
    }
}

/// Totals from a startup sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub staging_files: usize,
    pub expired_chunks: usize,
}

/// Shared state behind every request: one `LocalView` per user, the lock
/// table and the event bus.
pub struct DavService {
    options: ServiceOptions,
    views: DashMap<String, Arc<LocalView>>,
    locks: Arc<LockProvider>,
    events: Arc<EventBus>,
}

impl DavService {
    pub fn new(options: ServiceOptions) -> Self {
        Self {
            options,
            views: DashMap::new(),
            locks: LockProvider::new(),
            events: EventBus::new(),
        }
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn locks(&self) -> &Arc<LockProvider> {
        &self.locks
    }

    /// Remove staging files left by a previous run and chunks past their TTL.
    pub async fn startup_sweep(&self) -> Result<SweepReport, StorageError> {
        let mut report = SweepReport::default();
        let mut users = match tokio::fs::read_dir(&self.options.data_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = users.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let user_dir = entry.path();
            report.staging_files +=
                LocalView::sweep_staging_files(&user_dir.join("files"), Duration::ZERO).await?;
            report.expired_chunks +=
                ChunkAssembler::sweep_expired(&user_dir.join("uploads"), self.options.chunk_ttl)
                    .await?;
        }
        info!(
            "Startup sweep removed {} staging files and {} expired chunks",
            report.staging_files, report.expired_chunks
        );
        Ok(report)
    }

    async fn view_for(&self, user: &str) -> DavResult<Arc<LocalView>> {
        if let Some(view) = self.views.get(user) {
            return Ok(view.clone());
        }
        let root = self.options.data_dir.join(user).join("files");
        let view = Arc::new(LocalView::new(root, self.options.view.clone()).await?);
        debug!("Opened view for user {}", user);
        Ok(self
            .views
            .entry(user.to_string())
            .or_insert(view)
            .clone())
    }

    /// Build the context for one request by `user`.
    pub async fn context(&self, user: &str) -> DavResult<RequestContext> {
        verify_filename(user).map_err(|e| {
            DavError::new(ErrorKind::InvalidPath, format!("Invalid user: {}", e.message()))
        })?;
        let view = self.view_for(user).await?;
        Ok(RequestContext::new(
            user,
            view,
            Arc::clone(&self.locks),
            Arc::clone(&self.events),
            self.options.data_dir.join(user).join("uploads"),
        )
        .with_limits(self.options.max_upload_size, self.options.chunk_ttl))
    }

    /// PUT: protocol lock, quota gate, then the upload pipeline.
    #[instrument(skip(self, ctx, req), fields(request_id = %ctx.request_id, path = %req.path))]
    pub async fn put<R>(&self, ctx: &RequestContext, req: PutRequest<R>) -> DavResult<PutOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut lock = LockCoordinator::new(ctx)
            .before_method(&req.method, &req.path)
            .await?;
        QuotaGate::new(ctx)
            .check(&req.path, req.expected_length, req.total_length, req.chunked)
            .await?;
        let result = UploadPipeline::new(ctx).put(req, lock.as_mut()).await;
        drop(lock);
        if let Err(e) = &result {
            warn!("PUT failed: {}", e);
        }
        result
    }

    pub async fn stat(&self, ctx: &RequestContext, path: &str) -> DavResult<FileInfo> {
        ctx.view
            .file_info(path)
            .await?
            .ok_or_else(|| DavError::not_found(path))
    }

    /// Open a file for download.
    pub async fn get(&self, ctx: &RequestContext, path: &str) -> DavResult<(FileInfo, ReadHandle)> {
        let info = self.stat(ctx, path).await?;
        if info.is_dir {
            return Err(DavError::new(
                ErrorKind::MethodNotAllowed,
                "GET is not supported on a collection",
            ));
        }
        let handle = ctx.view.open_read(path).await?;
        Ok((info, handle))
    }

    pub async fn delete(&self, ctx: &RequestContext, path: &str) -> DavResult<()> {
        ObjectTree::new(ctx).delete_node(path).await
    }

    pub async fn mkcol(&self, ctx: &RequestContext, path: &str) -> DavResult<()> {
        ObjectTree::new(ctx).make_collection(path).await
    }

    pub async fn move_node(
        &self,
        ctx: &RequestContext,
        src: &str,
        dst: &str,
        overwrite: bool,
    ) -> DavResult<bool> {
        ObjectTree::new(ctx).move_node(src, dst, overwrite).await
    }

    pub async fn copy_node(
        &self,
        ctx: &RequestContext,
        src: &str,
        dst: &str,
        overwrite: bool,
    ) -> DavResult<bool> {
        ObjectTree::new(ctx).copy_node(src, dst, overwrite).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dav::test_support::read_file;
    use crate::storage::LockMode;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> DavService {
        DavService::new(ServiceOptions::new(dir.path()))
    }

    #[tokio::test]
    async fn test_context_rejects_bad_user() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        assert!(svc.context("..").await.is_err());
        assert!(svc.context("a/b").await.is_err());
        let ctx = svc.context("bob").await.unwrap();
        assert_eq!(ctx.user, "bob");
        assert!(dir.path().join("bob/files").is_dir());
    }

    #[tokio::test]
    async fn test_users_are_isolated() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let alice = svc.context("alice").await.unwrap();
        let bob = svc.context("bob").await.unwrap();
        svc.put(&alice, PutRequest::new("/a.txt", &b"alice"[..]))
            .await
            .unwrap();
        assert!(!bob.view.exists("/a.txt").await);
        assert_eq!(read_file(&alice, "/a.txt").await, b"alice");
    }

    #[tokio::test]
    async fn test_quota_rejection_happens_before_write() {
        let dir = TempDir::new().unwrap();
        let mut options = ServiceOptions::new(dir.path());
        options.view.quota_bytes = Some(10);
        let svc = DavService::new(options);
        let ctx = svc.context("alice").await.unwrap();
        let err = svc
            .put(
                &ctx,
                PutRequest::new("/big.bin", &[0u8; 11][..]).with_expected_length(11),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
        assert!(!ctx.view.exists("/big.bin").await);

        svc.put(
            &ctx,
            PutRequest::new("/fits.bin", &[0u8; 10][..]).with_expected_length(10),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_put_while_shared_lock_held_is_locked() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let ctx = svc.context("alice").await.unwrap();
        svc.put(&ctx, PutRequest::new("/c.txt", &b"v1"[..]))
            .await
            .unwrap();

        // first request is between its protocol lock and its write
        let _first = svc
            .locks()
            .acquire(&ctx.lock_key("/c.txt"), LockMode::Shared)
            .unwrap();
        let err = svc
            .put(&ctx, PutRequest::new("/c.txt", &b"v2"[..]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Locked);
        assert_eq!(read_file(&ctx, "/c.txt").await, b"v1");
    }

    #[tokio::test]
    async fn test_locks_released_after_put() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let ctx = svc.context("alice").await.unwrap();
        for body in [&b"1"[..], &b"2"[..]] {
            svc.put(&ctx, PutRequest::new("/r.txt", body)).await.unwrap();
        }
        assert_eq!(svc.locks().active_count(), 0);
    }

    #[tokio::test]
    async fn test_startup_sweep() {
        let dir = TempDir::new().unwrap();
        let files = dir.path().join("alice/files");
        let uploads = dir.path().join("alice/uploads");
        std::fs::create_dir_all(&files).unwrap();
        std::fs::create_dir_all(&uploads).unwrap();
        std::fs::write(files.join("a.txt.ocTransferId123.part"), b"x").unwrap();
        std::fs::write(files.join("keep.txt"), b"x").unwrap();
        std::fs::write(uploads.join("a.txt-chunking-1-2-0"), b"x").unwrap();

        let mut options = ServiceOptions::new(dir.path());
        options.chunk_ttl = Duration::ZERO;
        let report = DavService::new(options).startup_sweep().await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                staging_files: 1,
                expired_chunks: 1
            }
        );
        assert!(files.join("keep.txt").exists());
    }

    #[tokio::test]
    async fn test_get_collection_not_allowed() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let ctx = svc.context("alice").await.unwrap();
        let err = svc.get(&ctx, "/").await.map(|_| ()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MethodNotAllowed);
    }
}
