//! PUT upload pipeline: staging, streaming, length verification, promotion

use super::chunking::ChunkAssembler;
use crate::context::RequestContext;
use crate::error::{DavError, DavResult, ErrorKind};
use crate::storage::{LockGuard, LockMode, StorageError};
use crate::types::{split_path, staging_path, verify_filename, FileInfo};
use axum::http::Method;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

const COPY_BUF_SIZE: usize = 64 * 1024;

/// ENOSPC raw error code on Linux and macOS.
const ENOSPC: i32 = 28;

fn write_error(e: std::io::Error) -> StorageError {
    if e.raw_os_error() == Some(ENOSPC) {
        StorageError::DiskFull
    } else {
        StorageError::Io(e)
    }
}

/// Result of copying a client stream into storage.
#[derive(Debug)]
pub(crate) struct CopyOutcome {
    pub bytes: u64,
    /// Set when the client stream failed part-way; the copy stopped there.
    pub source_error: Option<std::io::Error>,
}

/// Copy `reader` into `writer`, counting bytes and enforcing `limit`.
///
/// Read errors end the copy and are reported in the outcome so the caller
/// can run its length check; write errors are storage errors.
pub(crate) async fn stream_copy<R, W>(
    reader: &mut R,
    writer: &mut W,
    limit: u64,
) -> Result<CopyOutcome, StorageError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total: u64 = 0;
    let mut source_error = None;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                source_error = Some(e);
                break;
            }
        };
        total += n as u64;
        if total > limit {
            return Err(StorageError::TooLarge {
                size: total,
                max: limit,
            });
        }
        writer.write_all(&buf[..n]).await.map_err(write_error)?;
    }
    writer.shutdown().await.map_err(write_error)?;
    Ok(CopyOutcome {
        bytes: total,
        source_error,
    })
}

/// Compare a counted byte total with the declared length. `LOCK` requests
/// are exempt; every other method is checked.
pub(crate) fn verify_length(method: &Method, declared: Option<u64>, counted: u64) -> DavResult<()> {
    match declared {
        Some(expected) if method != "LOCK" && expected != counted => {
            Err(DavError::size_mismatch(expected, counted))
        }
        _ => Ok(()),
    }
}

/// Parse a client-declared modification time (unix seconds).
pub fn parse_mtime(value: &str) -> DavResult<DateTime<Utc>> {
    let trimmed = value.trim();
    let secs: i64 = trimmed
        .parse()
        .or_else(|_| trimmed.parse::<f64>().map(|f| f.trunc() as i64))
        .map_err(|_| {
            DavError::bad_request("X-OC-MTime header must be an integer (unix timestamp).")
        })?;
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| DavError::bad_request("X-OC-MTime header is out of range."))
}

/// One client write operation, from PUT entry to promotion.
pub struct PutRequest<R> {
    /// Normalized logical target (for chunked uploads: the chunk's path)
    pub path: String,
    pub body: R,
    pub method: Method,
    /// Declared byte count of this request's body
    pub expected_length: Option<u64>,
    /// Declared size of the whole logical file (chunked transfers)
    pub total_length: Option<u64>,
    pub chunked: bool,
    pub mtime: Option<DateTime<Utc>>,
}

impl<R> PutRequest<R> {
    pub fn new(path: impl Into<String>, body: R) -> Self {
        Self {
            path: path.into(),
            body,
            method: Method::PUT,
            expected_length: None,
            total_length: None,
            chunked: false,
            mtime: None,
        }
    }

    pub fn with_expected_length(mut self, length: u64) -> Self {
        self.expected_length = Some(length);
        self
    }

    pub fn chunked(mut self) -> Self {
        self.chunked = true;
        self
    }

    pub fn with_mtime(mut self, mtime: DateTime<Utc>) -> Self {
        self.mtime = Some(mtime);
        self
    }
}

/// Outcome of a successful PUT.
#[derive(Debug, Clone)]
pub struct PutOutcome {
    /// Quoted entity tag; `None` while a chunked transfer is incomplete
    pub etag: Option<String>,
    /// True when the target did not exist before
    pub created: bool,
    /// True when the client's modification time was applied
    pub mtime_accepted: bool,
    pub bytes_written: u64,
    pub info: Option<FileInfo>,
}

impl PutOutcome {
    pub(crate) fn incomplete_chunk(bytes_written: u64) -> Self {
        Self {
            etag: None,
            created: true,
            mtime_accepted: false,
            bytes_written,
            info: None,
        }
    }
}

/// State of one single-shot upload while it is in flight.
#[derive(Debug)]
pub struct UploadTransfer {
    pub target_path: String,
    pub staging_path: Option<String>,
    pub declared_length: Option<u64>,
    pub bytes_written: u64,
    pub existed_before: bool,
}

impl UploadTransfer {
    /// Path the bytes are streamed into
    pub fn write_path(&self) -> &str {
        self.staging_path.as_deref().unwrap_or(&self.target_path)
    }
}

/// Storage-level exclusive lock held around the write critical section.
enum WriteLock<'a> {
    /// The request's protocol lock, temporarily switched to exclusive
    Upgraded(&'a mut LockGuard),
    Owned(#[allow(dead_code)] LockGuard),
}

impl Drop for WriteLock<'_> {
    fn drop(&mut self) {
        if let WriteLock::Upgraded(guard) = self {
            if let Err(e) = guard.change(LockMode::Shared) {
                warn!("Could not return {} to a shared lock: {}", guard.key(), e);
            }
        }
    }
}

fn acquire_write_lock<'a>(
    ctx: &RequestContext,
    path: &str,
    held: Option<&'a mut LockGuard>,
) -> DavResult<WriteLock<'a>> {
    match held {
        Some(guard) => {
            guard.change(LockMode::Exclusive)?;
            Ok(WriteLock::Upgraded(guard))
        }
        None => Ok(WriteLock::Owned(
            ctx.locks.acquire(&ctx.lock_key(path), LockMode::Exclusive)?,
        )),
    }
}

/// Turns an incoming byte stream into a durable file.
pub struct UploadPipeline<'a> {
    ctx: &'a RequestContext,
}

impl<'a> UploadPipeline<'a> {
    pub fn new(ctx: &'a RequestContext) -> Self {
        Self { ctx }
    }

    /// Handle one PUT. `held` is the protocol-level shared lock taken by
    /// the lock coordinator, if the target already existed.
    #[instrument(skip(self, req, held), fields(user = %self.ctx.user, path = %req.path))]
    pub async fn put<R>(
        &self,
        mut req: PutRequest<R>,
        held: Option<&mut LockGuard>,
    ) -> DavResult<PutOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        let view = &self.ctx.view;
        let existing = view.file_info(&req.path).await?;

        if let Some(info) = &existing {
            if info.is_dir {
                return Err(DavError::new(
                    ErrorKind::MethodNotAllowed,
                    "PUT is not allowed on a collection",
                ));
            }
            if !info.is_updatable() {
                return Err(DavError::forbidden(format!(
                    "No permission to update {}",
                    req.path
                )));
            }
        }

        let (parent, name) = split_path(&req.path);
        verify_filename(&name).map_err(|e| DavError::new(ErrorKind::InvalidPath, e.message()))?;
        if !view.is_dir(&parent).await {
            return Err(DavError::new(
                ErrorKind::Conflict,
                format!("Parent collection {} does not exist", parent),
            ));
        }

        if let Some(declared) = req.expected_length {
            if declared > self.ctx.max_upload_size {
                return Err(StorageError::TooLarge {
                    size: declared,
                    max: self.ctx.max_upload_size,
                }
                .into());
            }
        }

        if req.chunked {
            let assembler = ChunkAssembler::for_path(self.ctx, &req.path)?;
            return assembler.put_chunk(req).await;
        }

        let mut transfer = UploadTransfer {
            target_path: req.path.clone(),
            staging_path: view
                .needs_staging(&req.path)
                .then(|| staging_path(&req.path, &rand::random::<u32>().to_string())),
            declared_length: req.expected_length,
            bytes_written: 0,
            existed_before: existing.is_some(),
        };

        let write_lock = acquire_write_lock(self.ctx, &req.path, held)?;
        let result = self.write_and_promote(&mut req, &mut transfer).await;
        drop(write_lock);
        result?;

        info!(
            "Stored {} ({} bytes, {})",
            transfer.target_path,
            transfer.bytes_written,
            if transfer.existed_before { "updated" } else { "created" }
        );

        self.ctx
            .events
            .emit_write(&self.ctx.user, &transfer.target_path, transfer.existed_before);
        view.scan(&transfer.target_path).await?;
        view.mark_dirty(&parent);

        let mut mtime_accepted = false;
        if let Some(mtime) = req.mtime {
            mtime_accepted = view.touch(&transfer.target_path, mtime).await?;
        }

        let info = view.scan(&transfer.target_path).await?.ok_or_else(|| {
            DavError::new(
                ErrorKind::PromotionFailed,
                format!("{} vanished after upload", transfer.target_path),
            )
        })?;

        Ok(PutOutcome {
            etag: Some(info.quoted_etag()),
            created: !transfer.existed_before,
            mtime_accepted,
            bytes_written: transfer.bytes_written,
            info: Some(info),
        })
    }

    /// Steps run under the storage-level write lock. On failure every
    /// artifact this call created is removed before the error is returned.
    async fn write_and_promote<R>(
        &self,
        req: &mut PutRequest<R>,
        transfer: &mut UploadTransfer,
    ) -> DavResult<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let view = &self.ctx.view;
        let write_path = transfer.write_path().to_string();

        let mut handle = view.open_write(&write_path).await?;
        debug!("Streaming upload into {}", write_path);

        let copied = stream_copy(&mut req.body, &mut handle, self.ctx.max_upload_size).await;
        drop(handle);

        let checked = copied.map_err(DavError::from).and_then(|outcome| {
            transfer.bytes_written = outcome.bytes;
            verify_length(&req.method, transfer.declared_length, outcome.bytes)?;
            match outcome.source_error {
                Some(e) => Err(DavError::bad_request(format!(
                    "Client stream interrupted after {} bytes: {}",
                    outcome.bytes, e
                ))),
                None => Ok(()),
            }
        });
        if let Err(e) = checked {
            view.unlink(&write_path).await;
            debug!("Removed {} after failed write: {}", write_path, e);
            return Err(e);
        }

        if let Some(staging) = transfer.staging_path.as_deref() {
            let renamed = match view.rename(staging, &transfer.target_path).await {
                Ok(r) => r,
                Err(e) => {
                    view.unlink(staging).await;
                    return Err(e.into());
                }
            };
            let exists = view.exists(&transfer.target_path).await;
            if !renamed || !exists {
                view.unlink(staging).await;
                warn!(
                    "Promotion of {} to {} failed (renamed={}, exists={})",
                    staging, transfer.target_path, renamed, exists
                );
                return Err(DavError::new(
                    ErrorKind::PromotionFailed,
                    "Could not rename part file to final file",
                ));
            }
        }
        Ok(())
    }
}
