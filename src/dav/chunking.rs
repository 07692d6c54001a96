//! Chunked transfers: per-chunk storage, completion tracking and assembly
//!
//! Chunks live outside the user's namespace, in `RequestContext::upload_dir`,
//! keyed by `ChunkName::key_for`. A chunk only becomes visible under its key
//! once it has been fully received and length-checked, so completion checks
//! never see a partial chunk.

use super::upload::{stream_copy, verify_length, PutOutcome, PutRequest};
use crate::context::RequestContext;
use crate::error::{DavError, DavResult, ErrorKind};
use crate::storage::{LockMode, StorageError};
use crate::types::{join_path, split_path, verify_filename, ChunkName, FileInfo};
use axum::http::Method;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

/// Stores and assembles the chunks of one transfer.
pub struct ChunkAssembler<'a> {
    ctx: &'a RequestContext,
    chunk: ChunkName,
    /// Logical path of the assembled file
    target: String,
}

impl<'a> ChunkAssembler<'a> {
    pub fn new(ctx: &'a RequestContext, chunk: ChunkName, parent: &str) -> Self {
        let target = join_path(parent, &chunk.name);
        Self { ctx, chunk, target }
    }

    /// Build an assembler from the path a chunk was PUT to.
    pub fn for_path(ctx: &'a RequestContext, path: &str) -> DavResult<Self> {
        let (parent, leaf) = split_path(path);
        let chunk = ChunkName::parse(&leaf)
            .ok_or_else(|| DavError::new(ErrorKind::NotImplemented, "Invalid chunk name"))?;
        verify_filename(&chunk.name)
            .map_err(|e| DavError::new(ErrorKind::InvalidPath, e.message()))?;
        Ok(Self::new(ctx, chunk, &parent))
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn chunk_file(&self, index: u32) -> PathBuf {
        self.ctx.upload_dir.join(self.chunk.key_for(index))
    }

    /// Index -> size of every chunk of this transfer currently stored, from
    /// one listing of the upload directory.
    async fn stored_chunks(&self) -> BTreeMap<u32, u64> {
        let mut stored = BTreeMap::new();
        let mut entries = match fs::read_dir(&self.ctx.upload_dir).await {
            Ok(e) => e,
            Err(_) => return stored,
        };
        let prefix = self.chunk.prefix();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Listing {:?} failed: {}", self.ctx.upload_dir, e);
                    break;
                }
            };
            let name = entry.file_name();
            let index = name
                .to_str()
                .and_then(|n| n.strip_prefix(prefix.as_str()))
                .and_then(|rest| rest.parse::<u32>().ok())
                .filter(|i| *i < self.chunk.chunk_count);
            let Some(index) = index else { continue };
            if let Ok(meta) = entry.metadata().await {
                if meta.is_file() {
                    stored.insert(index, meta.len());
                }
            }
        }
        stored
    }

    async fn discard_tmp(&self, tmp: &Path) {
        if let Err(e) = fs::remove_file(tmp).await {
            warn!("Failed to remove partial chunk {:?}: {}", tmp, e);
        }
    }

    /// Receive one chunk. Nothing is kept if the copy fails or the byte count
    /// disagrees with `declared`.
    pub async fn store_chunk<R>(
        &self,
        index: u32,
        data: &mut R,
        method: &Method,
        declared: Option<u64>,
    ) -> DavResult<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        fs::create_dir_all(&self.ctx.upload_dir)
            .await
            .map_err(StorageError::from)?;

        let others: u64 = self
            .stored_chunks()
            .await
            .iter()
            .filter(|(i, _)| **i != index)
            .map(|(_, size)| *size)
            .sum();
        let limit = self.ctx.max_upload_size.saturating_sub(others);

        let key = self.chunk.key_for(index);
        let tmp = self
            .ctx
            .upload_dir
            .join(format!("{}.{}.part", key, rand::random::<u32>()));
        let mut file = fs::File::create(&tmp).await.map_err(StorageError::from)?;
        let copied = stream_copy(data, &mut file, limit).await;
        drop(file);

        let checked = copied.map_err(DavError::from).and_then(|outcome| {
            verify_length(method, declared, outcome.bytes)?;
            match outcome.source_error {
                Some(e) => Err(DavError::bad_request(format!(
                    "Client stream interrupted after {} bytes: {}",
                    outcome.bytes, e
                ))),
                None => Ok(outcome.bytes),
            }
        });
        let bytes = match checked {
            Ok(bytes) => bytes,
            Err(e) => {
                self.discard_tmp(&tmp).await;
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&tmp, self.chunk_file(index)).await {
            self.discard_tmp(&tmp).await;
            return Err(StorageError::from(e).into());
        }
        debug!("Stored chunk {} ({} bytes)", key, bytes);
        Ok(bytes)
    }

    /// True once every index in `[0, chunk_count)` is present.
    pub async fn is_complete(&self) -> bool {
        self.stored_chunks().await.len() as u64 == u64::from(self.chunk.chunk_count)
    }

    /// Total bytes already received for this transfer.
    pub async fn current_size(&self) -> u64 {
        self.stored_chunks().await.values().sum()
    }

    pub async fn remove(&self, index: u32) {
        if let Err(e) = fs::remove_file(self.chunk_file(index)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove chunk {}: {}", self.chunk.key_for(index), e);
            }
        }
    }

    /// Remove every stored chunk of this transfer.
    pub async fn cleanup(&self) {
        for i in self.stored_chunks().await.into_keys() {
            self.remove(i).await;
        }
    }

    /// Remove chunk files in `dir` older than `ttl`. Returns the count removed.
    pub async fn sweep_expired(dir: &Path, ttl: Duration) -> Result<usize, StorageError> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let meta = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age >= ttl && fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {} expired chunks from {:?}", removed, dir);
        }
        Ok(removed)
    }

    /// Concatenate chunks in index order into `path` through the view.
    async fn write_chunks_to(&self, path: &str) -> DavResult<()> {
        let mut handle = self.ctx.view.open_write(path).await?;
        for i in 0..self.chunk.chunk_count {
            let mut chunk = fs::File::open(self.chunk_file(i)).await.map_err(|e| {
                DavError::new(
                    ErrorKind::Internal,
                    format!("Chunk {} is missing: {}", self.chunk.key_for(i), e),
                )
            })?;
            tokio::io::copy(&mut chunk, &mut handle)
                .await
                .map_err(StorageError::from)?;
        }
        handle.shutdown().await.map_err(StorageError::from)?;
        Ok(())
    }

    /// Assemble the complete transfer into its target. Chunks are removed
    /// afterwards whether or not assembly succeeded.
    #[instrument(skip(self), fields(target = %self.target))]
    pub async fn assemble(&self, mtime: Option<DateTime<Utc>>) -> DavResult<(FileInfo, bool)> {
        let result = self.assemble_into_target(mtime).await;
        self.cleanup().await;
        result
    }

    async fn assemble_into_target(
        &self,
        mtime: Option<DateTime<Utc>>,
    ) -> DavResult<(FileInfo, bool)> {
        let view = &self.ctx.view;
        let (parent, _) = split_path(&self.target);

        if view.needs_staging(&self.target) {
            let part = join_path(&parent, &self.chunk.staging_name());
            if let Err(e) = self.write_chunks_to(&part).await {
                view.unlink(&part).await;
                return Err(e);
            }
            let renamed = match view.rename(&part, &self.target).await {
                Ok(r) => r,
                Err(e) => {
                    view.unlink(&part).await;
                    return Err(e.into());
                }
            };
            let exists = view.exists(&self.target).await;
            if !renamed || !exists {
                if exists {
                    view.unlink(&self.target).await;
                }
                view.unlink(&part).await;
                return Err(DavError::new(
                    ErrorKind::PromotionFailed,
                    "Could not rename part file assembled from chunks",
                ));
            }
        } else if let Err(e) = self.write_chunks_to(&self.target).await {
            view.unlink(&self.target).await;
            return Err(e);
        }

        view.mark_dirty(&parent);
        let mut mtime_accepted = false;
        if let Some(mtime) = mtime {
            mtime_accepted = view.touch(&self.target, mtime).await?;
        }
        let info = view.scan(&self.target).await?.ok_or_else(|| {
            DavError::new(
                ErrorKind::PromotionFailed,
                format!("{} vanished after assembly", self.target),
            )
        })?;
        Ok((info, mtime_accepted))
    }

    /// Handle a PUT of one chunk. Returns an outcome without ETag until the
    /// final chunk arrives.
    pub(crate) async fn put_chunk<R>(&self, mut req: PutRequest<R>) -> DavResult<PutOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        if let Err(e) = Self::sweep_expired(&self.ctx.upload_dir, self.ctx.chunk_ttl).await {
            warn!("Chunk sweep failed: {}", e);
        }

        let bytes = self
            .store_chunk(self.chunk.index, &mut req.body, &req.method, req.expected_length)
            .await?;

        if !self.is_complete().await {
            debug!(
                "Transfer {} has chunk {} of {}",
                self.chunk.transfer_id,
                self.chunk.index + 1,
                self.chunk.chunk_count
            );
            return Ok(PutOutcome::incomplete_chunk(bytes));
        }

        let view = &self.ctx.view;
        let existing = view.file_info(&self.target).await?;
        if let Some(info) = &existing {
            if info.is_dir {
                self.cleanup().await;
                return Err(DavError::new(
                    ErrorKind::MethodNotAllowed,
                    "PUT is not allowed on a collection",
                ));
            }
            if !info.is_updatable() {
                self.cleanup().await;
                return Err(DavError::forbidden(format!(
                    "No permission to update {}",
                    self.target
                )));
            }
        }

        // chunks are kept on conflict so the client can retry the last one
        let lock = self
            .ctx
            .locks
            .acquire(&self.ctx.lock_key(&self.target), LockMode::Exclusive)?;
        let (info, mtime_accepted) = self.assemble(req.mtime).await?;
        drop(lock);

        info!(
            "Assembled {} from {} chunks ({} bytes)",
            self.target, self.chunk.chunk_count, info.size
        );
        self.ctx
            .events
            .emit_write(&self.ctx.user, &self.target, existing.is_some());

        Ok(PutOutcome {
            etag: Some(info.quoted_etag()),
            created: existing.is_none(),
            mtime_accepted,
            bytes_written: bytes,
            info: Some(info),
        })
    }
}
