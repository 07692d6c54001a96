//! Namespace operations: MOVE, COPY, DELETE and MKCOL

use crate::context::RequestContext;
use crate::error::{DavError, DavResult, ErrorKind};
use crate::storage::{LockGuard, LockMode};
use crate::types::{split_path, verify_filename, FileInfo};
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info, instrument};

fn is_within(path: &str, ancestor: &str) -> bool {
    ancestor == "/" || path.starts_with(&format!("{}/", ancestor))
}

/// Tree-level operations on one user's namespace.
pub struct ObjectTree<'a> {
    ctx: &'a RequestContext,
}

impl<'a> ObjectTree<'a> {
    pub fn new(ctx: &'a RequestContext) -> Self {
        Self { ctx }
    }

    fn lock(&self, path: &str, mode: LockMode) -> DavResult<LockGuard> {
        Ok(self.ctx.locks.acquire(&self.ctx.lock_key(path), mode)?)
    }

    async fn info_of(&self, path: &str) -> DavResult<FileInfo> {
        self.ctx
            .view
            .file_info(path)
            .await?
            .ok_or_else(|| DavError::not_found(path))
    }

    async fn require_parent_dir(&self, dir: &str) -> DavResult<FileInfo> {
        match self.ctx.view.file_info(dir).await? {
            Some(info) if info.is_dir => Ok(info),
            _ => Err(DavError::new(
                ErrorKind::Conflict,
                format!("Parent collection {} does not exist", dir),
            )),
        }
    }

    /// Rename `src` to `dst`. Returns whether the destination existed.
    #[instrument(skip(self), fields(user = %self.ctx.user))]
    pub async fn move_node(&self, src: &str, dst: &str, overwrite: bool) -> DavResult<bool> {
        let view = &self.ctx.view;
        if src == "/" {
            return Err(DavError::forbidden("Cannot move the root collection"));
        }
        if src == dst {
            return Err(DavError::forbidden("Source and destination are the same"));
        }
        if is_within(dst, src) {
            return Err(DavError::forbidden(format!(
                "Cannot move {} into itself",
                src
            )));
        }

        let source = self.info_of(src).await?;
        if !source.is_updatable() {
            return Err(DavError::forbidden(format!("{} is not updatable", src)));
        }
        let target = view.file_info(dst).await?;
        if source.is_dir && target.is_some() {
            return Err(DavError::forbidden(format!(
                "Could not move directory {}, target exists",
                src
            )));
        }
        if target.is_some() && !overwrite {
            return Err(DavError::new(
                ErrorKind::PreconditionFailed,
                format!("Destination {} exists and overwriting is disabled", dst),
            ));
        }

        let (src_dir, _) = split_path(src);
        let (dst_dir, dst_name) = split_path(dst);
        let dst_parent = self.require_parent_dir(&dst_dir).await?;

        if src_dir != dst_dir {
            let src_parent = self.info_of(&src_dir).await?;
            if !src_parent.is_updatable() {
                return Err(DavError::forbidden(format!("{} is not updatable", src_dir)));
            }
            if !dst_parent.is_updatable() {
                return Err(DavError::forbidden(format!("{} is not updatable", dst_dir)));
            }
            if !source.is_deletable() {
                return Err(DavError::forbidden(format!("{} is not deletable", src)));
            }
        }

        verify_filename(&dst_name).map_err(|e| DavError::new(ErrorKind::InvalidPath, e.message()))?;

        let _src_lock = self.lock(src, LockMode::Exclusive)?;
        let _dst_lock = self.lock(dst, LockMode::Exclusive)?;

        if !view.rename(src, dst).await? {
            return Err(DavError::forbidden(format!("Could not move {} to {}", src, dst)));
        }
        view.mark_dirty(&src_dir);
        view.mark_dirty(&dst_dir);
        info!("Moved {} -> {}", src, dst);
        Ok(target.is_some())
    }

    /// Recursively copy `src` to `dst`. Returns whether the destination existed.
    #[instrument(skip(self), fields(user = %self.ctx.user))]
    pub async fn copy_node(&self, src: &str, dst: &str, overwrite: bool) -> DavResult<bool> {
        let view = &self.ctx.view;
        if src == dst || is_within(dst, src) {
            return Err(DavError::forbidden(format!(
                "Cannot copy {} onto itself",
                src
            )));
        }
        let source = self.info_of(src).await?;

        let (dst_dir, dst_name) = split_path(dst);
        verify_filename(&dst_name).map_err(|e| DavError::new(ErrorKind::InvalidPath, e.message()))?;
        let dst_parent = self.require_parent_dir(&dst_dir).await?;
        if !dst_parent.is_creatable() {
            return Err(DavError::forbidden(format!(
                "Cannot create nodes in {}",
                dst_dir
            )));
        }

        let _src_lock = self.lock(src, LockMode::Shared)?;
        let _dst_lock = self.lock(dst, LockMode::Exclusive)?;

        let target = view.file_info(dst).await?;
        if let Some(existing) = &target {
            if !overwrite {
                return Err(DavError::new(
                    ErrorKind::PreconditionFailed,
                    format!("Destination {} exists and overwriting is disabled", dst),
                ));
            }
            if !existing.is_deletable() {
                return Err(DavError::forbidden(format!("{} is not deletable", dst)));
            }
            view.unlink(dst).await;
        }

        self.copy_recursive(src.to_string(), dst.to_string(), source.is_dir)
            .await?;
        view.mark_dirty(&dst_dir);
        info!("Copied {} -> {}", src, dst);
        Ok(target.is_some())
    }

    fn copy_recursive(
        &self,
        src: String,
        dst: String,
        is_dir: bool,
    ) -> Pin<Box<dyn Future<Output = DavResult<()>> + Send + '_>> {
        Box::pin(async move {
            let view = &self.ctx.view;
            if !is_dir {
                if !view.copy_file(&src, &dst).await? {
                    return Err(DavError::not_found(&src));
                }
                return Ok(());
            }
            view.mkdir(&dst).await?;
            for name in view.read_dir(&src).await? {
                if name == "." || name == ".." {
                    continue;
                }
                let child_src = crate::types::join_path(&src, &name);
                let child_dst = crate::types::join_path(&dst, &name);
                let child_is_dir = view.is_dir(&child_src).await;
                debug!("Copying {} -> {}", child_src, child_dst);
                self.copy_recursive(child_src, child_dst, child_is_dir)
                    .await?;
            }
            Ok(())
        })
    }

    /// Delete a file or a collection with everything below it.
    #[instrument(skip(self), fields(user = %self.ctx.user))]
    pub async fn delete_node(&self, path: &str) -> DavResult<()> {
        let view = &self.ctx.view;
        let info = self.info_of(path).await?;
        if !info.is_deletable() {
            return Err(DavError::forbidden(format!("{} is not deletable", path)));
        }
        let _lock = self.lock(path, LockMode::Exclusive)?;
        if !view.unlink(path).await {
            return Err(DavError::forbidden(format!("Could not delete {}", path)));
        }
        let (parent, _) = split_path(path);
        view.mark_dirty(&parent);
        info!("Deleted {}", path);
        Ok(())
    }

    /// Create a single collection.
    #[instrument(skip(self), fields(user = %self.ctx.user))]
    pub async fn make_collection(&self, path: &str) -> DavResult<()> {
        let view = &self.ctx.view;
        if view.exists(path).await {
            return Err(DavError::new(
                ErrorKind::MethodNotAllowed,
                format!("{} already exists", path),
            ));
        }
        let (parent, name) = split_path(path);
        verify_filename(&name).map_err(|e| DavError::new(ErrorKind::InvalidPath, e.message()))?;
        let parent_info = self.require_parent_dir(&parent).await?;
        if !parent_info.is_creatable() {
            return Err(DavError::forbidden(format!(
                "Cannot create nodes in {}",
                parent
            )));
        }
        if !view.mkdir(path).await? {
            return Err(DavError::new(
                ErrorKind::MethodNotAllowed,
                format!("{} already exists", path),
            ));
        }
        view.mark_dirty(&parent);
        Ok(())
    }
}
