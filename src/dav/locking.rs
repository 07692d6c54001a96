//! Protocol-level lock taken before a method runs

use crate::context::RequestContext;
use crate::error::DavResult;
use crate::storage::{LockGuard, LockMode};
use axum::http::Method;
use tracing::debug;

/// Takes the per-request shared lock on PUT targets that already exist.
///
/// The returned guard releases the lock when dropped, so it is held for
/// exactly as long as the caller keeps it; the upload pipeline upgrades it
/// for the duration of the write.
pub struct LockCoordinator<'a> {
    ctx: &'a RequestContext,
}

impl<'a> LockCoordinator<'a> {
    pub fn new(ctx: &'a RequestContext) -> Self {
        Self { ctx }
    }

    pub async fn before_method(&self, method: &Method, path: &str) -> DavResult<Option<LockGuard>> {
        if method != Method::PUT {
            return Ok(None);
        }
        if !self.ctx.view.exists(path).await {
            return Ok(None);
        }
        let guard = self
            .ctx
            .locks
            .acquire(&self.ctx.lock_key(path), LockMode::Shared)?;
        debug!("Request {} holds {}", self.ctx.request_id, guard.key());
        Ok(Some(guard))
    }
}
