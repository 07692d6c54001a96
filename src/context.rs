//! Request-scoped context passed into every DAV operation

use crate::events::EventBus;
use crate::storage::{FilesystemView, LockProvider};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default hard ceiling for a single entity: 10 GiB
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Default lifetime of stored chunks: 24 hours
pub const DEFAULT_CHUNK_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Everything an operation needs to know about the request it serves:
/// who is asking, which namespace they see, and the shared lock table and
/// event bus.
#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub user: String,
    pub view: Arc<dyn FilesystemView>,
    pub locks: Arc<LockProvider>,
    pub events: Arc<EventBus>,
    /// Directory holding this user's upload chunks
    pub upload_dir: PathBuf,
    pub max_upload_size: u64,
    pub chunk_ttl: Duration,
}

impl RequestContext {
    pub fn new(
        user: impl Into<String>,
        view: Arc<dyn FilesystemView>,
        locks: Arc<LockProvider>,
        events: Arc<EventBus>,
        upload_dir: PathBuf,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            user: user.into(),
            view,
            locks,
            events,
            upload_dir,
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
            chunk_ttl: DEFAULT_CHUNK_TTL,
        }
    }

    pub fn with_limits(mut self, max_upload_size: u64, chunk_ttl: Duration) -> Self {
        self.max_upload_size = max_upload_size;
        self.chunk_ttl = chunk_ttl;
        self
    }

    /// Lock table key for a logical path of this user
    pub fn lock_key(&self, path: &str) -> String {
        format!("files/{}{}", self.user, path)
    }
}
