//! Storage backend abstraction

mod cache;
mod filesystem;
mod locking;
mod traits;

pub use cache::MetadataCache;
pub use filesystem::{LocalView, ViewOptions};
pub use locking::{LockError, LockGuard, LockMode, LockProvider};
pub use traits::{FilesystemView, ReadHandle, StorageError, WriteHandle};
