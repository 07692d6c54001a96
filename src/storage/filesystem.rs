//! Local-disk implementation of `FilesystemView`

use super::cache::MetadataCache;
use super::traits::{FilesystemView, ReadHandle, StorageError, WriteHandle};
use crate::types::{is_staging_file, normalize_path, FileInfo, FreeSpace, Permissions};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, info, instrument, warn};

/// Async-safe path existence check (avoids blocking the Tokio runtime)
async fn path_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// Async-safe directory check
async fn is_dir(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// ENOSPC raw error code on Linux and macOS.
const ENOSPC: i32 = 28;

/// Convert an io::Error into StorageError, detecting disk-full (ENOSPC)
/// and the permission/not-found classes the DAV layer distinguishes.
fn io_to_storage_error(e: std::io::Error, path: &str) -> StorageError {
    if e.raw_os_error() == Some(ENOSPC) {
        return StorageError::DiskFull;
    }
    match e.kind() {
        std::io::ErrorKind::NotFound => StorageError::NotFound(path.to_string()),
        std::io::ErrorKind::PermissionDenied => StorageError::NotPermitted(path.to_string()),
        std::io::ErrorKind::AlreadyExists => StorageError::AlreadyExists(path.to_string()),
        _ => StorageError::Io(e),
    }
}

fn to_utc(t: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}

/// Entity tag derived from inode, size and both timestamps. The change time
/// moves on every write, so a rewrite with identical bytes still gets a new tag.
fn compute_etag(meta: &std::fs::Metadata) -> String {
    let mut hasher = Md5::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        hasher.update(meta.ino().to_le_bytes());
        hasher.update(meta.ctime().to_le_bytes());
        hasher.update(meta.ctime_nsec().to_le_bytes());
    }
    hasher.update(meta.len().to_le_bytes());
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    hasher.update(mtime.to_le_bytes());
    hex::encode(hasher.finalize())
}

/// Free bytes available to unprivileged users on the filesystem holding `path`.
#[cfg(unix)]
#[allow(clippy::unnecessary_cast)]
fn disk_free_space(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    // SAFETY: `statvfs` only writes into the caller-provided struct, which is
    // zero-initialized and lives for the duration of the call; `c_path` is a
    // valid NUL-terminated string.
    unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) == 0 {
            Some(stat.f_bavail as u64 * stat.f_frsize as u64)
        } else {
            None
        }
    }
}

#[cfg(not(unix))]
fn disk_free_space(_path: &Path) -> Option<u64> {
    None
}

/// Options for a `LocalView`
#[derive(Debug, Clone)]
pub struct ViewOptions {
    /// Per-user quota in bytes; `None` falls back to the disk's free space
    pub quota_bytes: Option<u64>,
    /// Route writes through `.part` staging files
    pub staging_writes: bool,
    /// Metadata cache capacity
    pub cache_entries: u64,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            quota_bytes: None,
            staging_writes: true,
            cache_entries: 10_000,
        }
    }
}

/// Filesystem view over one user's files directory
///
/// Storage layout:
/// ```text
/// {data_dir}/{user}/files/...     # user namespace, logical "/" maps here
/// {data_dir}/{user}/uploads/...   # chunk store (see dav::chunking)
/// ```
pub struct LocalView {
    /// Directory that logical "/" maps to
    root: PathBuf,
    cache: MetadataCache,
    options: ViewOptions,
}

impl LocalView {
    /// Create a view rooted at `root`, creating the directory if needed.
    pub async fn new(root: PathBuf, options: ViewOptions) -> Result<Self, StorageError> {
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            cache: MetadataCache::new(options.cache_entries),
            options,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a logical path onto the local disk.
    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let normalized =
            normalize_path(path).map_err(|e| StorageError::InvalidPath(e.message().to_string()))?;
        let relative = normalized.trim_start_matches('/');
        if relative.is_empty() {
            Ok(self.root.clone())
        } else {
            Ok(self.root.join(relative))
        }
    }

    /// Read metadata straight from disk.
    async fn stat(&self, path: &str) -> Result<Option<FileInfo>, StorageError> {
        let normalized =
            normalize_path(path).map_err(|e| StorageError::InvalidPath(e.message().to_string()))?;
        let local = self.resolve(&normalized)?;
        let meta = match fs::metadata(&local).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_to_storage_error(e, &normalized)),
        };

        let updatable = !meta.permissions().readonly();
        let deletable = if normalized == "/" {
            false
        } else {
            match local.parent() {
                Some(parent) => fs::metadata(parent)
                    .await
                    .map(|m| !m.permissions().readonly())
                    .unwrap_or(false),
                None => false,
            }
        };

        let mtime = meta.modified().map(to_utc).unwrap_or_else(|_| Utc::now());
        Ok(Some(FileInfo {
            path: normalized,
            is_dir: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            mtime,
            etag: compute_etag(&meta),
            permissions: Permissions {
                updatable,
                creatable: meta.is_dir() && updatable,
                deletable,
            },
        }))
    }

    /// Calculate total size of a directory recursively
    fn dir_size<'a>(
        path: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<u64, StorageError>> + Send + 'a>> {
        Box::pin(async move {
            let mut total = 0;
            if is_dir(path).await {
                let mut entries = fs::read_dir(path).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let ft = entry.file_type().await?;
                    if ft.is_dir() {
                        total += Self::dir_size(&entry.path()).await?;
                    } else {
                        total += entry.metadata().await?.len();
                    }
                }
            }
            Ok(total)
        })
    }

    /// Remove staging files older than `older_than` anywhere below `dir`.
    /// Returns the number of files removed.
    pub fn sweep_staging_files<'a>(
        dir: &'a Path,
        older_than: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<usize, StorageError>> + Send + 'a>> {
        Box::pin(async move {
            let mut removed = 0;
            if !is_dir(dir).await {
                return Ok(0);
            }
            let now = SystemTime::now();
            let mut entries = fs::read_dir(dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let ft = entry.file_type().await?;
                if ft.is_dir() {
                    removed += Self::sweep_staging_files(&path, older_than).await?;
                    continue;
                }
                let is_staging = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(is_staging_file)
                    .unwrap_or(false);
                if !is_staging {
                    continue;
                }
                let age = entry
                    .metadata()
                    .await?
                    .modified()
                    .ok()
                    .and_then(|m| now.duration_since(m).ok())
                    .unwrap_or_default();
                if age >= older_than {
                    match fs::remove_file(&path).await {
                        Ok(()) => {
                            info!("Removed orphaned staging file {:?}", path);
                            removed += 1;
                        }
                        Err(e) => warn!("Failed to remove staging file {:?}: {}", path, e),
                    }
                }
            }
            Ok(removed)
        })
    }
}

#[async_trait]
impl FilesystemView for LocalView {
    async fn exists(&self, path: &str) -> bool {
        match self.resolve(path) {
            Ok(local) => path_exists(&local).await,
            Err(_) => false,
        }
    }

    async fn is_dir(&self, path: &str) -> bool {
        match self.resolve(path) {
            Ok(local) => is_dir(&local).await,
            Err(_) => false,
        }
    }

    #[instrument(skip(self))]
    async fn open_write(&self, path: &str) -> Result<WriteHandle, StorageError> {
        let local = self.resolve(path)?;
        let file = fs::File::create(&local)
            .await
            .map_err(|e| io_to_storage_error(e, path))?;
        self.cache.invalidate(path);
        debug!("Opened {:?} for writing", local);
        Ok(Box::new(file))
    }

    #[instrument(skip(self))]
    async fn open_read(&self, path: &str) -> Result<ReadHandle, StorageError> {
        let local = self.resolve(path)?;
        let file = fs::File::open(&local)
            .await
            .map_err(|e| io_to_storage_error(e, path))?;
        Ok(Box::new(file))
    }

    #[instrument(skip(self))]
    async fn rename(&self, from: &str, to: &str) -> Result<bool, StorageError> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        match fs::rename(&src, &dst).await {
            Ok(()) => {
                self.cache.invalidate_tree(from);
                self.cache.invalidate_tree(to);
                debug!("Renamed {} -> {}", from, to);
                Ok(true)
            }
            Err(e) if e.raw_os_error() == Some(ENOSPC) => Err(StorageError::DiskFull),
            Err(e) => {
                warn!("Rename {} -> {} failed: {}", from, to, e);
                Ok(false)
            }
        }
    }

    #[instrument(skip(self))]
    async fn unlink(&self, path: &str) -> bool {
        let local = match self.resolve(path) {
            Ok(l) => l,
            Err(_) => return false,
        };
        let result = if is_dir(&local).await {
            fs::remove_dir_all(&local).await
        } else {
            fs::remove_file(&local).await
        };
        self.cache.invalidate_tree(path);
        match result {
            Ok(()) => {
                debug!("Deleted {}", path);
                true
            }
            Err(e) => {
                debug!("Delete of {} failed: {}", path, e);
                false
            }
        }
    }

    #[instrument(skip(self))]
    async fn touch(&self, path: &str, mtime: DateTime<Utc>) -> Result<bool, StorageError> {
        let local = self.resolve(path)?;
        let when: SystemTime = mtime.into();
        let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let file = std::fs::File::open(&local)?;
            file.set_modified(when)
        })
        .await
        .map_err(|e| StorageError::Other(format!("spawn_blocking join failed: {}", e)))?;
        self.cache.invalidate(path);
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_to_storage_error(e, path)),
        }
    }

    #[instrument(skip(self))]
    async fn mkdir(&self, path: &str) -> Result<bool, StorageError> {
        let local = self.resolve(path)?;
        match fs::create_dir(&local).await {
            Ok(()) => {
                self.cache.invalidate(path);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(io_to_storage_error(e, path)),
        }
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<String>, StorageError> {
        let local = self.resolve(path)?;
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&local)
            .await
            .map_err(|e| io_to_storage_error(e, path))?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if !is_staging_file(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    #[instrument(skip(self))]
    async fn copy_file(&self, from: &str, to: &str) -> Result<bool, StorageError> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        match fs::copy(&src, &dst).await {
            Ok(bytes) => {
                self.cache.invalidate(to);
                debug!("Copied {} -> {} ({} bytes)", from, to, bytes);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_to_storage_error(e, to)),
        }
    }

    async fn free_space(&self, _path: &str) -> FreeSpace {
        match self.options.quota_bytes {
            Some(quota) => match Self::dir_size(&self.root).await {
                Ok(used) => FreeSpace::Known(quota.saturating_sub(used)),
                Err(e) => {
                    warn!("Could not compute used space under {:?}: {}", self.root, e);
                    FreeSpace::Unknown
                }
            },
            None => {
                let root = self.root.clone();
                tokio::task::spawn_blocking(move || disk_free_space(&root))
                    .await
                    .ok()
                    .flatten()
                    .map(FreeSpace::Known)
                    .unwrap_or(FreeSpace::Unknown)
            }
        }
    }

    fn needs_staging(&self, _path: &str) -> bool {
        self.options.staging_writes
    }

    async fn file_info(&self, path: &str) -> Result<Option<FileInfo>, StorageError> {
        if let Some(info) = self.cache.get(path) {
            return Ok(Some(info));
        }
        self.scan(path).await
    }

    #[instrument(skip(self))]
    async fn scan(&self, path: &str) -> Result<Option<FileInfo>, StorageError> {
        match self.stat(path).await? {
            Some(info) => {
                self.cache.put(info.clone());
                Ok(Some(info))
            }
            None => {
                self.cache.invalidate(path);
                Ok(None)
            }
        }
    }

    fn mark_dirty(&self, path: &str) {
        self.cache.invalidate(path);
    }
}
