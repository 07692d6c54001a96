//! Metadata cache for file nodes

use crate::types::FileInfo;
use moka::sync::Cache;
use tracing::debug;

/// Bounded cache of `FileInfo` keyed by normalized logical path.
///
/// Writers refresh (`put`) or invalidate entries through the view; nothing
/// else ever mutates a file behind the cache's back.
pub struct MetadataCache {
    cache: Cache<String, FileInfo>,
}

impl MetadataCache {
    /// Create a cache holding at most `max_entries` nodes
    pub fn new(max_entries: u64) -> Self {
        Self {
            cache: Cache::new(max_entries.max(1)),
        }
    }

    /// Get cached metadata
    pub fn get(&self, path: &str) -> Option<FileInfo> {
        let result = self.cache.get(path);
        if result.is_some() {
            debug!("Metadata cache hit for {}", path);
        }
        result
    }

    /// Insert or replace metadata
    pub fn put(&self, info: FileInfo) {
        self.cache.insert(info.path.clone(), info);
    }

    /// Invalidate a single entry
    pub fn invalidate(&self, path: &str) {
        self.cache.invalidate(path);
        debug!("Invalidated metadata for {}", path);
    }

    /// Invalidate `path` and every cached node below it.
    pub fn invalidate_tree(&self, path: &str) {
        self.cache.invalidate(path);
        let prefix = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{}/", path)
        };
        let stale: Vec<String> = self
            .cache
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| (*k).clone())
            .collect();
        for key in stale {
            self.cache.invalidate(&key);
        }
    }

    /// Number of cached entries (approximate until pending tasks run)
    pub fn len(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Permissions;
    use chrono::Utc;

    fn info(path: &str) -> FileInfo {
        FileInfo {
            path: path.to_string(),
            is_dir: false,
            size: 3,
            mtime: Utc::now(),
            etag: "abc".to_string(),
            permissions: Permissions {
                updatable: true,
                creatable: true,
                deletable: true,
            },
        }
    }

    #[test]
    fn test_cache_put_get() {
        let cache = MetadataCache::new(16);
        cache.put(info("/a.txt"));
        assert_eq!(cache.get("/a.txt").unwrap().etag, "abc");
        assert!(cache.get("/b.txt").is_none());
    }

    #[test]
    fn test_cache_invalidate() {
        let cache = MetadataCache::new(16);
        cache.put(info("/a.txt"));
        cache.invalidate("/a.txt");
        assert!(cache.get("/a.txt").is_none());
    }

    #[test]
    fn test_cache_invalidate_tree() {
        let cache = MetadataCache::new(16);
        cache.put(info("/dir"));
        cache.put(info("/dir/a.txt"));
        cache.put(info("/dir/sub/b.txt"));
        cache.put(info("/dirt.txt"));
        cache.invalidate_tree("/dir");
        assert!(cache.get("/dir").is_none());
        assert!(cache.get("/dir/a.txt").is_none());
        assert!(cache.get("/dir/sub/b.txt").is_none());
        assert!(cache.get("/dirt.txt").is_some());
    }
}
