//! Non-blocking shared/exclusive path locks
//!
//! Every lock is keyed by an opaque string (user + logical path). Acquisition
//! never waits: a conflicting request fails immediately with
//! `LockError::Conflict` and the caller decides what to report.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => f.write_str("shared"),
            LockMode::Exclusive => f.write_str("exclusive"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("\"{key}\" is locked ({held} lock held)")]
    Conflict { key: String, held: LockMode },
}

#[derive(Debug, Default)]
struct LockEntry {
    shared: usize,
    exclusive: bool,
}

impl LockEntry {
    fn is_free(&self) -> bool {
        self.shared == 0 && !self.exclusive
    }
}

/// In-process lock table shared by every request.
#[derive(Debug, Default)]
pub struct LockProvider {
    locks: Mutex<HashMap<String, LockEntry>>,
}

impl LockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire `mode` on `key`, failing fast on conflict.
    pub fn acquire(self: &Arc<Self>, key: &str, mode: LockMode) -> Result<LockGuard, LockError> {
        let mut locks = self.locks.lock();
        let entry = locks.entry(key.to_string()).or_default();
        match mode {
            LockMode::Shared if entry.exclusive => {
                return Err(LockError::Conflict {
                    key: key.to_string(),
                    held: LockMode::Exclusive,
                })
            }
            LockMode::Shared => entry.shared += 1,
            LockMode::Exclusive if !entry.is_free() => {
                let held = if entry.exclusive {
                    LockMode::Exclusive
                } else {
                    LockMode::Shared
                };
                return Err(LockError::Conflict {
                    key: key.to_string(),
                    held,
                });
            }
            LockMode::Exclusive => entry.exclusive = true,
        }
        debug!("Acquired {} lock on {}", mode, key);
        Ok(LockGuard {
            provider: Arc::clone(self),
            key: key.to_string(),
            mode,
        })
    }

    /// Current mode held on `key`, if any.
    pub fn held_mode(&self, key: &str) -> Option<LockMode> {
        let locks = self.locks.lock();
        locks.get(key).and_then(|e| {
            if e.exclusive {
                Some(LockMode::Exclusive)
            } else if e.shared > 0 {
                Some(LockMode::Shared)
            } else {
                None
            }
        })
    }

    /// Number of keys with at least one holder.
    pub fn active_count(&self) -> usize {
        self.locks.lock().len()
    }

    fn change(&self, key: &str, from: LockMode, to: LockMode) -> Result<(), LockError> {
        if from == to {
            return Ok(());
        }
        let mut locks = self.locks.lock();
        let entry = locks.entry(key.to_string()).or_default();
        match (from, to) {
            (LockMode::Shared, LockMode::Exclusive) => {
                // only the sole shared holder may upgrade
                if entry.exclusive || entry.shared != 1 {
                    let held = if entry.exclusive {
                        LockMode::Exclusive
                    } else {
                        LockMode::Shared
                    };
                    return Err(LockError::Conflict {
                        key: key.to_string(),
                        held,
                    });
                }
                entry.shared = 0;
                entry.exclusive = true;
            }
            (LockMode::Exclusive, LockMode::Shared) => {
                entry.exclusive = false;
                entry.shared += 1;
            }
            _ => return Ok(()),
        }
        debug!("Changed lock on {} from {} to {}", key, from, to);
        Ok(())
    }

    fn release(&self, key: &str, mode: LockMode) {
        let mut locks = self.locks.lock();
        if let Some(entry) = locks.get_mut(key) {
            match mode {
                LockMode::Shared => entry.shared = entry.shared.saturating_sub(1),
                LockMode::Exclusive => entry.exclusive = false,
            }
            if entry.is_free() {
                locks.remove(key);
            }
        }
        debug!("Released {} lock on {}", mode, key);
    }
}

/// A held lock. Released when dropped, on every exit path.
#[derive(Debug)]
pub struct LockGuard {
    provider: Arc<LockProvider>,
    key: String,
    mode: LockMode,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Switch the held mode. Upgrading to exclusive fails if anyone else
    /// shares the key; the guard then keeps its previous mode.
    pub fn change(&mut self, mode: LockMode) -> Result<(), LockError> {
        self.provider.change(&self.key, self.mode, mode)?;
        self.mode = mode;
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.provider.release(&self.key, self.mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_locks_coexist() {
        let provider = LockProvider::new();
        let a = provider.acquire("k", LockMode::Shared).unwrap();
        let b = provider.acquire("k", LockMode::Shared).unwrap();
        assert_eq!(provider.held_mode("k"), Some(LockMode::Shared));
        drop(a);
        drop(b);
        assert_eq!(provider.held_mode("k"), None);
        assert_eq!(provider.active_count(), 0);
    }

    #[test]
    fn test_exclusive_conflicts_fail_fast() {
        let provider = LockProvider::new();
        let _x = provider.acquire("k", LockMode::Exclusive).unwrap();
        assert_eq!(
            provider.acquire("k", LockMode::Shared).unwrap_err(),
            LockError::Conflict {
                key: "k".into(),
                held: LockMode::Exclusive
            }
        );
        assert!(provider.acquire("k", LockMode::Exclusive).is_err());
        assert!(provider.acquire("other", LockMode::Exclusive).is_ok());
    }

    #[test]
    fn test_exclusive_blocked_by_shared() {
        let provider = LockProvider::new();
        let _s = provider.acquire("k", LockMode::Shared).unwrap();
        let err = provider.acquire("k", LockMode::Exclusive).unwrap_err();
        assert!(matches!(err, LockError::Conflict { held: LockMode::Shared, .. }));
    }

    #[test]
    fn test_upgrade_and_downgrade() {
        let provider = LockProvider::new();
        let mut g = provider.acquire("k", LockMode::Shared).unwrap();
        g.change(LockMode::Exclusive).unwrap();
        assert_eq!(provider.held_mode("k"), Some(LockMode::Exclusive));
        assert!(provider.acquire("k", LockMode::Shared).is_err());
        g.change(LockMode::Shared).unwrap();
        let other = provider.acquire("k", LockMode::Shared).unwrap();
        drop(other);
        drop(g);
        assert_eq!(provider.held_mode("k"), None);
    }

    #[test]
    fn test_upgrade_fails_with_second_reader() {
        let provider = LockProvider::new();
        let mut g = provider.acquire("k", LockMode::Shared).unwrap();
        let _other = provider.acquire("k", LockMode::Shared).unwrap();
        assert!(g.change(LockMode::Exclusive).is_err());
        assert_eq!(g.mode(), LockMode::Shared);
    }

    #[test]
    fn test_release_after_upgrade_frees_key() {
        let provider = LockProvider::new();
        {
            let mut g = provider.acquire("k", LockMode::Shared).unwrap();
            g.change(LockMode::Exclusive).unwrap();
        }
        assert_eq!(provider.active_count(), 0);
        assert!(provider.acquire("k", LockMode::Exclusive).is_ok());
    }
}
