//! Per-volume operation locks.
//!
//! [`VolumeLocks`] hands out one mutual-exclusion guard per key (a volume ID,
//! or a volume name during creation).  Lifecycle verbs use
//! [`VolumeLocks::lock`], which never waits: a held key fails immediately with
//! [`CsiError::OperationInProgress`] and the orchestrator retries the call.
//!
//! Entries are created on first use and never removed, so the map is bounded
//! by the number of distinct volumes this process has seen.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::CsiError;

/// Registry of per-key locks.  Owned by a service and shared via [`Arc`].
#[derive(Debug, Default)]
pub struct VolumeLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Proof that the holder owns the lock for [`VolumeLockGuard::key`].
/// Dropping it releases the key, including when the owning future is
/// cancelled mid-operation.
#[derive(Debug)]
pub struct VolumeLockGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl VolumeLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<Mutex<()>> {
        // The shard lock is released before the caller touches the mutex.
        Arc::clone(self.locks.entry(key.to_owned()).or_default().value())
    }

    /// Take the lock for `key` if nobody holds it.
    pub fn try_acquire(&self, key: &str) -> Option<VolumeLockGuard> {
        let guard = self.entry(key).try_lock_owned().ok()?;
        Some(VolumeLockGuard {
            key: key.to_owned(),
            _guard: guard,
        })
    }

    /// Wait until the lock for `key` is free and take it.
    pub async fn acquire(&self, key: &str) -> VolumeLockGuard {
        let guard = self.entry(key).lock_owned().await;
        VolumeLockGuard {
            key: key.to_owned(),
            _guard: guard,
        }
    }

    /// [`Self::try_acquire`], mapping a busy key to
    /// [`CsiError::OperationInProgress`].
    pub fn lock(&self, key: &str) -> Result<VolumeLockGuard, CsiError> {
        self.try_acquire(key).ok_or_else(|| {
            debug!(key, "lock busy, rejecting concurrent operation");
            CsiError::OperationInProgress(key.to_owned())
        })
    }

    /// Number of keys ever locked.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn second_holder_is_rejected_until_release() {
        let locks = VolumeLocks::new();
        let first = locks.try_acquire("vol-1").expect("free key");
        assert_eq!(first.key(), "vol-1");
        assert!(locks.try_acquire("vol-1").is_none());
        assert!(matches!(
            locks.lock("vol-1"),
            Err(CsiError::OperationInProgress(key)) if key == "vol-1"
        ));

        drop(first);
        assert!(locks.try_acquire("vol-1").is_some());
    }

    #[test]
    fn keys_are_independent() {
        let locks = VolumeLocks::new();
        let _a = locks.lock("vol-a").unwrap();
        let _b = locks.lock("vol-b").unwrap();
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn entries_are_reused() {
        let locks = VolumeLocks::new();
        for _ in 0..3 {
            drop(locks.lock("vol-1").unwrap());
        }
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let locks = Arc::new(VolumeLocks::new());
        let held = locks.lock("vol-1").unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire("vol-1").await.key().to_owned() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert_eq!(waiter.await.unwrap(), "vol-1");
    }

    #[tokio::test]
    async fn cancelled_holder_releases_the_key() {
        let locks = Arc::new(VolumeLocks::new());
        let task = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock("vol-1").unwrap();
                std::future::pending::<()>().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(locks.try_acquire("vol-1").is_none());

        task.abort();
        let _ = task.await;
        assert!(locks.try_acquire("vol-1").is_some());
    }
}
