//! Resource-keyed read/write locks
//!
//! The lock manager hands out mutual-exclusion primitives keyed by resource
//! name. Guards are *owned* (they keep their `RwLock` alive via `Arc`), so
//! the distributed layer can hold a lock across await points and on behalf
//! of remote members, releasing it by dropping the guard.
//!
//! The reserved [`GLOBAL_LOCK_RESOURCE`] serializes schema-altering
//! operations cluster-wide.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::timeout;

use crate::dispatch::Member;
use crate::error::{ClusterError, Result};

/// Reserved resource id for the cluster-wide serialization lock
pub const GLOBAL_LOCK_RESOURCE: &str = "global";

/// Lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Read,
    Write,
}

/// One lock held somewhere in the cluster: the resource, the mode, and the
/// member the lock is held for. Shipped in coordinator state snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDescriptor {
    pub resource: String,
    pub mode: LockMode,
    pub owner: Member,
}

/// A held lock. Dropping it releases the lock.
#[derive(Debug)]
pub enum LockGuard {
    Read(OwnedRwLockReadGuard<()>),
    Write(OwnedRwLockWriteGuard<()>),
}

impl LockGuard {
    pub fn mode(&self) -> LockMode {
        match self {
            LockGuard::Read(_) => LockMode::Read,
            LockGuard::Write(_) => LockMode::Write,
        }
    }
}

/// Local lock manager keyed by resource name
#[derive(Default)]
pub struct LockManager {
    locks: DashMap<String, Arc<RwLock<()>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, resource: &str) -> Arc<RwLock<()>> {
        self.locks
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Acquire a read lock, waiting as long as it takes
    pub async fn read_lock(&self, resource: &str) -> LockGuard {
        LockGuard::Read(self.lock_for(resource).read_owned().await)
    }

    /// Acquire a write lock, waiting as long as it takes
    pub async fn write_lock(&self, resource: &str) -> LockGuard {
        LockGuard::Write(self.lock_for(resource).write_owned().await)
    }

    /// Acquire a lock, refusing after `wait`
    pub async fn try_lock(&self, resource: &str, mode: LockMode, wait: Duration) -> Result<LockGuard> {
        let lock = self.lock_for(resource);
        let acquired = match mode {
            LockMode::Read => timeout(wait, lock.read_owned()).await.map(LockGuard::Read),
            LockMode::Write => timeout(wait, lock.write_owned()).await.map(LockGuard::Write),
        };
        acquired.map_err(|_| ClusterError::LockTimeout {
            resource: resource.to_string(),
            timeout_ms: wait.as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_lock_excludes_writers() {
        let manager = LockManager::new();

        let held = manager.write_lock("global").await;
        let refused = manager
            .try_lock("global", LockMode::Write, Duration::from_millis(20))
            .await;
        assert!(matches!(refused, Err(ClusterError::LockTimeout { .. })));

        drop(held);
        manager
            .try_lock("global", LockMode::Write, Duration::from_millis(20))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_read_locks_share() {
        let manager = LockManager::new();

        let _first = manager.read_lock("table:t1").await;
        let second = manager
            .try_lock("table:t1", LockMode::Read, Duration::from_millis(20))
            .await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_write_lock_excludes_readers() {
        let manager = LockManager::new();

        let held = manager.write_lock("table:t1").await;
        assert_eq!(held.mode(), LockMode::Write);

        let refused = manager
            .try_lock("table:t1", LockMode::Read, Duration::from_millis(20))
            .await;
        assert!(refused.is_err());
    }

    #[tokio::test]
    async fn test_resources_are_independent() {
        let manager = LockManager::new();

        let _held = manager.write_lock("a").await;
        let other = manager
            .try_lock("b", LockMode::Write, Duration::from_millis(20))
            .await;
        assert!(other.is_ok());
    }
}
