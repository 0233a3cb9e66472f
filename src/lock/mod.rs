//! Cluster-wide per-key lease locks.
//!
//! At most one holder owns a key while the lease is unexpired; an expired
//! lock is free and stealable, which is what recovers keys after a worker
//! crash. Release and renew compare the stored holder first, so a stale
//! holder can never revoke or extend a legitimate new holder's lock.

use std::time::Duration;

use async_trait::async_trait;

use crate::types::ProjectKey;
use crate::Result;

mod memory;
mod redis;

pub use memory::MemoryLockManager;
pub use redis::RedisLockManager;

/// Per-key, cluster-wide mutual exclusion with lease expiry.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Atomic check-and-set acquire. Succeeds for at most one caller
    /// cluster-wide while the key's lease is unexpired.
    async fn try_acquire(&self, key: &ProjectKey, holder_id: &str, ttl: Duration) -> Result<bool>;

    /// Extend the lease. Returns `false` when the lock is no longer held by
    /// `holder_id` (expired and possibly stolen); the caller must fence
    /// itself and stop producing side effects for the key.
    async fn renew(&self, key: &ProjectKey, holder_id: &str, ttl: Duration) -> Result<bool>;

    /// Drop the lock. A no-op when the lock is expired or held by someone
    /// else.
    async fn release(&self, key: &ProjectKey, holder_id: &str) -> Result<()>;

    /// Keys currently lock-held cluster-wide. Eventually consistent; for
    /// introspection only.
    async fn held_keys(&self) -> Result<Vec<ProjectKey>>;
}
