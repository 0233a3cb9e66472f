//! In-memory lock backend for tests and single-process deployments.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::types::ProjectKey;
use crate::Result;

use super::LockManager;

struct Lease {
    holder_id: String,
    expires_at: Instant,
}

impl Lease {
    fn expired(&self) -> bool {
        self.expires_at <= Instant::now()
    }
}

/// Process-local [`LockManager`] with lazy expiry checks.
pub struct MemoryLockManager {
    leases: Mutex<HashMap<ProjectKey, Lease>>,
}

impl MemoryLockManager {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryLockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn try_acquire(&self, key: &ProjectKey, holder_id: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock();
        match leases.get(key) {
            Some(lease) if !lease.expired() => Ok(false),
            _ => {
                leases.insert(
                    key.clone(),
                    Lease {
                        holder_id: holder_id.to_string(),
                        expires_at: Instant::now() + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn renew(&self, key: &ProjectKey, holder_id: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock();
        match leases.get_mut(key) {
            Some(lease) if !lease.expired() && lease.holder_id == holder_id => {
                lease.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &ProjectKey, holder_id: &str) -> Result<()> {
        let mut leases = self.leases.lock();
        if let Some(lease) = leases.get(key) {
            if !lease.expired() && lease.holder_id == holder_id {
                leases.remove(key);
            }
        }
        Ok(())
    }

    async fn held_keys(&self) -> Result<Vec<ProjectKey>> {
        let leases = self.leases.lock();
        Ok(leases
            .iter()
            .filter(|(_, lease)| !lease.expired())
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_second_acquire_fails_while_held() {
        let locks = MemoryLockManager::new();
        let key: ProjectKey = "p1".into();

        assert!(locks.try_acquire(&key, "w1", TTL).await.unwrap());
        assert!(!locks.try_acquire(&key, "w2", TTL).await.unwrap());
        // Not reentrant: NX semantics apply to the holder too.
        assert!(!locks.try_acquire(&key, "w1", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_is_stealable() {
        let locks = MemoryLockManager::new();
        let key: ProjectKey = "p1".into();

        assert!(locks
            .try_acquire(&key, "w1", Duration::from_millis(20))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(locks.try_acquire(&key, "w2", TTL).await.unwrap());
        assert!(!locks.renew(&key, "w1", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_foreign_release_is_noop() {
        let locks = MemoryLockManager::new();
        let key: ProjectKey = "p1".into();

        assert!(locks.try_acquire(&key, "w1", TTL).await.unwrap());
        locks.release(&key, "w2").await.unwrap();
        assert!(locks.renew(&key, "w1", TTL).await.unwrap());
        assert_eq!(locks.held_keys().await.unwrap(), vec![key.clone()]);

        locks.release(&key, "w1").await.unwrap();
        assert!(locks.held_keys().await.unwrap().is_empty());
    }
}
