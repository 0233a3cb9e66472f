//! Redis-backed lease locks: SET NX PX acquire, holder-compared Lua renew
//! and release.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tokio::sync::RwLock;

use crate::config::QueueConfig;
use crate::types::ProjectKey;
use crate::Result;

use super::LockManager;

/// Distributed [`LockManager`] over per-key Redis strings.
///
/// Each lock is `{prefix}lock:{key}` holding the holder id with a PX expiry,
/// so a crashed holder's lock disappears on its own. Renew and release run
/// Lua scripts that compare the stored holder before touching the key.
pub struct RedisLockManager {
    connection: Arc<RwLock<ConnectionManager>>,
    key_prefix: String,
}

impl RedisLockManager {
    /// Connect to the configured Redis instance.
    pub async fn new(config: &QueueConfig) -> Result<Self> {
        let client = Client::open(config.redis_url.as_str())?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self {
            connection: Arc::new(RwLock::new(connection)),
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn lock_key(&self, key: &ProjectKey) -> String {
        format!("{}lock:{}", self.key_prefix, key)
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn try_acquire(&self, key: &ProjectKey, holder_id: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.write().await;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(key))
            .arg(holder_id)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut *conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn renew(&self, key: &ProjectKey, holder_id: &str, ttl: Duration) -> Result<bool> {
        let script = Script::new(
            r"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('PEXPIRE', KEYS[1], ARGV[2])
            end
            return 0
            ",
        );
        let mut conn = self.connection.write().await;
        let renewed: i64 = script
            .key(self.lock_key(key))
            .arg(holder_id)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut *conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release(&self, key: &ProjectKey, holder_id: &str) -> Result<()> {
        let script = Script::new(
            r"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            end
            return 0
            ",
        );
        let mut conn = self.connection.write().await;
        let _: i64 = script
            .key(self.lock_key(key))
            .arg(holder_id)
            .invoke_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn held_keys(&self) -> Result<Vec<ProjectKey>> {
        let prefix = format!("{}lock:", self.key_prefix);
        let pattern = format!("{}*", prefix);

        let mut conn = self.connection.write().await;
        let mut keys = Vec::new();
        let mut iter = conn.scan_match::<_, String>(pattern).await?;
        while let Some(store_key) = iter.next_item().await {
            if let Some(key) = store_key.strip_prefix(&prefix) {
                keys.push(ProjectKey::new(key));
            }
        }
        Ok(keys)
    }
}
