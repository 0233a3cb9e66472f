//! Redis-backed queue: a list for ready batches plus a sorted set for
//! delayed requeues, promoted by score before every pop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tokio::sync::RwLock;

use crate::config::QueueConfig;
use crate::types::{ProjectBatch, ProjectKey};
use crate::Result;

use super::BatchQueue;

/// Distributed [`BatchQueue`] over a Redis list.
///
/// Ready batches live in `{prefix}queue` (LPUSH head, RPOP tail, so the
/// oldest batch sits at the tail). Delayed requeues live in
/// `{prefix}delayed`, scored by their due time in epoch milliseconds and
/// moved back onto the list by a Lua script once due.
pub struct RedisQueue {
    connection: Arc<RwLock<ConnectionManager>>,
    config: QueueConfig,
}

impl RedisQueue {
    /// Connect to the configured Redis instance.
    pub async fn new(config: QueueConfig) -> Result<Self> {
        let client = Client::open(config.redis_url.as_str())?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self {
            connection: Arc::new(RwLock::new(connection)),
            config,
        })
    }

    fn queue_key(&self) -> String {
        format!("{}queue", self.config.key_prefix)
    }

    fn delayed_key(&self) -> String {
        format!("{}delayed", self.config.key_prefix)
    }

    /// Move due delayed batches back onto the list head (tail of the
    /// service order). Runs as one script so promotion and removal from the
    /// sorted set cannot be split by a crash.
    async fn promote_due(&self, conn: &mut ConnectionManager) -> Result<()> {
        let script = Script::new(
            r"
            local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
            for _, payload in ipairs(due) do
                redis.call('LPUSH', KEYS[2], payload)
                redis.call('ZREM', KEYS[1], payload)
            end
            return #due
            ",
        );
        let _: i64 = script
            .key(self.delayed_key())
            .key(self.queue_key())
            .arg(Utc::now().timestamp_millis())
            .invoke_async(conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BatchQueue for RedisQueue {
    async fn push(&self, batch: ProjectBatch) -> Result<usize> {
        let payload = serde_json::to_string(&batch)?;
        let mut conn = self.connection.write().await;
        let new_len: usize = conn.lpush(self.queue_key(), payload).await?;
        Ok(new_len - 1)
    }

    async fn try_pop(&self) -> Result<Option<ProjectBatch>> {
        let mut conn = self.connection.write().await;
        self.promote_due(&mut conn).await?;
        let raw: Option<String> = conn.rpop(self.queue_key(), None).await?;
        match raw {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn requeue_delayed(&self, batch: ProjectBatch, delay: Duration) -> Result<()> {
        let payload = serde_json::to_string(&batch)?;
        let due = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let mut conn = self.connection.write().await;
        let _: () = conn.zadd(self.delayed_key(), payload, due).await?;
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.connection.write().await;
        let ready: usize = conn.llen(self.queue_key()).await?;
        let delayed: usize = conn.zcard(self.delayed_key()).await?;
        Ok(ready + delayed)
    }

    async fn snapshot(&self) -> Result<Vec<ProjectBatch>> {
        let mut conn = self.connection.write().await;
        let raw: Vec<String> = conn.lrange(self.queue_key(), 0, -1).await?;
        let delayed: Vec<String> = conn.zrange(self.delayed_key(), 0, -1).await?;
        drop(conn);

        // LRANGE returns head first; service order pops the tail.
        let mut batches = Vec::with_capacity(raw.len() + delayed.len());
        for payload in raw.iter().rev().chain(delayed.iter()) {
            batches.push(serde_json::from_str(payload)?);
        }
        Ok(batches)
    }

    async fn remove_item(&self, key: &ProjectKey, item_id: &str) -> Result<bool> {
        // Compare-and-swap: rewrite the payload only if the slot still holds
        // the bytes we read. A lost race means a worker popped or another
        // cancel rewrote it; retry a few times, then report not-found.
        let cas_list = Script::new(
            r"
            if redis.call('LINDEX', KEYS[1], ARGV[1]) == ARGV[2] then
                if ARGV[3] == '' then
                    redis.call('LREM', KEYS[1], 1, ARGV[2])
                else
                    redis.call('LSET', KEYS[1], ARGV[1], ARGV[3])
                end
                return 1
            end
            return 0
            ",
        );
        let cas_zset = Script::new(
            r"
            local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
            if score then
                redis.call('ZREM', KEYS[1], ARGV[1])
                if ARGV[2] ~= '' then
                    redis.call('ZADD', KEYS[1], score, ARGV[2])
                end
                return 1
            end
            return 0
            ",
        );

        for _ in 0..3 {
            let mut conn = self.connection.write().await;

            let entries: Vec<String> = conn.lrange(self.queue_key(), 0, -1).await?;
            for (idx, raw) in entries.iter().enumerate() {
                let mut batch: ProjectBatch = serde_json::from_str(raw)?;
                if &batch.key != key {
                    continue;
                }
                let Some(pos) = batch.items.iter().position(|i| i.id == item_id) else {
                    continue;
                };
                batch.items.remove(pos);
                let replacement = if batch.items.is_empty() {
                    String::new()
                } else {
                    serde_json::to_string(&batch)?
                };
                let swapped: i64 = cas_list
                    .key(self.queue_key())
                    .arg(idx as i64)
                    .arg(raw)
                    .arg(replacement)
                    .invoke_async(&mut *conn)
                    .await?;
                if swapped == 1 {
                    return Ok(true);
                }
                // Raced with a pop or another cancel; rescan.
                break;
            }

            let delayed: Vec<String> = conn.zrange(self.delayed_key(), 0, -1).await?;
            for raw in &delayed {
                let mut batch: ProjectBatch = serde_json::from_str(raw)?;
                if &batch.key != key {
                    continue;
                }
                let Some(pos) = batch.items.iter().position(|i| i.id == item_id) else {
                    continue;
                };
                batch.items.remove(pos);
                let replacement = if batch.items.is_empty() {
                    String::new()
                } else {
                    serde_json::to_string(&batch)?
                };
                let swapped: i64 = cas_zset
                    .key(self.delayed_key())
                    .arg(raw)
                    .arg(replacement)
                    .invoke_async(&mut *conn)
                    .await?;
                if swapped == 1 {
                    return Ok(true);
                }
            }

            let seen = entries
                .iter()
                .chain(delayed.iter())
                .any(|raw| raw.contains(item_id));
            if !seen {
                return Ok(false);
            }
        }

        Ok(false)
    }
}
