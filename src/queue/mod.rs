//! Distributed queue of pending batches.
//!
//! The queue is a durable shared FIFO: `push` appends atomically and
//! `try_pop` removes atomically with single-consumer visibility. A consumer
//! that pops and then crashes does not get its batch back from the queue;
//! recovery is delegated to the lock lease plus the worker requeue policy.

use std::time::Duration;

use async_trait::async_trait;

use crate::types::{ProjectBatch, ProjectKey};
use crate::Result;

mod memory;
mod redis;

pub use memory::MemoryQueue;
pub use redis::RedisQueue;

/// Shared FIFO of pending batches.
#[async_trait]
pub trait BatchQueue: Send + Sync {
    /// Append a batch to the tail of the queue. Returns the batch's 0-based
    /// position from the front of the service order.
    async fn push(&self, batch: ProjectBatch) -> Result<usize>;

    /// Atomically remove and return the front batch, visible to exactly one
    /// consumer. Returns `None` when the queue is empty.
    async fn try_pop(&self) -> Result<Option<ProjectBatch>>;

    /// Put a batch back at the tail of the queue after `delay` elapses.
    /// Used by workers on lock contention.
    async fn requeue_delayed(&self, batch: ProjectBatch, delay: Duration) -> Result<()>;

    /// Number of queued batches, including delayed ones. Eventually
    /// consistent; for introspection only.
    async fn len(&self) -> Result<usize>;

    /// Snapshot of queued batches in service order (delayed ones last).
    /// Eventually consistent; used for dedup and status lookups.
    async fn snapshot(&self) -> Result<Vec<ProjectBatch>>;

    /// Best-effort removal of one not-yet-popped item. Drops the owning
    /// batch entirely when it was the last item. Returns `false` when no
    /// queued batch for `key` contains the item.
    async fn remove_item(&self, key: &ProjectKey, item_id: &str) -> Result<bool>;
}
