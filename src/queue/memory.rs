//! In-memory queue backend for tests and single-process deployments.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::types::{ProjectBatch, ProjectKey};
use crate::Result;

use super::BatchQueue;

#[derive(Default)]
struct QueueState {
    ready: VecDeque<ProjectBatch>,
    delayed: Vec<(Instant, ProjectBatch)>,
}

impl QueueState {
    /// Move delayed batches whose delay has elapsed to the tail of the
    /// ready queue, preserving their relative due order.
    fn promote_due(&mut self) {
        let now = Instant::now();
        self.delayed.sort_by_key(|(due, _)| *due);
        while let Some((due, _)) = self.delayed.first() {
            if *due > now {
                break;
            }
            let (_, batch) = self.delayed.remove(0);
            self.ready.push_back(batch);
        }
    }
}

/// Process-local [`BatchQueue`] over a mutex-guarded deque.
pub struct MemoryQueue {
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchQueue for MemoryQueue {
    async fn push(&self, batch: ProjectBatch) -> Result<usize> {
        let mut state = self.state.lock();
        state.ready.push_back(batch);
        Ok(state.ready.len() - 1)
    }

    async fn try_pop(&self) -> Result<Option<ProjectBatch>> {
        let mut state = self.state.lock();
        state.promote_due();
        Ok(state.ready.pop_front())
    }

    async fn requeue_delayed(&self, batch: ProjectBatch, delay: Duration) -> Result<()> {
        let mut state = self.state.lock();
        state.delayed.push((Instant::now() + delay, batch));
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let state = self.state.lock();
        Ok(state.ready.len() + state.delayed.len())
    }

    async fn snapshot(&self) -> Result<Vec<ProjectBatch>> {
        let state = self.state.lock();
        let mut all: Vec<ProjectBatch> = state.ready.iter().cloned().collect();
        all.extend(state.delayed.iter().map(|(_, b)| b.clone()));
        Ok(all)
    }

    async fn remove_item(&self, key: &ProjectKey, item_id: &str) -> Result<bool> {
        let mut state = self.state.lock();

        let hit = state.ready.iter().enumerate().find_map(|(idx, batch)| {
            if &batch.key != key {
                return None;
            }
            batch
                .items
                .iter()
                .position(|i| i.id == item_id)
                .map(|pos| (idx, pos))
        });
        if let Some((idx, pos)) = hit {
            state.ready[idx].items.remove(pos);
            if state.ready[idx].items.is_empty() {
                state.ready.remove(idx);
            }
            return Ok(true);
        }

        let hit = state.delayed.iter().enumerate().find_map(|(slot, (_, batch))| {
            if &batch.key != key {
                return None;
            }
            batch
                .items
                .iter()
                .position(|i| i.id == item_id)
                .map(|pos| (slot, pos))
        });
        if let Some((slot, pos)) = hit {
            state.delayed[slot].1.items.remove(pos);
            if state.delayed[slot].1.items.is_empty() {
                state.delayed.remove(slot);
            }
            return Ok(true);
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch(key: &str, ids: &[&str]) -> ProjectBatch {
        ProjectBatch::new(key.into(), ids.iter().map(|s| s.to_string()).collect(), json!({}))
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = MemoryQueue::new();
        queue.push(batch("p1", &["a"])).await.unwrap();
        queue.push(batch("p2", &["b"])).await.unwrap();

        assert_eq!(queue.try_pop().await.unwrap().unwrap().key, ProjectKey::from("p1"));
        assert_eq!(queue.try_pop().await.unwrap().unwrap().key, ProjectKey::from("p2"));
        assert!(queue.try_pop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_push_reports_position() {
        let queue = MemoryQueue::new();
        assert_eq!(queue.push(batch("p1", &["a"])).await.unwrap(), 0);
        assert_eq!(queue.push(batch("p2", &["b"])).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delayed_batch_invisible_until_due() {
        let queue = MemoryQueue::new();
        queue
            .requeue_delayed(batch("p1", &["a"]), Duration::from_millis(50))
            .await
            .unwrap();

        assert!(queue.try_pop().await.unwrap().is_none());
        assert_eq!(queue.len().await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(queue.try_pop().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_remove_item_drops_empty_batch() {
        let queue = MemoryQueue::new();
        queue.push(batch("p1", &["a", "b"])).await.unwrap();

        assert!(queue.remove_item(&"p1".into(), "a").await.unwrap());
        assert_eq!(queue.len().await.unwrap(), 1);
        assert!(queue.remove_item(&"p1".into(), "b").await.unwrap());
        assert_eq!(queue.len().await.unwrap(), 0);
        assert!(!queue.remove_item(&"p1".into(), "b").await.unwrap());
    }
}
