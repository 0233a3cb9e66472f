//! Dispatch and admin surface: enqueue with dedup, best-effort cancel, and
//! introspection of queue depth and lock/execution state.
//!
//! This is a typed library surface; the request/response structs are serde
//! types so a thin HTTP front can sit on top without touching the core.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::DedupPolicy;
use crate::limiter::ProjectLimiter;
use crate::lock::LockManager;
use crate::queue::BatchQueue;
use crate::types::{ProjectBatch, ProjectKey};
use crate::{ProjectQError, Result};

/// Answer to an enqueue call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueReceipt {
    /// False when the dedup policy matched an already-queued batch
    pub queued: bool,
    /// Queue position of the new batch, or of the matched duplicate
    pub position: usize,
}

/// Where a key currently stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    /// A batch for the key is waiting in the queue
    Queued,
    /// The key's lock is held somewhere in the cluster
    Executing,
    /// Nothing queued or executing for the key
    Absent,
}

/// Status reply for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStatus {
    /// Current state
    pub state: KeyState,
    /// Queue position when `state` is `Queued`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

/// Cluster and process introspection snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminStatus {
    /// Batches waiting in the shared queue, delayed retries included
    pub queue_depth: usize,
    /// Keys lock-held anywhere in the cluster
    pub locked_keys: Vec<String>,
    /// Keys executing an item in this process right now
    pub executing_keys: Vec<String>,
}

/// Enqueue, cancel, and introspect against the shared queue and locks.
pub struct Dispatcher {
    queue: Arc<dyn BatchQueue>,
    locks: Arc<dyn LockManager>,
    limiter: Arc<ProjectLimiter>,
    dedup: DedupPolicy,
}

impl Dispatcher {
    /// Assemble a dispatcher over the given collaborators.
    pub fn new(
        queue: Arc<dyn BatchQueue>,
        locks: Arc<dyn LockManager>,
        limiter: Arc<ProjectLimiter>,
        dedup: DedupPolicy,
    ) -> Self {
        Self {
            queue,
            locks,
            limiter,
            dedup,
        }
    }

    /// Queue a batch of item ids under a key.
    ///
    /// The batch is validated here rather than at execution time: a key and
    /// at least one item id are required, item ids must be unique within
    /// the batch, and the context must be a JSON object. Dedup follows the
    /// configured [`DedupPolicy`]; a rejected duplicate reports the queue
    /// position of the batch it matched. Dedup is best-effort: it reads an
    /// eventually consistent queue snapshot, so concurrent enqueues from
    /// different processes can both be admitted.
    pub async fn enqueue(
        &self,
        key: impl IntoProjectKey,
        item_ids: Vec<String>,
        context: Value,
    ) -> Result<EnqueueReceipt> {
        let key = key.into_key();
        validate_enqueue(&key, &item_ids, &context)?;

        let queued = self.queue.snapshot().await?;
        for (position, existing) in queued.iter().enumerate() {
            if existing.key != key {
                continue;
            }
            let duplicate = match self.dedup {
                DedupPolicy::ProjectKey => true,
                DedupPolicy::ExactItems => {
                    existing.item_ids() == item_ids.iter().map(String::as_str).collect::<Vec<_>>()
                }
            };
            if duplicate {
                debug!(key = %key, position, "enqueue deduplicated against queued batch");
                return Ok(EnqueueReceipt {
                    queued: false,
                    position,
                });
            }
        }

        let batch = ProjectBatch::new(key.clone(), item_ids, context);
        let position = self.queue.push(batch).await?;
        info!(key = %key, position, "batch queued");
        Ok(EnqueueReceipt {
            queued: true,
            position,
        })
    }

    /// Best-effort removal of one not-yet-popped item. Returns `false` once
    /// the owning batch has been dispatched; the item will still complete
    /// and report a result.
    pub async fn cancel(&self, key: impl IntoProjectKey, item_id: &str) -> Result<bool> {
        let key = key.into_key();
        let cancelled = self.queue.remove_item(&key, item_id).await?;
        if cancelled {
            info!(key = %key, item_id, "queued item cancelled");
        } else {
            debug!(key = %key, item_id, "cancel missed, item already dispatched or unknown");
        }
        Ok(cancelled)
    }

    /// Where one key currently stands: queued (with position), executing
    /// (its lock is held somewhere in the cluster), or absent.
    pub async fn status(&self, key: impl IntoProjectKey) -> Result<KeyStatus> {
        let key = key.into_key();

        if self.limiter.is_executing(&key) || self.locks.held_keys().await?.contains(&key) {
            return Ok(KeyStatus {
                state: KeyState::Executing,
                position: None,
            });
        }

        let queued = self.queue.snapshot().await?;
        if let Some(position) = queued.iter().position(|b| b.key == key) {
            return Ok(KeyStatus {
                state: KeyState::Queued,
                position: Some(position),
            });
        }

        Ok(KeyStatus {
            state: KeyState::Absent,
            position: None,
        })
    }

    /// Queue depth plus cluster-wide and per-process execution state.
    pub async fn admin_status(&self) -> Result<AdminStatus> {
        let queue_depth = self.queue.len().await?;
        let mut locked_keys: Vec<String> = self
            .locks
            .held_keys()
            .await?
            .into_iter()
            .map(|k| k.to_string())
            .collect();
        locked_keys.sort();
        let mut executing_keys: Vec<String> = self
            .limiter
            .executing_keys()
            .into_iter()
            .map(|k| k.to_string())
            .collect();
        executing_keys.sort();

        Ok(AdminStatus {
            queue_depth,
            locked_keys,
            executing_keys,
        })
    }
}

fn validate_enqueue(key: &ProjectKey, item_ids: &[String], context: &Value) -> Result<()> {
    if key.as_str().is_empty() {
        return Err(ProjectQError::InvalidBatch("empty project key".into()));
    }
    if item_ids.is_empty() {
        return Err(ProjectQError::InvalidBatch("no work items".into()));
    }
    let mut seen = std::collections::HashSet::new();
    for id in item_ids {
        if id.is_empty() {
            return Err(ProjectQError::InvalidBatch("empty work item id".into()));
        }
        if !seen.insert(id.as_str()) {
            return Err(ProjectQError::InvalidBatch(format!(
                "duplicate work item id: {id}"
            )));
        }
    }
    if !context.is_object() {
        return Err(ProjectQError::InvalidBatch(
            "context must be a JSON object".into(),
        ));
    }
    Ok(())
}

/// Accept `&str`, `String`, or [`ProjectKey`] in the dispatcher's surface.
pub trait IntoProjectKey {
    /// Convert into a [`ProjectKey`].
    fn into_key(self) -> ProjectKey;
}

impl IntoProjectKey for ProjectKey {
    fn into_key(self) -> ProjectKey {
        self
    }
}

impl IntoProjectKey for &str {
    fn into_key(self) -> ProjectKey {
        ProjectKey::new(self)
    }
}

impl IntoProjectKey for String {
    fn into_key(self) -> ProjectKey {
        ProjectKey::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validation_rejects_bad_batches() {
        let key: ProjectKey = "p1".into();
        let ids = vec!["a".to_string(), "b".to_string()];

        assert!(validate_enqueue(&key, &ids, &json!({})).is_ok());
        assert!(validate_enqueue(&"".into(), &ids, &json!({})).is_err());
        assert!(validate_enqueue(&key, &[], &json!({})).is_err());
        assert!(validate_enqueue(&key, &ids, &json!(null)).is_err());
        assert!(validate_enqueue(&key, &ids, &json!("ctx")).is_err());

        let dupes = vec!["a".to_string(), "a".to_string()];
        assert!(validate_enqueue(&key, &dupes, &json!({})).is_err());
    }
}
