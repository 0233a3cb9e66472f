//! Core data model: work items, project batches, and execution results.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier under which execution must be serialized.
///
/// All items enqueued under the same key run strictly one-at-a-time,
/// cluster-wide; items under distinct keys run in parallel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectKey(String);

impl ProjectKey {
    /// Create a key from anything string-like.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The raw key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ProjectKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A single unit of work. Immutable once enqueued; owned by exactly one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Opaque identifier understood by the external executor
    pub id: String,
    /// Position within the owning batch (0-based submission order)
    pub position: usize,
}

/// An ordered set of work items submitted together under one project key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectBatch {
    /// Unique batch identity, assigned at enqueue time
    pub id: Uuid,
    /// Key under which the items are serialized
    pub key: ProjectKey,
    /// Items in submission order
    pub items: Vec<WorkItem>,
    /// Opaque execution context forwarded to every item's action
    pub context: Value,
    /// When the batch entered the queue
    pub enqueued_at: DateTime<Utc>,
}

impl ProjectBatch {
    /// Build a batch from ordered item ids, assigning positions.
    pub fn new(key: ProjectKey, item_ids: Vec<String>, context: Value) -> Self {
        let items = item_ids
            .into_iter()
            .enumerate()
            .map(|(position, id)| WorkItem { id, position })
            .collect();
        Self {
            id: Uuid::new_v4(),
            key,
            items,
            context,
            enqueued_at: Utc::now(),
        }
    }

    /// Ordered item ids, for dedup comparisons.
    pub fn item_ids(&self) -> Vec<&str> {
        self.items.iter().map(|i| i.id.as_str()).collect()
    }
}

/// Terminal status of one item's action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Action returned a payload
    Success,
    /// Action returned an error
    Failure,
    /// Action could not be run to a normal return (panic, join failure)
    Error,
}

impl ExecutionStatus {
    /// Lowercase label, used for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
        }
    }
}

/// Outcome of one item's action. Created once the action returns, never
/// mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// The item the result belongs to
    pub work_item_id: String,
    /// Terminal status
    pub status: ExecutionStatus,
    /// Action payload on success, error description otherwise
    pub payload: Value,
    /// Wall-clock duration of the action
    pub duration: Duration,
}

impl ExecutionResult {
    /// True when the action completed normally.
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// Aggregated outcome of one batch on one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// Identity of the executed batch
    pub batch_id: Uuid,
    /// The batch's project key
    pub key: ProjectKey,
    /// One result per item whose action actually ran, in execution order
    pub results: Vec<ExecutionResult>,
    /// Ids of items that never started (fail-fast skip or fencing)
    pub skipped: Vec<String>,
    /// True when the worker lost its lease mid-batch and stopped early
    pub fenced: bool,
}

impl BatchOutcome {
    /// True when every item ran and returned success.
    pub fn all_succeeded(&self) -> bool {
        self.skipped.is_empty() && self.results.iter().all(ExecutionResult::is_success)
    }
}
