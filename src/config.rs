//! Configuration for the queue, lock manager, limiter, and worker service.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What happens to the remaining items of a key's batch after one item fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip the remaining items of that key's batch (other keys unaffected)
    FailFast,
    /// Keep executing the remaining items, recording each result
    Continue,
}

/// How a repeated `enqueue` call is matched against already-queued batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// Any queued batch for the same key rejects the new one
    ProjectKey,
    /// Only a queued batch with the same key and identical ordered item ids
    /// rejects the new one
    ExactItems,
}

/// Distributed queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Backing-store connection string
    pub redis_url: String,
    /// Prefix for every store key this instance touches
    pub key_prefix: String,
    /// How long an idle worker sleeps between pop attempts
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379/0".to_string(),
            key_prefix: "projectq:".to_string(),
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// Lease lock configuration.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lease duration; a lock older than this is free and stealable
    pub ttl: Duration,
    /// How often a holder renews; must be well under `ttl`
    pub renewal_interval: Duration,
    /// Base delay before a contended batch is retried
    pub retry_backoff_base: Duration,
    /// Cap for the contention retry delay
    pub retry_backoff_max: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            renewal_interval: Duration::from_secs(10),
            retry_backoff_base: Duration::from_millis(250),
            retry_backoff_max: Duration::from_secs(5),
        }
    }
}

/// In-process limiter configuration.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Maximum simultaneous actions across all keys in this process
    pub global_ceiling: usize,
    /// Behavior after the first failed item of a key's batch
    pub failure_policy: FailurePolicy,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            global_ceiling: 128,
            failure_policy: FailurePolicy::FailFast,
        }
    }
}

/// Top-level configuration for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Cluster-unique identity used as the lock holder id
    pub holder_id: String,
    /// Maximum batches one worker processes at the same time
    pub max_concurrent_batches: usize,
    /// Queue settings
    pub queue: QueueConfig,
    /// Lock settings
    pub lock: LockConfig,
    /// Limiter settings
    pub limiter: LimiterConfig,
    /// Enqueue dedup matching
    pub dedup: DedupPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            holder_id: format!("worker-{}", Uuid::new_v4()),
            max_concurrent_batches: 16,
            queue: QueueConfig::default(),
            lock: LockConfig::default(),
            limiter: LimiterConfig::default(),
            dedup: DedupPolicy::ExactItems,
        }
    }
}
