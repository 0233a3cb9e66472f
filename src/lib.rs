//! # ProjectQ
//!
//! Per-project serialized batch execution with distributed locking and
//! horizontal fan-out across worker processes.
//!
//! ## Overview
//!
//! ProjectQ runs large numbers of independent work batches under two
//! simultaneous guarantees: items belonging to the same project key execute
//! strictly one-at-a-time in submission order, while items belonging to
//! different keys execute fully in parallel. The guarantees hold within one
//! process (per-key permits plus a global admission gate) and across a fleet
//! of workers (a shared distributed queue plus lease-based per-key locks with
//! crash self-healing).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use projectq::config::WorkerConfig;
//! use projectq::dispatch::Dispatcher;
//! use projectq::limiter::ProjectLimiter;
//! use projectq::lock::MemoryLockManager;
//! use projectq::queue::MemoryQueue;
//! use serde_json::json;
//!
//! # async fn example() -> projectq::Result<()> {
//! let queue = Arc::new(MemoryQueue::new());
//! let locks = Arc::new(MemoryLockManager::new());
//! let config = WorkerConfig::default();
//! let limiter = Arc::new(ProjectLimiter::new(config.limiter.clone()));
//!
//! let dispatcher = Dispatcher::new(queue, locks, limiter, config.dedup);
//! let receipt = dispatcher
//!     .enqueue("project-1", vec!["t1".into(), "t2".into()], json!({"tenant": "acme"}))
//!     .await?;
//! assert!(receipt.queued);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`types`]: Work items, batches, and execution results
//! - [`config`]: Queue, lock, limiter, and worker configuration
//! - [`queue`]: Durable shared FIFO of pending batches
//! - [`lock`]: Cluster-wide per-key lease locks
//! - [`limiter`]: In-process per-key serializer and global admission gate
//! - [`worker`]: Pop/lock/execute/renew/release service loop
//! - [`dispatch`]: Enqueue, cancel, and introspection surface
//! - [`executor`]: External action and result-sink contracts

#![warn(missing_docs)]

use thiserror::Error;

/// Result type for ProjectQ operations
pub type Result<T> = std::result::Result<T, ProjectQError>;

/// Main error type for ProjectQ operations
#[derive(Error, Debug)]
pub enum ProjectQError {
    /// Batch rejected at enqueue time (empty items, duplicate ids, bad context)
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// Queue backend failure (store unreachable, payload corrupt)
    #[error("queue error: {0}")]
    Queue(String),

    /// Lock backend failure
    #[error("lock error: {0}")]
    Lock(String),

    /// Redis store error
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Join error from async tasks
    #[error("async join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// An internal semaphore was closed during shutdown
    #[error("semaphore closed")]
    SemaphoreClosed,

    /// Generic error for unexpected conditions
    #[error("internal error: {0}")]
    Internal(String),
}

/// Work items, batches, and execution results
pub mod types;

/// Configuration for queue, locks, limiter, and worker
pub mod config;

/// Distributed queue of pending batches
pub mod queue;

/// Distributed per-key lease locks
pub mod lock;

/// In-process concurrency limiter
pub mod limiter;

/// External action and result-sink contracts
pub mod executor;

/// Worker service loop
pub mod worker;

/// Dispatch and admin surface
pub mod dispatch;

/// Prometheus metrics
pub mod metrics;

pub use config::{DedupPolicy, FailurePolicy, WorkerConfig};
pub use dispatch::Dispatcher;
pub use executor::{ItemExecutor, ResultSink};
pub use limiter::ProjectLimiter;
pub use types::{BatchOutcome, ExecutionResult, ExecutionStatus, ProjectBatch, ProjectKey, WorkItem};
pub use worker::WorkerService;
