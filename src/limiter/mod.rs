//! In-process concurrency limiter: per-key serialization plus a global
//! admission ceiling.
//!
//! For a fixed key, item i+1's action never starts before item i's fully
//! returns, no matter how many other keys run concurrently. Distinct keys
//! run in parallel up to the process-wide ceiling, which queues FIFO
//! without key bias. Both waits are cooperative suspensions; actions
//! themselves run on spawned tasks so a slow external call never stalls
//! the driver.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, instrument, warn};

use crate::config::{FailurePolicy, LimiterConfig};
use crate::executor::{ItemExecutor, ResultSink};
use crate::metrics;
use crate::types::{BatchOutcome, ExecutionResult, ExecutionStatus, ProjectBatch, ProjectKey};
use crate::{ProjectQError, Result};

mod registry;

use registry::KeyRegistry;

/// Per-key serializer and global admission gate for one worker process.
pub struct ProjectLimiter {
    registry: KeyRegistry,
    admission: Arc<Semaphore>,
    config: LimiterConfig,
}

impl ProjectLimiter {
    /// Create a limiter with the configured ceiling and failure policy.
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            registry: KeyRegistry::new(),
            admission: Arc::new(Semaphore::new(config.global_ceiling.max(1))),
            config,
        }
    }

    /// Run one batch's items strictly in submission order.
    ///
    /// Every executed item produces an [`ExecutionResult`] that is recorded
    /// to `sink` as soon as the action returns. Under
    /// [`FailurePolicy::FailFast`] the first non-success aborts the
    /// remaining items of this batch; other keys are unaffected. A tripped
    /// `fence` (lost lease) stops further items from starting, while the
    /// in-flight item always runs to completion.
    #[instrument(skip_all, fields(key = %batch.key, batch_id = %batch.id, items = batch.items.len()))]
    pub async fn execute_batch(
        &self,
        batch: &ProjectBatch,
        executor: Arc<dyn ItemExecutor>,
        sink: Arc<dyn ResultSink>,
        fence: Option<watch::Receiver<bool>>,
    ) -> Result<BatchOutcome> {
        let entry = self.registry.checkin(&batch.key, batch.items.len());
        let mut results = Vec::with_capacity(batch.items.len());
        let mut skipped = Vec::new();
        let mut fenced = false;
        let mut abort = false;

        for (idx, item) in batch.items.iter().enumerate() {
            if fence_tripped(&fence) {
                fenced = true;
            }
            if fenced || abort {
                skipped.push(item.id.clone());
                self.registry.checkout(&batch.key, 1);
                continue;
            }

            // Both permits span the entire action: the serial permit is the
            // per-key turn token, the admission permit the process ceiling.
            // A closed semaphore means shutdown; nothing from this item on
            // will run, so the whole remaining checkin is released.
            let serial = match entry.serial.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    self.registry.checkout(&batch.key, batch.items.len() - idx);
                    return Err(ProjectQError::SemaphoreClosed);
                }
            };
            let admission = match self.admission.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    self.registry.checkout(&batch.key, batch.items.len() - idx);
                    return Err(ProjectQError::SemaphoreClosed);
                }
            };

            // The permit waits can be long; a lease may have been lost in
            // the meantime.
            if fence_tripped(&fence) {
                fenced = true;
                skipped.push(item.id.clone());
                self.registry.checkout(&batch.key, 1);
                continue;
            }

            self.registry.mark_executing(&batch.key);
            let start = Instant::now();
            let exec = executor.clone();
            let work_item_id = item.id.clone();
            let context = batch.context.clone();
            let joined =
                tokio::spawn(async move { exec.execute(&work_item_id, &context).await }).await;
            drop(admission);
            drop(serial);
            self.registry.clear_executing(&batch.key);

            let duration = start.elapsed();
            let (status, payload) = match joined {
                Ok(Ok(value)) => (ExecutionStatus::Success, value),
                Ok(Err(err)) => (ExecutionStatus::Failure, json!({ "error": err.to_string() })),
                Err(err) => (ExecutionStatus::Error, json!({ "error": err.to_string() })),
            };
            let result = ExecutionResult {
                work_item_id: item.id.clone(),
                status,
                payload,
                duration,
            };
            metrics::record_item(status.as_str(), duration.as_secs_f64());
            if let Err(err) = sink.record(&result).await {
                warn!(item = %item.id, error = %err, "result sink rejected record");
            }

            if status == ExecutionStatus::Success {
                debug!(item = %item.id, duration_ms = duration.as_millis() as u64, "item completed");
            } else {
                warn!(
                    item = %item.id,
                    status = status.as_str(),
                    duration_ms = duration.as_millis() as u64,
                    "item did not complete normally"
                );
                if self.config.failure_policy == FailurePolicy::FailFast {
                    abort = true;
                }
            }

            results.push(result);
            self.registry.checkout(&batch.key, 1);
        }

        if fenced {
            warn!(skipped = skipped.len(), "batch fenced before completion");
        }

        Ok(BatchOutcome {
            batch_id: batch.id,
            key: batch.key.clone(),
            results,
            skipped,
            fenced,
        })
    }

    /// Start every key's first item concurrently (bounded by the ceiling)
    /// and return once every key's full sequence completes.
    ///
    /// A failure in one key's sequence never aborts the other keys.
    #[instrument(skip_all, fields(keys = projects.len()))]
    pub async fn execute_multi_project(
        &self,
        projects: HashMap<ProjectKey, Vec<String>>,
        context: Value,
        executor: Arc<dyn ItemExecutor>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<HashMap<ProjectKey, BatchOutcome>> {
        let batches: Vec<ProjectBatch> = projects
            .into_iter()
            .map(|(key, item_ids)| ProjectBatch::new(key, item_ids, context.clone()))
            .collect();

        let runs = batches.iter().map(|batch| {
            let executor = executor.clone();
            let sink = sink.clone();
            async move {
                let outcome = self.execute_batch(batch, executor, sink, None).await;
                (batch.key.clone(), outcome)
            }
        });

        let mut outcomes = HashMap::new();
        let mut first_err: Option<ProjectQError> = None;
        for (key, run) in futures::future::join_all(runs).await {
            match run {
                Ok(outcome) => {
                    outcomes.insert(key, outcome);
                }
                Err(err) => {
                    error!(key = %key, error = %err, "batch execution failed");
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(outcomes),
        }
    }

    /// Keys currently executing an item in this process.
    pub fn executing_keys(&self) -> Vec<ProjectKey> {
        self.registry.executing_keys()
    }

    /// True when `key` is executing an item right now.
    pub fn is_executing(&self, key: &ProjectKey) -> bool {
        self.registry.is_executing(key)
    }

    /// Number of keys with pending or executing items; zero when idle.
    pub fn active_key_count(&self) -> usize {
        self.registry.active_key_count()
    }

    #[cfg(test)]
    fn close_admission(&self) {
        self.admission.close();
    }
}

fn fence_tripped(fence: &Option<watch::Receiver<bool>>) -> bool {
    fence.as_ref().map(|f| *f.borrow()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoopExecutor;

    #[async_trait]
    impl ItemExecutor for NoopExecutor {
        async fn execute(&self, _work_item_id: &str, _context: &Value) -> anyhow::Result<Value> {
            Ok(json!(null))
        }
    }

    struct NoopSink;

    #[async_trait]
    impl ResultSink for NoopSink {
        async fn record(&self, _result: &ExecutionResult) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// A closed admission gate surfaces as an error without pinning the
    /// key's registry entry.
    #[tokio::test]
    async fn test_closed_admission_gate_releases_key_state() {
        let limiter = ProjectLimiter::new(LimiterConfig::default());
        limiter.close_admission();

        let batch = ProjectBatch::new("p1".into(), vec!["a".into(), "b".into()], json!({}));
        let result = limiter
            .execute_batch(&batch, Arc::new(NoopExecutor), Arc::new(NoopSink), None)
            .await;

        assert!(matches!(result, Err(ProjectQError::SemaphoreClosed)));
        assert_eq!(limiter.active_key_count(), 0);
    }
}
