//! Worker service: the long-running pop → lock → execute → renew/release
//! loop one machine runs against the shared queue.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{watch, Semaphore};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{LockConfig, WorkerConfig};
use crate::executor::{ItemExecutor, ResultSink};
use crate::limiter::ProjectLimiter;
use crate::lock::LockManager;
use crate::metrics;
use crate::queue::BatchQueue;
use crate::types::{ProjectBatch, ProjectKey};
use crate::{ProjectQError, Result};

/// One machine's worker: pops batches, guards each behind its key's
/// distributed lock, and executes it through the local limiter.
#[derive(Clone)]
pub struct WorkerService {
    queue: Arc<dyn BatchQueue>,
    locks: Arc<dyn LockManager>,
    limiter: Arc<ProjectLimiter>,
    executor: Arc<dyn ItemExecutor>,
    sink: Arc<dyn ResultSink>,
    config: WorkerConfig,
}

impl WorkerService {
    /// Assemble a worker over the given collaborators.
    pub fn new(
        queue: Arc<dyn BatchQueue>,
        locks: Arc<dyn LockManager>,
        limiter: Arc<ProjectLimiter>,
        executor: Arc<dyn ItemExecutor>,
        sink: Arc<dyn ResultSink>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            locks,
            limiter,
            executor,
            sink,
            config,
        }
    }

    /// Run the worker loop until `shutdown` flips to `true`.
    ///
    /// Graceful shutdown stops popping and waits for in-flight batches to
    /// finish. Abrupt death needs no cleanup: held leases expire on their
    /// own and the keys become stealable.
    #[instrument(skip_all, fields(holder = %self.config.holder_id))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            poll_ms = self.config.queue.poll_interval.as_millis() as u64,
            ttl_ms = self.config.lock.ttl.as_millis() as u64,
            "worker starting"
        );
        let max_inflight = inflight_limit(&self.config);
        let inflight = Arc::new(Semaphore::new(max_inflight as usize));
        let mut infra_failures = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = inflight.clone().acquire_owned() => {
                    permit.map_err(|_| ProjectQError::SemaphoreClosed)?
                }
                _ = shutdown.changed() => continue,
            };

            let popped = match self.queue.try_pop().await {
                Ok(popped) => {
                    infra_failures = 0;
                    popped
                }
                Err(err) => {
                    // TransientInfraError: the batch is still queued, so
                    // back off and retry the pop.
                    infra_failures += 1;
                    let delay = jittered_backoff(&self.config.lock, infra_failures);
                    warn!(
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "queue store unreachable, backing off"
                    );
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            };

            let Some(batch) = popped else {
                drop(permit);
                tokio::select! {
                    _ = sleep(self.config.queue.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };

            let acquired = match self
                .locks
                .try_acquire(&batch.key, &self.config.holder_id, self.config.lock.ttl)
                .await
            {
                Ok(acquired) => acquired,
                Err(err) => {
                    warn!(key = %batch.key, error = %err, "lock store unreachable, requeueing batch");
                    self.requeue_or_die(batch, self.config.lock.retry_backoff_base)
                        .await?;
                    continue;
                }
            };

            if !acquired {
                // Expected contention: another machine is serializing this
                // key right now. Back of the line, with jitter so a herd of
                // workers spreads out.
                metrics::record_lock_contention();
                let delay = jittered_backoff(&self.config.lock, 1);
                debug!(
                    key = %batch.key,
                    retry_in_ms = delay.as_millis() as u64,
                    "lock contention, requeueing batch"
                );
                self.requeue_or_die(batch, delay).await?;
                continue;
            }

            let worker = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                worker.process_batch(batch).await;
            });
        }

        // Drain: every in-flight batch holds one permit.
        let _ = inflight
            .acquire_many(max_inflight)
            .await
            .map_err(|_| ProjectQError::SemaphoreClosed)?;
        info!("worker drained, shutting down");
        Ok(())
    }

    /// Execute one locked batch: renewal task in the background, items
    /// through the limiter, lock released at the end.
    #[instrument(skip_all, fields(key = %batch.key, batch_id = %batch.id))]
    async fn process_batch(&self, batch: ProjectBatch) {
        let (fence_tx, fence_rx) = watch::channel(false);
        let renewer = tokio::spawn(renewal_loop(
            self.locks.clone(),
            batch.key.clone(),
            self.config.holder_id.clone(),
            self.config.lock.clone(),
            fence_tx,
        ));

        let outcome = self
            .limiter
            .execute_batch(&batch, self.executor.clone(), self.sink.clone(), Some(fence_rx))
            .await;
        renewer.abort();

        // Holder-compared release: a no-op if the lease already expired or
        // was stolen, so calling it after a fence is safe.
        if let Err(err) = self.locks.release(&batch.key, &self.config.holder_id).await {
            warn!(key = %batch.key, error = %err, "lock release failed, lease will expire on its own");
        }

        match outcome {
            Ok(outcome) => {
                // Fenced items were popped but never ran; requeue them so
                // another holder picks them up once the key's lock frees.
                if outcome.fenced && !outcome.skipped.is_empty() {
                    let remainder = ProjectBatch::new(
                        batch.key.clone(),
                        outcome.skipped.clone(),
                        batch.context.clone(),
                    );
                    let delay = jittered_backoff(&self.config.lock, 1);
                    if let Err(err) = self.requeue_or_die(remainder, delay).await {
                        error!(key = %batch.key, error = %err, "fenced remainder lost, requeue failed");
                    }
                }
                let status = if outcome.fenced {
                    "fenced"
                } else if outcome.all_succeeded() {
                    "completed"
                } else {
                    "partial"
                };
                metrics::record_batch(status);
                info!(
                    status,
                    executed = outcome.results.len(),
                    skipped = outcome.skipped.len(),
                    "batch finished"
                );
            }
            Err(err) => {
                metrics::record_batch("error");
                error!(error = %err, "batch execution failed");
            }
        }
    }

    /// Requeue a popped batch, retrying the store a few times. A popped
    /// batch must never be dropped silently; if the store stays down the
    /// worker loop surfaces the error instead.
    async fn requeue_or_die(&self, batch: ProjectBatch, delay: Duration) -> Result<()> {
        for attempt in 1..=3u32 {
            match self.queue.requeue_delayed(batch.clone(), delay).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < 3 => {
                    warn!(key = %batch.key, attempt, error = %err, "requeue failed, retrying");
                    sleep(jittered_backoff(&self.config.lock, attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
        unreachable!("loop returns on success or final error")
    }
}

/// Periodically renew the lease; on any failure, trip the fence and stop.
/// The original holder must then suppress further side effects, since
/// another worker may already own the key.
async fn renewal_loop(
    locks: Arc<dyn LockManager>,
    key: ProjectKey,
    holder_id: String,
    config: LockConfig,
    fence: watch::Sender<bool>,
) {
    let mut ticker = tokio::time::interval(config.renewal_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick fires immediately

    loop {
        ticker.tick().await;
        match locks.renew(&key, &holder_id, config.ttl).await {
            Ok(true) => {
                debug!(key = %key, "lease renewed");
            }
            Ok(false) => {
                metrics::record_renewal_failure();
                warn!(key = %key, "lease lost, fencing");
                let _ = fence.send(true);
                break;
            }
            Err(err) => {
                // Possibly partitioned from the store; treat exactly like a
                // lost lease.
                metrics::record_renewal_failure();
                warn!(key = %key, error = %err, "lease renewal unreachable, fencing");
                let _ = fence.send(true);
                break;
            }
        }
    }
}

/// In-flight batch limit as permits, clamped so an oversized config value
/// never truncates.
fn inflight_limit(config: &WorkerConfig) -> u32 {
    config.max_concurrent_batches.min(u32::MAX as usize) as u32
}

/// Exponential backoff with multiplicative jitter, capped at the configured
/// maximum.
fn jittered_backoff(config: &LockConfig, attempt: u32) -> Duration {
    let exp = config
        .retry_backoff_base
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1).min(16)));
    let capped = exp.min(config.retry_backoff_max);
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    capped.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = LockConfig {
            retry_backoff_base: Duration::from_millis(100),
            retry_backoff_max: Duration::from_millis(800),
            ..Default::default()
        };

        for attempt in 1..=10 {
            let delay = jittered_backoff(&config, attempt);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn test_inflight_limit_clamps_oversized_config() {
        let mut config = WorkerConfig::default();
        config.max_concurrent_batches = 16;
        assert_eq!(inflight_limit(&config), 16);

        config.max_concurrent_batches = usize::MAX;
        assert_eq!(inflight_limit(&config), u32::MAX);
    }
}
