//! Local worker demonstration
//!
//! Runs the full enqueue → pop → lock → execute cycle against the in-memory
//! backends: three projects, items logged as they execute, same-key items
//! strictly in order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use projectq::config::WorkerConfig;
use projectq::dispatch::Dispatcher;
use projectq::executor::{ItemExecutor, ResultSink};
use projectq::limiter::ProjectLimiter;
use projectq::lock::MemoryLockManager;
use projectq::queue::{BatchQueue, MemoryQueue};
use projectq::types::ExecutionResult;
use projectq::{Result, WorkerService};
use serde_json::{json, Value};
use tokio::sync::watch;

struct PrintingExecutor;

#[async_trait]
impl ItemExecutor for PrintingExecutor {
    async fn execute(&self, work_item_id: &str, context: &Value) -> anyhow::Result<Value> {
        println!("  ▶ executing {work_item_id} (tenant {})", context["tenant"]);
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(json!({ "item": work_item_id }))
    }
}

struct PrintingSink;

#[async_trait]
impl ResultSink for PrintingSink {
    async fn record(&self, result: &ExecutionResult) -> anyhow::Result<()> {
        println!(
            "  ✔ {} finished as {} in {:?}",
            result.work_item_id,
            result.status.as_str(),
            result.duration
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter("projectq=debug")
        .init();

    println!("🗂  ProjectQ Local Worker Demonstration");
    println!("=======================================\n");

    let queue = Arc::new(MemoryQueue::new());
    let locks = Arc::new(MemoryLockManager::new());
    let config = WorkerConfig::default();
    let limiter = Arc::new(ProjectLimiter::new(config.limiter.clone()));

    let dispatcher = Dispatcher::new(queue.clone(), locks.clone(), limiter.clone(), config.dedup);

    println!("📥 Enqueueing three projects");
    for (key, items) in [
        ("alpha", vec!["a1", "a2", "a3"]),
        ("beta", vec!["b1", "b2"]),
        ("gamma", vec!["g1"]),
    ] {
        let receipt = dispatcher
            .enqueue(
                key,
                items.into_iter().map(String::from).collect(),
                json!({ "tenant": "demo" }),
            )
            .await?;
        println!("  {key} queued at position {}", receipt.position);
    }

    let worker = WorkerService::new(
        queue.clone(),
        locks,
        limiter,
        Arc::new(PrintingExecutor),
        Arc::new(PrintingSink),
        config,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let start = Instant::now();
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    // Give the worker time to drain all three batches, then stop it.
    while queue.len().await? > 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_millis(600)).await;
    let _ = shutdown_tx.send(true);
    handle.await??;

    println!("\n✅ All batches drained in {:?}", start.elapsed());
    println!("\n📊 Metrics snapshot:\n{}", projectq::metrics::export());
    Ok(())
}
