//! Contracts for the external collaborators: the action that runs one work
//! item and the sink that receives results.

use async_trait::async_trait;
use serde_json::Value;

use crate::types::ExecutionResult;

/// Opaque, possibly slow action invoked once per work item.
///
/// Implementations fetch the item's content from wherever it lives and do
/// the actual work; ProjectQ only guarantees when and where the call runs.
/// Errors become `Failure` results; they are never retried here.
#[async_trait]
pub trait ItemExecutor: Send + Sync {
    /// Run the action for one work item under the batch context.
    async fn execute(&self, work_item_id: &str, context: &Value) -> anyhow::Result<Value>;
}

/// Destination for execution results. Called once per executed item; no
/// retry is attempted on the sink's behalf.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Record one result.
    async fn record(&self, result: &ExecutionResult) -> anyhow::Result<()>;
}
