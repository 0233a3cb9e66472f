use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use projectq::config::{DedupPolicy, LimiterConfig};
use projectq::dispatch::{Dispatcher, KeyState};
use projectq::limiter::ProjectLimiter;
use projectq::lock::{LockManager, MemoryLockManager};
use projectq::queue::MemoryQueue;
use projectq::ProjectQError;

fn dispatcher(dedup: DedupPolicy) -> (Dispatcher, Arc<MemoryLockManager>) {
    let queue = Arc::new(MemoryQueue::new());
    let locks = Arc::new(MemoryLockManager::new());
    let limiter = Arc::new(ProjectLimiter::new(LimiterConfig::default()));
    (
        Dispatcher::new(queue, locks.clone(), limiter, dedup),
        locks,
    )
}

fn ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_enqueue_reports_position() {
    let (dispatcher, _) = dispatcher(DedupPolicy::ExactItems);

    let first = dispatcher
        .enqueue("p1", ids(&["a"]), json!({}))
        .await
        .unwrap();
    assert!(first.queued);
    assert_eq!(first.position, 0);

    let second = dispatcher
        .enqueue("p2", ids(&["b"]), json!({}))
        .await
        .unwrap();
    assert!(second.queued);
    assert_eq!(second.position, 1);
}

/// Back-to-back enqueues with identical items for one key: the second is
/// rejected and points at the queued original.
#[tokio::test]
async fn test_exact_items_dedup_rejects_identical_batch() {
    let (dispatcher, _) = dispatcher(DedupPolicy::ExactItems);

    dispatcher
        .enqueue("p1", ids(&["a", "b"]), json!({}))
        .await
        .unwrap();
    let dup = dispatcher
        .enqueue("p1", ids(&["a", "b"]), json!({}))
        .await
        .unwrap();

    assert!(!dup.queued);
    assert_eq!(dup.position, 0);

    // A different item set for the same key queues separately.
    let other = dispatcher
        .enqueue("p1", ids(&["c"]), json!({}))
        .await
        .unwrap();
    assert!(other.queued);
    assert_eq!(other.position, 1);
}

/// Under the ProjectKey policy any queued batch for the key blocks a second
/// one, regardless of items.
#[tokio::test]
async fn test_project_key_dedup_rejects_any_second_batch() {
    let (dispatcher, _) = dispatcher(DedupPolicy::ProjectKey);

    dispatcher
        .enqueue("p1", ids(&["a"]), json!({}))
        .await
        .unwrap();
    let rejected = dispatcher
        .enqueue("p1", ids(&["b", "c"]), json!({}))
        .await
        .unwrap();

    assert!(!rejected.queued);
    assert_eq!(rejected.position, 0);
}

#[tokio::test]
async fn test_enqueue_validation() {
    let (dispatcher, _) = dispatcher(DedupPolicy::ExactItems);

    let empty_items = dispatcher.enqueue("p1", vec![], json!({})).await;
    assert!(matches!(empty_items, Err(ProjectQError::InvalidBatch(_))));

    let bad_context = dispatcher.enqueue("p1", ids(&["a"]), json!(null)).await;
    assert!(matches!(bad_context, Err(ProjectQError::InvalidBatch(_))));

    let dup_ids = dispatcher.enqueue("p1", ids(&["a", "a"]), json!({})).await;
    assert!(matches!(dup_ids, Err(ProjectQError::InvalidBatch(_))));
}

/// Cancel removes a queued item; cancelling it again, or an unknown item,
/// reports false.
#[tokio::test]
async fn test_cancel_queued_item() {
    let (dispatcher, _) = dispatcher(DedupPolicy::ExactItems);

    dispatcher
        .enqueue("p1", ids(&["a", "b"]), json!({}))
        .await
        .unwrap();

    assert!(dispatcher.cancel("p1", "a").await.unwrap());
    assert!(!dispatcher.cancel("p1", "a").await.unwrap());
    assert!(!dispatcher.cancel("p9", "zzz").await.unwrap());

    // Cancelling the last item drops the whole batch.
    assert!(dispatcher.cancel("p1", "b").await.unwrap());
    let status = dispatcher.status("p1").await.unwrap();
    assert_eq!(status.state, KeyState::Absent);
}

#[tokio::test]
async fn test_status_reflects_queue_and_locks() {
    let (dispatcher, locks) = dispatcher(DedupPolicy::ExactItems);

    let absent = dispatcher.status("p1").await.unwrap();
    assert_eq!(absent.state, KeyState::Absent);

    dispatcher
        .enqueue("p0", ids(&["x"]), json!({}))
        .await
        .unwrap();
    dispatcher
        .enqueue("p1", ids(&["a"]), json!({}))
        .await
        .unwrap();
    let queued = dispatcher.status("p1").await.unwrap();
    assert_eq!(queued.state, KeyState::Queued);
    assert_eq!(queued.position, Some(1));

    // A lock held anywhere in the cluster marks the key executing.
    assert!(locks
        .try_acquire(&"p2".into(), "other-machine", Duration::from_secs(30))
        .await
        .unwrap());
    let executing = dispatcher.status("p2").await.unwrap();
    assert_eq!(executing.state, KeyState::Executing);
    assert_eq!(executing.position, None);
}

#[tokio::test]
async fn test_admin_status_snapshot() {
    let (dispatcher, locks) = dispatcher(DedupPolicy::ExactItems);

    dispatcher
        .enqueue("p1", ids(&["a"]), json!({}))
        .await
        .unwrap();
    dispatcher
        .enqueue("p2", ids(&["b"]), json!({}))
        .await
        .unwrap();
    assert!(locks
        .try_acquire(&"p3".into(), "other-machine", Duration::from_secs(30))
        .await
        .unwrap());

    let status = dispatcher.admin_status().await.unwrap();
    assert_eq!(status.queue_depth, 2);
    assert_eq!(status.locked_keys, vec!["p3".to_string()]);
    assert!(status.executing_keys.is_empty());
}
