//! Pending-work queue with status tracking and retry accounting.
//!
//! Every request id lives in exactly one of four disjoint collections:
//! pending, running, completed, or failed. All public operations take
//! the single internal mutex, so the disjointness invariant holds at
//! every observation point. Waiters on [`TestQueue::dequeue`] park on a
//! [`Notify`] signalled whenever pending gains an entry.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::error::HarnessError;
use crate::request::TestRequest;
use crate::result::TestResult;

/// Snapshot of queue accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub pending: usize,
    pub running: usize,
}

struct PendingEntry {
    priority: i32,
    seq: u64,
    request: TestRequest,
}

impl PartialEq for PendingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PendingEntry {}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: larger priority first, then FIFO among equals.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueInner {
    pending: BinaryHeap<PendingEntry>,
    running: HashMap<String, TestRequest>,
    completed: HashMap<String, TestResult>,
    failed: HashMap<String, TestResult>,
    /// Terminal request snapshots, keyed by id. Exposes the observed
    /// retry count after the fact.
    finished_requests: HashMap<String, TestRequest>,
    /// Ids in terminal order, for stable report output.
    completion_order: Vec<String>,
    /// Every id ever accepted; duplicates are rejected against this set
    /// for the lifetime of the session.
    submitted: HashSet<String>,
    next_seq: u64,
}

impl QueueInner {
    fn push_pending(&mut self, request: TestRequest) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push(PendingEntry {
            priority: request.priority,
            seq,
            request,
        });
    }
}

/// Thread-safe queue of test requests.
pub struct TestQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    items: Notify,
}

impl TestQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            capacity,
            items: Notify::new(),
        }
    }

    /// Add a request to pending. Rejects duplicates and enqueues above
    /// capacity synchronously, without mutating anything.
    pub async fn enqueue(&self, request: TestRequest) -> Result<(), HarnessError> {
        {
            let mut q = self.inner.lock().await;
            if q.submitted.contains(&request.id) {
                return Err(HarnessError::DuplicateId(request.id));
            }
            if q.pending.len() >= self.capacity {
                return Err(HarnessError::QueueFull {
                    capacity: self.capacity,
                });
            }
            q.submitted.insert(request.id.clone());
            q.push_pending(request);
        }
        self.items.notify_one();
        Ok(())
    }

    /// Add a batch atomically: either every request is accepted or none
    /// is. Returns the number enqueued.
    pub async fn enqueue_batch(&self, requests: Vec<TestRequest>) -> Result<usize, HarnessError> {
        let count = requests.len();
        {
            let mut q = self.inner.lock().await;
            if q.pending.len() + count > self.capacity {
                return Err(HarnessError::QueueFull {
                    capacity: self.capacity,
                });
            }
            let mut batch_ids = HashSet::new();
            for request in &requests {
                if q.submitted.contains(&request.id) || !batch_ids.insert(request.id.clone()) {
                    return Err(HarnessError::DuplicateId(request.id.clone()));
                }
            }
            for request in requests {
                q.submitted.insert(request.id.clone());
                q.push_pending(request);
            }
        }
        for _ in 0..count {
            self.items.notify_one();
        }
        Ok(count)
    }

    /// Blocking pop: highest priority first, FIFO among equals. The
    /// returned request is atomically claimed into `running`, so no id
    /// is ever outside all four collections. Returns `None` on timeout,
    /// which is how workers get a chance to observe their stop flag.
    pub async fn dequeue(&self, timeout: Duration) -> Option<TestRequest> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.items.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut q = self.inner.lock().await;
                if let Some(entry) = q.pending.pop() {
                    let request = entry.request;
                    q.running.insert(request.id.clone(), request.clone());
                    return Some(request);
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Explicit pending-to-running transition for callers that stage the
    /// two steps themselves. [`TestQueue::dequeue`] already claims, so
    /// this is a no-op for requests obtained through it.
    pub async fn mark_running(&self, request: &TestRequest) -> bool {
        let mut q = self.inner.lock().await;
        if q.running.contains_key(&request.id) {
            return true;
        }
        let entries: Vec<PendingEntry> = q.pending.drain().collect();
        let mut found = false;
        for entry in entries {
            if !found && entry.request.id == request.id {
                q.running.insert(entry.request.id.clone(), entry.request);
                found = true;
            } else {
                q.pending.push(entry);
            }
        }
        found
    }

    pub async fn mark_completed(&self, id: &str, result: TestResult) -> Result<(), HarnessError> {
        let mut q = self.inner.lock().await;
        let request = q
            .running
            .remove(id)
            .ok_or_else(|| HarnessError::UnknownRequest(id.to_string()))?;
        q.finished_requests.insert(id.to_string(), request);
        q.completed.insert(id.to_string(), result);
        q.completion_order.push(id.to_string());
        Ok(())
    }

    pub async fn mark_failed(&self, id: &str, result: TestResult) -> Result<(), HarnessError> {
        let mut q = self.inner.lock().await;
        let request = q
            .running
            .remove(id)
            .ok_or_else(|| HarnessError::UnknownRequest(id.to_string()))?;
        q.finished_requests.insert(id.to_string(), request);
        q.failed.insert(id.to_string(), result);
        q.completion_order.push(id.to_string());
        Ok(())
    }

    /// Move a running request back to pending for another attempt.
    /// Returns `false` when retries are exhausted; the caller must then
    /// mark the request failed.
    pub async fn requeue_for_retry(&self, request: &TestRequest) -> bool {
        {
            let mut q = self.inner.lock().await;
            let Some(mut owned) = q.running.remove(&request.id) else {
                return false;
            };
            if owned.retry_count >= owned.max_retries {
                // Not retryable after all; hand it back so the caller's
                // mark_failed finds it where it left it.
                q.running.insert(owned.id.clone(), owned);
                return false;
            }
            owned.retry_count += 1;
            debug!(
                "Re-enqueueing {} for retry {}/{}",
                owned.id, owned.retry_count, owned.max_retries
            );
            q.push_pending(owned);
        }
        self.items.notify_one();
        true
    }

    /// Block until pending and running are both empty.
    pub async fn wait_until_drained(&self, poll_interval: Duration) {
        loop {
            if self.is_drained().await {
                return;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    pub async fn is_drained(&self) -> bool {
        let q = self.inner.lock().await;
        q.pending.is_empty() && q.running.is_empty()
    }

    pub async fn summary(&self) -> QueueSummary {
        let q = self.inner.lock().await;
        QueueSummary {
            total: q.submitted.len(),
            passed: q.completed.len(),
            failed: q.failed.len(),
            pending: q.pending.len(),
            running: q.running.len(),
        }
    }

    /// Terminal results in completion order.
    pub async fn results(&self) -> Vec<TestResult> {
        let q = self.inner.lock().await;
        q.completion_order
            .iter()
            .filter_map(|id| q.completed.get(id).or_else(|| q.failed.get(id)))
            .cloned()
            .collect()
    }

    /// Terminal snapshot of a request, exposing its observed retry count.
    pub async fn finished_request(&self, id: &str) -> Option<TestRequest> {
        let q = self.inner.lock().await;
        q.finished_requests.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::TestStatus;
    use chrono::Utc;

    fn request(id: &str) -> TestRequest {
        TestRequest::new(id, "plans/sample.yml")
    }

    fn result_for(id: &str, status: TestStatus) -> TestResult {
        TestResult {
            request_id: id.to_string(),
            worktree_id: Some("wt-1".into()),
            worker_id: 0,
            status,
            tasks_passed: 0,
            tasks_failed: 0,
            started_at: Utc::now(),
            completed_at: Utc::now(),
            error_message: None,
            report_path: None,
        }
    }

    #[tokio::test]
    async fn fifo_among_equal_priorities() {
        let queue = TestQueue::new(10);
        for id in ["a", "b", "c"] {
            queue.enqueue(request(id)).await.unwrap();
        }
        for expected in ["a", "b", "c"] {
            let got = queue.dequeue(Duration::from_millis(50)).await.unwrap();
            assert_eq!(got.id, expected);
        }
    }

    #[tokio::test]
    async fn higher_priority_dispatches_first() {
        let queue = TestQueue::new(10);
        queue.enqueue(request("low")).await.unwrap();
        queue
            .enqueue(request("high").with_priority(10))
            .await
            .unwrap();
        let first = queue.dequeue(Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.id, "high");
    }

    #[tokio::test]
    async fn duplicate_rejected_even_after_completion() {
        let queue = TestQueue::new(10);
        queue.enqueue(request("a")).await.unwrap();
        let req = queue.dequeue(Duration::from_millis(50)).await.unwrap();
        queue
            .mark_completed(&req.id, result_for("a", TestStatus::Complete))
            .await
            .unwrap();

        let err = queue.enqueue(request("a")).await.unwrap_err();
        assert!(matches!(err, HarnessError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn enqueue_above_capacity_rejected() {
        let queue = TestQueue::new(2);
        queue.enqueue(request("a")).await.unwrap();
        queue.enqueue(request("b")).await.unwrap();
        let err = queue.enqueue(request("c")).await.unwrap_err();
        assert!(matches!(err, HarnessError::QueueFull { capacity: 2 }));
    }

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let queue = TestQueue::new(2);
        let err = queue
            .enqueue_batch(vec![request("a"), request("b"), request("c")])
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::QueueFull { .. }));
        // Nothing was admitted.
        let summary = queue.summary().await;
        assert_eq!(summary.total, 0);
        assert_eq!(summary.pending, 0);

        let err = queue
            .enqueue_batch(vec![request("x"), request("x")])
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::DuplicateId(_)));
        assert_eq!(queue.summary().await.total, 0);
    }

    #[tokio::test]
    async fn dequeue_times_out_on_empty_queue() {
        let queue = TestQueue::new(10);
        let got = queue.dequeue(Duration::from_millis(20)).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn dequeue_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(TestQueue::new(10));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(request("a")).await.unwrap();
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.id, "a");
    }

    #[tokio::test]
    async fn retry_increments_and_exhausts() {
        let queue = TestQueue::new(10);
        queue
            .enqueue(request("a").with_max_retries(1))
            .await
            .unwrap();

        let first = queue.dequeue(Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.retry_count, 0);
        assert!(queue.requeue_for_retry(&first).await);

        let second = queue.dequeue(Duration::from_millis(50)).await.unwrap();
        assert_eq!(second.retry_count, 1);
        assert!(!queue.requeue_for_retry(&second).await);

        // Exhausted: the request is still owned by running, so the
        // caller's mark_failed succeeds.
        queue
            .mark_failed(&second.id, result_for("a", TestStatus::Failed))
            .await
            .unwrap();
        let finished = queue.finished_request("a").await.unwrap();
        assert_eq!(finished.retry_count, 1);
    }

    #[tokio::test]
    async fn accounting_is_conserved() {
        let queue = TestQueue::new(10);
        queue
            .enqueue_batch(vec![request("a"), request("b"), request("c")])
            .await
            .unwrap();

        let a = queue.dequeue(Duration::from_millis(50)).await.unwrap();
        let summary = queue.summary().await;
        assert_eq!(
            summary.pending + summary.running + summary.passed + summary.failed,
            summary.total
        );

        queue
            .mark_completed(&a.id, result_for(&a.id, TestStatus::Complete))
            .await
            .unwrap();
        let b = queue.dequeue(Duration::from_millis(50)).await.unwrap();
        queue
            .mark_failed(&b.id, result_for(&b.id, TestStatus::Failed))
            .await
            .unwrap();

        let summary = queue.summary().await;
        assert_eq!(summary.total, 3);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.running, 0);
        assert_eq!(
            summary.pending + summary.running + summary.passed + summary.failed,
            summary.total
        );
    }

    #[tokio::test]
    async fn mark_running_claims_from_pending() {
        let queue = TestQueue::new(10);
        let req = request("a");
        queue.enqueue(req.clone()).await.unwrap();
        assert!(queue.mark_running(&req).await);
        let summary = queue.summary().await;
        assert_eq!(summary.running, 1);
        assert_eq!(summary.pending, 0);
        // Idempotent for an already-running request.
        assert!(queue.mark_running(&req).await);
    }

    #[tokio::test]
    async fn results_preserve_completion_order() {
        let queue = TestQueue::new(10);
        queue
            .enqueue_batch(vec![request("a"), request("b")])
            .await
            .unwrap();
        let a = queue.dequeue(Duration::from_millis(50)).await.unwrap();
        let b = queue.dequeue(Duration::from_millis(50)).await.unwrap();
        queue
            .mark_failed(&b.id, result_for(&b.id, TestStatus::Failed))
            .await
            .unwrap();
        queue
            .mark_completed(&a.id, result_for(&a.id, TestStatus::Complete))
            .await
            .unwrap();

        let results = queue.results().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].request_id, "b");
        assert_eq!(results[1].request_id, "a");
    }
}
