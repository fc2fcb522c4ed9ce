//! Long-lived execution workers.
//!
//! Each worker loops: dequeue a request, lease a worktree, invoke the
//! runner under the per-request timeout, classify the outcome, update
//! the queue, and release the lease. Release happens on every exit path
//! of an iteration, so a failing runner can never leak a lease or poison
//! another request.

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::pool::{WorktreeLease, WorktreePool};
use crate::queue::TestQueue;
use crate::request::TestRequest;
use crate::result::{TestResult, TestStatus};
use crate::runner::TestRunner;

/// Where a worker is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Fetching,
    Leasing,
    Running,
    Finalising,
    Stopped,
}

/// Read-only view of a worker for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: usize,
    pub state: WorkerState,
    pub current_request: Option<String>,
    pub current_worktree: Option<String>,
}

struct WorkerStatus {
    state: WorkerState,
    current_request: Option<String>,
    current_worktree: Option<String>,
}

pub struct Worker {
    id: usize,
    queue: Arc<TestQueue>,
    pool: Arc<WorktreePool>,
    runner: Arc<dyn TestRunner>,
    default_timeout: Duration,
    dequeue_timeout: Duration,
    stop: AtomicBool,
    status: StdMutex<WorkerStatus>,
}

impl Worker {
    pub fn new(
        id: usize,
        queue: Arc<TestQueue>,
        pool: Arc<WorktreePool>,
        runner: Arc<dyn TestRunner>,
        default_timeout: Duration,
        dequeue_timeout: Duration,
    ) -> Self {
        Self {
            id,
            queue,
            pool,
            runner,
            default_timeout,
            dequeue_timeout,
            stop: AtomicBool::new(false),
            status: StdMutex::new(WorkerStatus {
                state: WorkerState::Idle,
                current_request: None,
                current_worktree: None,
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Ask the worker to exit. A running execution is allowed to finish
    /// its current attempt; the flag is observed on the next dequeue.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let status = self.status.lock().unwrap();
        WorkerSnapshot {
            id: self.id,
            state: status.state,
            current_request: status.current_request.clone(),
            current_worktree: status.current_worktree.clone(),
        }
    }

    fn set_status(
        &self,
        state: WorkerState,
        request: Option<&str>,
        worktree: Option<&str>,
    ) {
        let mut status = self.status.lock().unwrap();
        status.state = state;
        status.current_request = request.map(str::to_string);
        status.current_worktree = worktree.map(str::to_string);
    }

    /// Main loop. Runs until a stop is requested and the queue has
    /// nothing to hand out within the dequeue timeout.
    pub async fn run(self: Arc<Self>) {
        debug!("Worker {} started", self.id);
        loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            self.set_status(WorkerState::Fetching, None, None);
            match self.queue.dequeue(self.dequeue_timeout).await {
                Some(request) => self.process(request).await,
                None => {
                    // Timeout: the chance to observe the stop flag.
                    self.set_status(WorkerState::Idle, None, None);
                }
            }
        }
        self.set_status(WorkerState::Stopped, None, None);
        debug!("Worker {} stopped", self.id);
    }

    async fn process(&self, request: TestRequest) {
        let request_id = request.id.clone();
        self.set_status(WorkerState::Leasing, Some(&request_id), None);

        let lease = match self.pool.acquire().await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(
                    "Worker {}: lease acquisition failed for {}: {}",
                    self.id, request_id, e
                );
                let now = Utc::now();
                let result = self.synthetic_error(&request, None, now, format!("lease acquisition failed: {e}"));
                self.finalise(&request, result, None).await;
                return;
            }
        };

        self.set_status(WorkerState::Running, Some(&request_id), Some(&lease.id));
        let timeout = request.config.timeout.unwrap_or(self.default_timeout);
        let started_at = Utc::now();

        let outcome = tokio::time::timeout(
            timeout,
            self.runner.run(
                &lease.path,
                &request.plan_path,
                &request.batch_range,
                &request.config,
            ),
        )
        .await;

        self.set_status(WorkerState::Finalising, Some(&request_id), Some(&lease.id));
        let completed_at = Utc::now();

        let result = match outcome {
            Ok(Ok(runner_result)) => TestResult {
                request_id: request_id.clone(),
                worktree_id: Some(lease.id.clone()),
                worker_id: self.id,
                status: runner_result.status,
                tasks_passed: runner_result.tasks_passed,
                tasks_failed: runner_result.tasks_failed,
                started_at,
                completed_at,
                error_message: runner_result.error,
                report_path: runner_result.report_path,
            },
            Ok(Err(e)) => {
                warn!("Worker {}: runner error for {}: {:#}", self.id, request_id, e);
                self.synthetic_error(&request, Some(&lease), started_at, format!("runner error: {e:#}"))
            }
            Err(_) => {
                warn!(
                    "Worker {}: request {} timed out after {:?}",
                    self.id, request_id, timeout
                );
                self.synthetic_error(
                    &request,
                    Some(&lease),
                    started_at,
                    format!("runner timed out after {timeout:?}"),
                )
            }
        };

        self.finalise(&request, result, Some(lease)).await;
    }

    /// Classify the outcome, update the queue, release the lease, and
    /// return to idle. Runs for every attempt, whatever happened.
    async fn finalise(
        &self,
        request: &TestRequest,
        result: TestResult,
        lease: Option<WorktreeLease>,
    ) {
        match result.status {
            TestStatus::Complete => {
                if let Err(e) = self.queue.mark_completed(&request.id, result).await {
                    error!("Worker {}: mark_completed failed: {}", self.id, e);
                }
            }
            TestStatus::Failed | TestStatus::Error => {
                if self.queue.requeue_for_retry(request).await {
                    debug!(
                        "Worker {}: {} re-enqueued ({} retries left)",
                        self.id,
                        request.id,
                        request.retries_remaining().saturating_sub(1)
                    );
                } else if let Err(e) = self.queue.mark_failed(&request.id, result).await {
                    error!("Worker {}: mark_failed failed: {}", self.id, e);
                }
            }
        }

        if let Some(lease) = lease {
            self.pool.release(lease).await;
        }
        self.set_status(WorkerState::Idle, None, None);
    }

    fn synthetic_error(
        &self,
        request: &TestRequest,
        lease: Option<&WorktreeLease>,
        started_at: chrono::DateTime<Utc>,
        message: String,
    ) -> TestResult {
        TestResult {
            request_id: request.id.clone(),
            worktree_id: lease.map(|l| l.id.clone()),
            worker_id: self.id,
            status: TestStatus::Error,
            tasks_passed: 0,
            tasks_failed: 0,
            started_at,
            completed_at: Utc::now(),
            error_message: Some(message),
            report_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::request::{BatchRange, RunnerConfig};
    use crate::runner::RunnerResult;
    use crate::subprocess::{GitDriver, ProcessError};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct FsGitDriver;

    #[async_trait]
    impl GitDriver for FsGitDriver {
        async fn create_worktree(
            &self,
            _repo: &Path,
            worktree_path: &Path,
            _branch: &str,
        ) -> Result<(), ProcessError> {
            std::fs::create_dir_all(worktree_path).unwrap();
            std::fs::write(worktree_path.join(".git"), "gitdir: stub").unwrap();
            Ok(())
        }

        async fn remove_worktree(
            &self,
            _repo: &Path,
            worktree_path: &Path,
        ) -> Result<(), ProcessError> {
            let _ = std::fs::remove_dir_all(worktree_path);
            Ok(())
        }

        async fn reset_worktree(&self, _w: &Path, _b: &str) -> Result<(), ProcessError> {
            Ok(())
        }

        async fn integrity_check(&self, _w: &Path) -> Result<bool, ProcessError> {
            Ok(true)
        }

        async fn delete_branch(&self, _r: &Path, _b: &str) -> Result<(), ProcessError> {
            Ok(())
        }

        async fn prune_worktrees(&self, _r: &Path) -> Result<(), ProcessError> {
            Ok(())
        }
    }

    struct ErroringRunner {
        invocations: AtomicUsize,
    }

    #[async_trait]
    impl TestRunner for ErroringRunner {
        async fn run(
            &self,
            _worktree_path: &Path,
            _plan_path: &Path,
            _batch_range: &BatchRange,
            _config: &RunnerConfig,
        ) -> anyhow::Result<RunnerResult> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("runner exploded"))
        }
    }

    async fn fixture(temp: &TempDir) -> (Arc<TestQueue>, Arc<WorktreePool>) {
        let queue = Arc::new(TestQueue::new(100));
        let pool = Arc::new(WorktreePool::new(
            PoolConfig {
                size: 1,
                base_dir: temp.path().join("worktrees"),
                repo_path: temp.path().join("repo"),
                branch_prefix: "quench".into(),
                keep_failed: false,
                max_recycle_attempts: 1,
            },
            Arc::new(FsGitDriver),
        ));
        pool.initialize().await.unwrap();
        (queue, pool)
    }

    #[tokio::test]
    async fn runner_error_releases_lease_and_marks_failed() {
        let temp = TempDir::new().unwrap();
        let (queue, pool) = fixture(&temp).await;
        let runner = Arc::new(ErroringRunner {
            invocations: AtomicUsize::new(0),
        });

        queue
            .enqueue(TestRequest::new("t1", "plan.yml").with_max_retries(0))
            .await
            .unwrap();

        let worker = Arc::new(Worker::new(
            0,
            queue.clone(),
            pool.clone(),
            runner.clone(),
            Duration::from_secs(5),
            Duration::from_millis(50),
        ));
        let request = queue.dequeue(Duration::from_millis(50)).await.unwrap();
        worker.process(request).await;

        assert_eq!(runner.invocations.load(Ordering::SeqCst), 1);
        let summary = queue.summary().await;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.running, 0);
        // The lease came back: a fresh acquire succeeds immediately.
        let lease = tokio::time::timeout(Duration::from_millis(200), pool.acquire())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.id, "wt-1");
    }

    #[tokio::test]
    async fn lease_failure_produces_synthetic_error_result() {
        let temp = TempDir::new().unwrap();
        let (queue, pool) = fixture(&temp).await;
        pool.cleanup().await;

        queue
            .enqueue(TestRequest::new("t1", "plan.yml").with_max_retries(0))
            .await
            .unwrap();
        let worker = Arc::new(Worker::new(
            0,
            queue.clone(),
            pool.clone(),
            Arc::new(ErroringRunner {
                invocations: AtomicUsize::new(0),
            }),
            Duration::from_secs(5),
            Duration::from_millis(50),
        ));
        let request = queue.dequeue(Duration::from_millis(50)).await.unwrap();
        worker.process(request).await;

        let results = queue.results().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, TestStatus::Error);
        assert!(results[0].worktree_id.is_none());
        assert!(results[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("lease acquisition failed"));
    }

    #[tokio::test]
    async fn stop_flag_ends_loop_after_timeout() {
        let temp = TempDir::new().unwrap();
        let (queue, pool) = fixture(&temp).await;
        let worker = Arc::new(Worker::new(
            0,
            queue,
            pool,
            Arc::new(ErroringRunner {
                invocations: AtomicUsize::new(0),
            }),
            Duration::from_secs(5),
            Duration::from_millis(20),
        ));
        let handle = tokio::spawn(worker.clone().run());
        tokio::time::sleep(Duration::from_millis(30)).await;
        worker.request_stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker should stop promptly")
            .unwrap();
        assert_eq!(worker.snapshot().state, WorkerState::Stopped);
    }
}
