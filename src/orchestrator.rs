//! Session orchestration: pool + queue + workers composed into one
//! lifecycle with an aggregate report.
//!
//! The orchestrator owns nothing global; the runner and version-control
//! driver are injected at construction, so test doubles slot straight
//! in.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::pool::{PoolConfig, WorktreePool};
use crate::queue::{QueueSummary, TestQueue};
use crate::report::{derive_session_status, ParallelTestReport, ReportSummary, SessionStatus};
use crate::request::TestRequest;
use crate::runner::TestRunner;
use crate::subprocess::GitDriver;
use crate::worker::{Worker, WorkerSnapshot};

/// Cheap, lock-light status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub session_id: String,
    pub status: SessionStatus,
    pub progress: QueueSummary,
    pub workers: Vec<WorkerSnapshot>,
}

/// Runs one session of parallel test-plan execution.
pub struct ParallelOrchestrator {
    config: HarnessConfig,
    session_id: String,
    queue: Arc<TestQueue>,
    pool: Arc<WorktreePool>,
    workers: Vec<Arc<Worker>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    shutdown_started: AtomicBool,
    report_taken: AtomicBool,
    started_at: StdMutex<Option<DateTime<Utc>>>,
    completed_at: StdMutex<Option<DateTime<Utc>>>,
}

impl ParallelOrchestrator {
    pub fn new(
        config: HarnessConfig,
        runner: Arc<dyn TestRunner>,
        git: Arc<dyn GitDriver>,
    ) -> Self {
        let session_id = format!("session-{}", Uuid::new_v4());
        let queue = Arc::new(TestQueue::new(config.max_queue_size));
        let pool = Arc::new(WorktreePool::new(
            PoolConfig {
                size: config.num_workers,
                base_dir: config.worktree_base(),
                repo_path: config.repo_path.clone(),
                branch_prefix: config.branch_prefix.clone(),
                keep_failed: config.keep_failed_worktrees,
                max_recycle_attempts: config.max_recycle_attempts,
            },
            git,
        ));
        let workers = (0..config.num_workers)
            .map(|id| {
                Arc::new(Worker::new(
                    id,
                    queue.clone(),
                    pool.clone(),
                    runner.clone(),
                    config.default_timeout,
                    config.dequeue_timeout,
                ))
            })
            .collect();

        Self {
            config,
            session_id,
            queue,
            pool,
            workers,
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            shutdown_started: AtomicBool::new(false),
            report_taken: AtomicBool::new(false),
            started_at: StdMutex::new(None),
            completed_at: StdMutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Build the worktree pool. A partial pool is never exposed: any
    /// creation failure rolls back and surfaces as a setup error.
    pub async fn initialize(&self) -> Result<(), HarnessError> {
        self.config.validate()?;
        self.pool.initialize().await
    }

    /// Launch the workers. No-op when already started.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.started_at.lock().unwrap() = Some(Utc::now());
        let mut handles = self.handles.lock().await;
        for worker in &self.workers {
            handles.push(tokio::spawn(worker.clone().run()));
        }
        info!(
            "Session {} started with {} workers",
            self.session_id,
            self.workers.len()
        );
    }

    pub async fn submit_test(&self, request: TestRequest) -> Result<(), HarnessError> {
        self.check_accepting()?;
        self.queue.enqueue(request).await
    }

    /// Submit a batch atomically; either all requests are accepted or
    /// none is.
    pub async fn submit_batch(&self, requests: Vec<TestRequest>) -> Result<usize, HarnessError> {
        self.check_accepting()?;
        self.queue.enqueue_batch(requests).await
    }

    fn check_accepting(&self) -> Result<(), HarnessError> {
        if self.shutdown_started.load(Ordering::SeqCst) {
            return Err(HarnessError::ShutdownInProgress);
        }
        if self.report_taken.load(Ordering::SeqCst) {
            return Err(HarnessError::SessionConsumed(
                "submissions after wait_for_completion are rejected".to_string(),
            ));
        }
        Ok(())
    }

    /// Block until every submitted request is terminal, then produce the
    /// session report. Callable at most once per session.
    pub async fn wait_for_completion(&self) -> Result<ParallelTestReport, HarnessError> {
        if self.report_taken.swap(true, Ordering::SeqCst) {
            return Err(HarnessError::SessionConsumed(
                "wait_for_completion was already called".to_string(),
            ));
        }
        self.queue.wait_until_drained(self.config.drain_poll).await;
        let now = Utc::now();
        *self.completed_at.lock().unwrap() = Some(now);
        debug!("Session {} drained", self.session_id);
        Ok(self.build_report().await)
    }

    /// Stop the workers, wait for them to exit, and destroy the pool.
    /// Idempotent. A running worker finishes its current attempt first,
    /// which keeps every lease releasable.
    pub async fn shutdown(&self) {
        if !self.shutdown_started.swap(true, Ordering::SeqCst) {
            for worker in &self.workers {
                worker.request_stop();
            }
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().await;
            guard.drain(..).collect()
        };
        if !handles.is_empty() {
            for result in futures::future::join_all(handles).await {
                if let Err(e) = result {
                    warn!("Worker task join failed: {}", e);
                }
            }
        }
        self.pool.cleanup().await;
        info!("Session {} shut down", self.session_id);
    }

    /// Read-only view over session, queue, and worker state.
    pub async fn get_status(&self) -> OrchestratorStatus {
        let progress = self.queue.summary().await;
        let completed_at = *self.completed_at.lock().unwrap();
        OrchestratorStatus {
            session_id: self.session_id.clone(),
            status: derive_session_status(
                progress.total,
                progress.passed,
                progress.failed,
                completed_at,
            ),
            progress,
            workers: self.workers.iter().map(|w| w.snapshot()).collect(),
        }
    }

    /// Terminal snapshot of a request, exposing its observed retry
    /// count.
    pub async fn finished_request(&self, id: &str) -> Option<TestRequest> {
        self.queue.finished_request(id).await
    }

    /// Convenience: initialize, start, submit, wait, shut down.
    pub async fn run_tests(
        &self,
        requests: Vec<TestRequest>,
    ) -> Result<ParallelTestReport, HarnessError> {
        self.initialize().await?;
        self.start().await;

        let outcome = async {
            if !requests.is_empty() {
                self.submit_batch(requests).await?;
            }
            self.wait_for_completion().await
        }
        .await;

        self.shutdown().await;
        outcome
    }

    /// Scoped acquisition: run `f` against a started orchestrator with
    /// `shutdown` guaranteed on every exit path.
    pub async fn scoped<F, Fut, T>(
        config: HarnessConfig,
        runner: Arc<dyn TestRunner>,
        git: Arc<dyn GitDriver>,
        f: F,
    ) -> Result<T, HarnessError>
    where
        F: FnOnce(Arc<ParallelOrchestrator>) -> Fut,
        Fut: Future<Output = Result<T, HarnessError>>,
    {
        let orchestrator = Arc::new(Self::new(config, runner, git));
        if let Err(e) = orchestrator.initialize().await {
            orchestrator.shutdown().await;
            return Err(e);
        }
        orchestrator.start().await;
        let result = f(orchestrator.clone()).await;
        orchestrator.shutdown().await;
        result
    }

    async fn build_report(&self) -> ParallelTestReport {
        let summary = self.queue.summary().await;
        let results = self.queue.results().await;
        let warnings = self.pool.take_warnings();
        let started_at = self
            .started_at
            .lock()
            .unwrap()
            .unwrap_or_else(Utc::now);
        let completed_at = self
            .completed_at
            .lock()
            .unwrap()
            .unwrap_or_else(Utc::now);

        ParallelTestReport {
            session_id: self.session_id.clone(),
            status: derive_session_status(
                summary.total,
                summary.passed,
                summary.failed,
                Some(completed_at),
            ),
            started_at,
            completed_at,
            duration_seconds: (completed_at - started_at).num_milliseconds() as f64 / 1000.0,
            num_workers: self.workers.len(),
            summary: ReportSummary {
                total: summary.total,
                passed: summary.passed,
                failed: summary.failed,
            },
            results,
            warnings,
        }
    }
}
