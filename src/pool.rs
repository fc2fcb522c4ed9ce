//! Fixed pool of isolated git worktrees, leased exclusively to workers.
//!
//! Each lease owns a dedicated working directory and branch; the shared
//! object database is only ever appended to, so concurrent executions
//! cannot corrupt the underlying repository. A lease is reset to a
//! clean, verified state on every release before it can be acquired
//! again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::error::HarnessError;
use crate::subprocess::GitDriver;

/// Pool construction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of worktrees; fixed for the life of the pool (it may only
    /// shrink when a lease becomes unrecoverable).
    pub size: usize,
    /// Directory that holds the worktrees, one subdirectory per lease.
    pub base_dir: PathBuf,
    /// The repository worktrees are linked to.
    pub repo_path: PathBuf,
    /// Branch names are `<prefix>/wt-N`.
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Preserve a lease's directory for diagnosis instead of deleting it
    /// when it becomes unrecoverable.
    #[serde(default)]
    pub keep_failed: bool,
    /// Destroy-and-recreate attempts after a failed reset before the
    /// lease is retired.
    #[serde(default = "default_recycle_attempts")]
    pub max_recycle_attempts: u32,
}

fn default_branch_prefix() -> String {
    "quench".to_string()
}

fn default_recycle_attempts() -> u32 {
    2
}

/// Exclusive right to use one worktree for one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeLease {
    pub id: String,
    pub path: PathBuf,
    pub branch: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseStatus {
    Free,
    Busy,
    Error,
}

struct LeaseSlot {
    lease: WorktreeLease,
    status: LeaseStatus,
}

/// Pool of worktree leases.
pub struct WorktreePool {
    config: PoolConfig,
    git: Arc<dyn GitDriver>,
    slots: Mutex<Vec<LeaseSlot>>,
    freed: Notify,
    shutdown: AtomicBool,
    warnings: StdMutex<Vec<String>>,
}

impl WorktreePool {
    pub fn new(config: PoolConfig, git: Arc<dyn GitDriver>) -> Self {
        Self {
            config,
            git,
            slots: Mutex::new(Vec::new()),
            freed: Notify::new(),
            shutdown: AtomicBool::new(false),
            warnings: StdMutex::new(Vec::new()),
        }
    }

    /// Create the full set of worktrees. Any creation failure rolls back
    /// everything already created; a partial pool is never exposed.
    pub async fn initialize(&self) -> Result<(), HarnessError> {
        self.remove_stale_directories().await?;
        tokio::fs::create_dir_all(&self.config.base_dir).await?;

        let mut created: Vec<LeaseSlot> = Vec::with_capacity(self.config.size);
        for n in 1..=self.config.size {
            let id = format!("wt-{n}");
            let path = self.config.base_dir.join(&id);
            let branch = format!("{}/{}", self.config.branch_prefix, id);

            // A branch left behind by a crashed session blocks creation.
            let _ = self.git.delete_branch(&self.config.repo_path, &branch).await;

            match self
                .git
                .create_worktree(&self.config.repo_path, &path, &branch)
                .await
            {
                Ok(()) => {
                    debug!("Created worktree {} on {}", id, branch);
                    let now = Utc::now();
                    created.push(LeaseSlot {
                        lease: WorktreeLease {
                            id,
                            path,
                            branch,
                            created_at: now,
                            last_used: now,
                        },
                        status: LeaseStatus::Free,
                    });
                }
                Err(e) => {
                    warn!("Worktree creation failed for {}; rolling back", id);
                    for slot in &created {
                        self.destroy_lease(&slot.lease).await;
                    }
                    return Err(HarnessError::Setup(format!("creating worktree {id}: {e}")));
                }
            }
        }

        info!(
            "Worktree pool ready: {} leases under {}",
            created.len(),
            self.config.base_dir.display()
        );
        *self.slots.lock().await = created;
        Ok(())
    }

    /// Hand the caller exclusive ownership of a free lease, blocking
    /// until one is available. Never returns an errored lease. Fails
    /// once shutdown begins or when no usable lease can ever become
    /// free again.
    pub async fn acquire(&self) -> Result<WorktreeLease, HarnessError> {
        loop {
            let notified = self.freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shutdown.load(Ordering::SeqCst) {
                return Err(HarnessError::Lease("pool is shut down".to_string()));
            }

            {
                let mut slots = self.slots.lock().await;
                if let Some(slot) = slots.iter_mut().find(|s| s.status == LeaseStatus::Free) {
                    slot.status = LeaseStatus::Busy;
                    slot.lease.last_used = Utc::now();
                    return Ok(slot.lease.clone());
                }
                // Busy leases will come back; errored ones will not.
                if !slots.iter().any(|s| s.status == LeaseStatus::Busy) {
                    return Err(HarnessError::Lease(
                        "no usable worktrees remain in the pool".to_string(),
                    ));
                }
            }

            notified.await;
        }
    }

    /// Return a lease to the pool. The worktree is reset to a clean,
    /// verified state first; failures are absorbed (the lease is
    /// recycled or retired internally) and never propagate to the
    /// caller.
    pub async fn release(&self, lease: WorktreeLease) {
        if self.shutdown.load(Ordering::SeqCst) {
            // Cleanup owns the worktrees now; just give the slot back.
            let mut slots = self.slots.lock().await;
            if let Some(slot) = slots.iter_mut().find(|s| s.lease.id == lease.id) {
                slot.status = LeaseStatus::Free;
            }
            self.freed.notify_waiters();
            return;
        }

        let healthy = self.recycle(&lease).await;

        let mut slots = self.slots.lock().await;
        let Some(idx) = slots.iter().position(|s| s.lease.id == lease.id) else {
            return;
        };
        if healthy {
            slots[idx].status = LeaseStatus::Free;
            slots[idx].lease.last_used = Utc::now();
            drop(slots);
            self.freed.notify_one();
        } else {
            slots[idx].status = LeaseStatus::Error;
            let retired = slots[idx].lease.clone();
            let remaining = slots
                .iter()
                .filter(|s| s.status != LeaseStatus::Error)
                .count();
            drop(slots);

            let message = format!(
                "worktree {} retired after failed reset; pool capacity now {}",
                retired.id, remaining
            );
            warn!("{}", message);
            self.warnings.lock().unwrap().push(message);
            if !self.config.keep_failed {
                self.destroy_lease(&retired).await;
            }
            // Wake all waiters so they can observe a dead pool.
            self.freed.notify_waiters();
        }
    }

    /// Remove every worktree and its branch. Idempotent; releases any
    /// blocked acquirers.
    pub async fn cleanup(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.freed.notify_waiters();

        let slots: Vec<LeaseSlot> = {
            let mut guard = self.slots.lock().await;
            guard.drain(..).collect()
        };
        for slot in &slots {
            self.destroy_lease(&slot.lease).await;
        }
        let _ = self.git.prune_worktrees(&self.config.repo_path).await;

        // Sweep anything a crashed worker may have left behind.
        if let Ok(mut entries) = tokio::fs::read_dir(&self.config.base_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_name().to_string_lossy().starts_with("wt-") {
                    let _ = tokio::fs::remove_dir_all(entry.path()).await;
                }
            }
        }
        let _ = tokio::fs::remove_dir(&self.config.base_dir).await;

        if !slots.is_empty() {
            info!("Worktree pool cleaned up ({} leases removed)", slots.len());
        }
    }

    /// Number of leases not yet retired.
    pub async fn capacity(&self) -> usize {
        let slots = self.slots.lock().await;
        slots
            .iter()
            .filter(|s| s.status != LeaseStatus::Error)
            .count()
    }

    /// Drain accumulated degradation warnings for the session report.
    pub fn take_warnings(&self) -> Vec<String> {
        std::mem::take(&mut *self.warnings.lock().unwrap())
    }

    async fn recycle(&self, lease: &WorktreeLease) -> bool {
        match self.reset(lease).await {
            Ok(()) => return true,
            Err(e) => {
                warn!("Reset of {} failed: {:#}; recreating", lease.id, e);
            }
        }
        for attempt in 1..=self.config.max_recycle_attempts {
            match self.recreate(lease).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(
                        "Recreate attempt {}/{} for {} failed: {:#}",
                        attempt, self.config.max_recycle_attempts, lease.id, e
                    );
                }
            }
        }
        false
    }

    /// Restore a worktree to its branch tip with no stray files, then
    /// verify it.
    async fn reset(&self, lease: &WorktreeLease) -> anyhow::Result<()> {
        self.clear_working_tree(&lease.path).await?;
        self.git.reset_worktree(&lease.path, &lease.branch).await?;
        if !self.git.integrity_check(&lease.path).await? {
            anyhow::bail!("integrity probe failed for {}", lease.id);
        }
        Ok(())
    }

    async fn recreate(&self, lease: &WorktreeLease) -> anyhow::Result<()> {
        let _ = self
            .git
            .remove_worktree(&self.config.repo_path, &lease.path)
            .await;
        if tokio::fs::try_exists(&lease.path).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&lease.path).await?;
        }
        let _ = self.git.prune_worktrees(&self.config.repo_path).await;
        let _ = self
            .git
            .delete_branch(&self.config.repo_path, &lease.branch)
            .await;
        self.git
            .create_worktree(&self.config.repo_path, &lease.path, &lease.branch)
            .await?;
        if !self.git.integrity_check(&lease.path).await? {
            anyhow::bail!("integrity probe failed after recreate of {}", lease.id);
        }
        Ok(())
    }

    /// Delete everything under a worktree except the `.git` link.
    async fn clear_working_tree(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let mut entries = tokio::fs::read_dir(path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name() == ".git" {
                continue;
            }
            let entry_path = entry.path();
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&entry_path).await?;
            } else {
                tokio::fs::remove_file(&entry_path).await?;
            }
        }
        Ok(())
    }

    async fn destroy_lease(&self, lease: &WorktreeLease) {
        if self
            .git
            .remove_worktree(&self.config.repo_path, &lease.path)
            .await
            .is_err()
        {
            let _ = tokio::fs::remove_dir_all(&lease.path).await;
            let _ = self.git.prune_worktrees(&self.config.repo_path).await;
        }
        let _ = self
            .git
            .delete_branch(&self.config.repo_path, &lease.branch)
            .await;
    }

    /// Leases whose directories survived a crashed prior session.
    async fn remove_stale_directories(&self) -> Result<(), HarnessError> {
        let Ok(mut entries) = tokio::fs::read_dir(&self.config.base_dir).await else {
            return Ok(());
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().starts_with("wt-") {
                warn!(
                    "Removing stale worktree directory from a previous session: {}",
                    entry.path().display()
                );
                tokio::fs::remove_dir_all(entry.path()).await?;
            }
        }
        let _ = self.git.prune_worktrees(&self.config.repo_path).await;
        Ok(())
    }
}
