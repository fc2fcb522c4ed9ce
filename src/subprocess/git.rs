use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use super::builder::ProcessCommandBuilder;
use super::error::ProcessError;
use super::runner::{ExitStatus, ProcessRunner};

/// Version-control operations required by the worktree pool.
///
/// The pool is agnostic to the underlying VCS; this trait is the
/// seam. [`GitDriverImpl`] drives the `git` binary through the
/// [`ProcessRunner`] abstraction, and tests substitute their own
/// implementations.
#[async_trait]
pub trait GitDriver: Send + Sync {
    /// Create a worktree at `worktree_path` on a freshly-created `branch`.
    async fn create_worktree(
        &self,
        repo: &Path,
        worktree_path: &Path,
        branch: &str,
    ) -> Result<(), ProcessError>;

    /// Remove a worktree registration and its directory.
    async fn remove_worktree(&self, repo: &Path, worktree_path: &Path) -> Result<(), ProcessError>;

    /// Discard all tracked and untracked changes, restoring `branch`'s tip.
    async fn reset_worktree(&self, worktree_path: &Path, branch: &str) -> Result<(), ProcessError>;

    /// Cheap integrity probe over a worktree. Returns `false` when the
    /// worktree is unusable rather than erroring.
    async fn integrity_check(&self, worktree_path: &Path) -> Result<bool, ProcessError>;

    /// Delete a local branch.
    async fn delete_branch(&self, repo: &Path, branch: &str) -> Result<(), ProcessError>;

    /// Drop worktree registrations whose directories no longer exist.
    async fn prune_worktrees(&self, repo: &Path) -> Result<(), ProcessError>;
}

pub struct GitDriverImpl {
    runner: Arc<dyn ProcessRunner>,
}

impl GitDriverImpl {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }
}

fn check_success(status: &ExitStatus, context: &str, stderr: &str) -> Result<(), ProcessError> {
    if status.success() {
        Ok(())
    } else {
        Err(ProcessError::CommandFailed {
            command: context.to_string(),
            stderr: stderr.trim().to_string(),
        })
    }
}

#[async_trait]
impl GitDriver for GitDriverImpl {
    async fn create_worktree(
        &self,
        repo: &Path,
        worktree_path: &Path,
        branch: &str,
    ) -> Result<(), ProcessError> {
        let output = self
            .runner
            .run(
                ProcessCommandBuilder::new("git")
                    .current_dir(repo)
                    .args(["worktree", "add", "-b", branch])
                    .arg(worktree_path.to_string_lossy())
                    .build(),
            )
            .await?;
        check_success(&output.status, "git worktree add", &output.stderr)
    }

    async fn remove_worktree(&self, repo: &Path, worktree_path: &Path) -> Result<(), ProcessError> {
        let output = self
            .runner
            .run(
                ProcessCommandBuilder::new("git")
                    .current_dir(repo)
                    .args(["worktree", "remove", "--force"])
                    .arg(worktree_path.to_string_lossy())
                    .build(),
            )
            .await?;
        check_success(&output.status, "git worktree remove", &output.stderr)
    }

    async fn reset_worktree(&self, worktree_path: &Path, branch: &str) -> Result<(), ProcessError> {
        let output = self
            .runner
            .run(
                ProcessCommandBuilder::new("git")
                    .current_dir(worktree_path)
                    .args(["reset", "--hard", branch])
                    .build(),
            )
            .await?;
        check_success(&output.status, "git reset --hard", &output.stderr)?;

        let output = self
            .runner
            .run(
                ProcessCommandBuilder::new("git")
                    .current_dir(worktree_path)
                    .args(["clean", "-fdx"])
                    .build(),
            )
            .await?;
        check_success(&output.status, "git clean -fdx", &output.stderr)
    }

    async fn integrity_check(&self, worktree_path: &Path) -> Result<bool, ProcessError> {
        // Probe cheaply: HEAD must resolve and the index must be readable.
        let head = self
            .runner
            .run(
                ProcessCommandBuilder::new("git")
                    .current_dir(worktree_path)
                    .args(["rev-parse", "--verify", "HEAD"])
                    .suppress_stderr()
                    .build(),
            )
            .await?;
        if !head.status.success() {
            return Ok(false);
        }

        let status = self
            .runner
            .run(
                ProcessCommandBuilder::new("git")
                    .current_dir(worktree_path)
                    .args(["status", "--porcelain"])
                    .suppress_stderr()
                    .build(),
            )
            .await?;
        Ok(status.status.success())
    }

    async fn delete_branch(&self, repo: &Path, branch: &str) -> Result<(), ProcessError> {
        let output = self
            .runner
            .run(
                ProcessCommandBuilder::new("git")
                    .current_dir(repo)
                    .args(["branch", "-D", branch])
                    .suppress_stderr()
                    .build(),
            )
            .await?;
        check_success(&output.status, "git branch -D", &output.stderr)
    }

    async fn prune_worktrees(&self, repo: &Path) -> Result<(), ProcessError> {
        let output = self
            .runner
            .run(
                ProcessCommandBuilder::new("git")
                    .current_dir(repo)
                    .args(["worktree", "prune"])
                    .build(),
            )
            .await?;
        check_success(&output.status, "git worktree prune", &output.stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::MockProcessRunner;

    #[tokio::test]
    async fn create_worktree_invokes_git_with_branch() {
        let mut mock = MockProcessRunner::new();
        mock.expect_command("git")
            .with_args(|args| args.first().map(String::as_str) == Some("worktree"))
            .finish();

        let driver = GitDriverImpl::new(Arc::new(mock.clone()));
        driver
            .create_worktree(
                Path::new("/repo"),
                Path::new("/worktrees/wt-1"),
                "quench/wt-1",
            )
            .await
            .unwrap();

        let history = mock.call_history();
        assert_eq!(history.len(), 1);
        assert!(history[0].args.contains(&"quench/wt-1".to_string()));
        assert_eq!(history[0].working_dir.as_deref(), Some(Path::new("/repo")));
    }

    #[tokio::test]
    async fn integrity_check_reports_unhealthy_on_failure() {
        let mut mock = MockProcessRunner::new();
        mock.expect_command("git")
            .with_args(|args| args.first().map(String::as_str) == Some("rev-parse"))
            .returns_exit_code(128)
            .finish();

        let driver = GitDriverImpl::new(Arc::new(mock));
        let healthy = driver.integrity_check(Path::new("/worktrees/wt-1")).await.unwrap();
        assert!(!healthy);
    }
}
