//! Subprocess abstraction layer for external tool integration
//!
//! Provides a trait-based abstraction over process execution so that the
//! version-control driver (and anything else that shells out) can be
//! tested without spawning real processes.
//!
//! - [`ProcessRunner`] - core trait for process execution
//! - [`SubprocessManager`] - facade with production and mock constructors
//! - [`GitDriver`] / [`GitDriverImpl`] - version-control operations used
//!   by the worktree pool

pub mod builder;
pub mod error;
pub mod git;
pub mod mock;
pub mod runner;

pub use builder::ProcessCommandBuilder;
pub use error::ProcessError;
pub use git::{GitDriver, GitDriverImpl};
pub use mock::{MockCommandConfig, MockProcessRunner};
pub use runner::{ExitStatus, ProcessCommand, ProcessOutput, ProcessRunner, TokioProcessRunner};

use std::sync::Arc;

/// Central entry point for subprocess operations.
///
/// Uses dependency injection through [`ProcessRunner`], so production
/// and test code differ only in which runner is plugged in.
#[derive(Clone)]
pub struct SubprocessManager {
    runner: Arc<dyn ProcessRunner>,
}

impl SubprocessManager {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }

    /// Production manager backed by the Tokio process runner.
    pub fn production() -> Self {
        Self::new(Arc::new(TokioProcessRunner))
    }

    /// Mock manager for tests, returned together with the mock runner so
    /// expectations can be scripted.
    pub fn mock() -> (Self, MockProcessRunner) {
        let mock = MockProcessRunner::new();
        let runner = Arc::new(mock.clone()) as Arc<dyn ProcessRunner>;
        (Self::new(runner), mock)
    }

    pub fn runner(&self) -> Arc<dyn ProcessRunner> {
        Arc::clone(&self.runner)
    }

    /// Git driver bound to this manager's process runner.
    pub fn git(&self) -> GitDriverImpl {
        GitDriverImpl::new(Arc::clone(&self.runner))
    }
}
