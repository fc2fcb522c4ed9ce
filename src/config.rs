//! Harness configuration.
//!
//! All knobs for one orchestrator session. Field defaults follow the
//! serde `default = "fn"` pattern so partial config files work; files
//! may be YAML or TOML.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::HarnessError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Number of workers, which is also the worktree pool size.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Enqueue above this fails synchronously.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Repository the worktrees are linked to.
    pub repo_path: PathBuf,

    /// Where worktrees live; defaults to `<repo>/.quench/worktrees`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_dir: Option<PathBuf>,

    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,

    /// Preserve unrecoverable worktrees for diagnosis instead of
    /// deleting them.
    #[serde(default)]
    pub keep_failed_worktrees: bool,

    #[serde(default = "default_recycle_attempts")]
    pub max_recycle_attempts: u32,

    /// Per-request execution ceiling when the request does not carry
    /// its own.
    #[serde(default = "default_run_timeout", with = "humantime_serde")]
    pub default_timeout: Duration,

    /// How long a worker blocks on an empty queue before re-checking
    /// its stop flag.
    #[serde(default = "default_dequeue_timeout", with = "humantime_serde")]
    pub dequeue_timeout: Duration,

    /// Poll interval for drain detection.
    #[serde(default = "default_drain_poll", with = "humantime_serde")]
    pub drain_poll: Duration,
}

fn default_num_workers() -> usize {
    4
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_branch_prefix() -> String {
    "quench".to_string()
}

fn default_recycle_attempts() -> u32 {
    2
}

fn default_run_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_dequeue_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_drain_poll() -> Duration {
    Duration::from_millis(200)
}

impl HarnessConfig {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            num_workers: default_num_workers(),
            max_queue_size: default_max_queue_size(),
            repo_path: repo_path.into(),
            base_dir: None,
            branch_prefix: default_branch_prefix(),
            keep_failed_worktrees: false,
            max_recycle_attempts: default_recycle_attempts(),
            default_timeout: default_run_timeout(),
            dequeue_timeout: default_dequeue_timeout(),
            drain_poll: default_drain_poll(),
        }
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }

    /// Resolved worktree base directory.
    pub fn worktree_base(&self) -> PathBuf {
        self.base_dir
            .clone()
            .unwrap_or_else(|| self.repo_path.join(".quench").join("worktrees"))
    }

    /// Load from a YAML or TOML file, keyed by extension.
    pub fn from_file(path: &Path) -> Result<Self, HarnessError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => serde_yaml::from_str(&raw)?,
            Some("toml") => toml::from_str(&raw)?,
            other => {
                return Err(HarnessError::Config(format!(
                    "unsupported config extension {other:?} for {}",
                    path.display()
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.num_workers == 0 {
            return Err(HarnessError::Config(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if self.max_queue_size == 0 {
            return Err(HarnessError::Config(
                "max_queue_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
