use thiserror::Error;

use crate::subprocess::ProcessError;

/// Errors surfaced by the execution core.
///
/// Each variant corresponds to a distinct failure origin with its own
/// handling policy. Worker-internal failures (runner errors, timeouts,
/// lease failures on a dying pool) are absorbed into synthetic test
/// results rather than propagated, so they never appear here.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("worktree pool setup failed: {0}")]
    Setup(String),

    #[error("lease acquisition failed: {0}")]
    Lease(String),

    #[error("duplicate request id: {0}")]
    DuplicateId(String),

    #[error("queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("unknown request id: {0}")]
    UnknownRequest(String),

    #[error("submission rejected: shutdown in progress")]
    ShutdownInProgress,

    #[error("session already consumed: {0}")]
    SessionConsumed(String),

    #[error("invalid batch range: {0}")]
    Parse(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("process error: {0}")]
    Process(#[from] ProcessError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}
