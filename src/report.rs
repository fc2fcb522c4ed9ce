//! Session report and status derivation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::result::TestResult;

/// Aggregate status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Complete,
    PartialSuccess,
    Failed,
    NoTests,
    Running,
}

/// Counts carried by the report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

/// Final report for one orchestrator session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelTestReport {
    pub session_id: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Derived from the two timestamps at construction.
    pub duration_seconds: f64,
    pub num_workers: usize,
    pub summary: ReportSummary,
    pub results: Vec<TestResult>,
    /// Degradation notices from the worktree pool (failed resets,
    /// capacity shrinks).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Derive the session status from terminal accounting.
///
/// `completed_at` is the terminal signal: while it is unset the session
/// reports `Running` (or `NoTests`), so repeated derivations over a
/// finished session are stable.
pub fn derive_session_status(
    total: usize,
    completed: usize,
    failed: usize,
    completed_at: Option<DateTime<Utc>>,
) -> SessionStatus {
    if total == 0 {
        return SessionStatus::NoTests;
    }
    if completed_at.is_none() {
        return SessionStatus::Running;
    }
    if failed == 0 && completed == total {
        SessionStatus::Complete
    } else if completed > 0 && failed > 0 {
        SessionStatus::PartialSuccess
    } else if completed == 0 && failed == total {
        SessionStatus::Failed
    } else {
        SessionStatus::Running
    }
}
