//! Outcomes of individual execution attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal classification of one execution attempt.
///
/// `Failed` means the plan ran and some tasks failed; `Error` means the
/// attempt itself broke (runner exception, timeout, lease failure).
/// Both feed the same retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Complete,
    Failed,
    Error,
}

impl TestStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, TestStatus::Complete)
    }
}

/// Outcome of one execution attempt of one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub request_id: String,
    /// Absent when the attempt never obtained a lease.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_id: Option<String>,
    pub worker_id: usize,
    pub status: TestStatus,
    pub tasks_passed: u32,
    pub tasks_failed: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Present iff `status != Complete`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Opaque location reported by the runner, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
}

impl TestResult {
    pub fn duration_seconds(&self) -> f64 {
        (self.completed_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn duration_is_derived_from_timestamps() {
        let started = Utc::now();
        let result = TestResult {
            request_id: "t1".into(),
            worktree_id: Some("wt-1".into()),
            worker_id: 0,
            status: TestStatus::Complete,
            tasks_passed: 3,
            tasks_failed: 0,
            started_at: started,
            completed_at: started + TimeDelta::milliseconds(2500),
            error_message: None,
            report_path: None,
        };
        assert!((result.duration_seconds() - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn status_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&TestStatus::Complete).unwrap(),
            "\"COMPLETE\""
        );
        assert_eq!(
            serde_json::to_string(&TestStatus::Failed).unwrap(),
            "\"FAILED\""
        );
    }
}
