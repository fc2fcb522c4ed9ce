//! Test-plan execution requests and their runner configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::HarnessError;

/// Selects which batches of a plan to execute.
///
/// String form is `"all"`, a single index (`"5"`), or an inclusive
/// range (`"3-7"`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum BatchRange {
    #[default]
    All,
    Range {
        start: u32,
        end: u32,
    },
}

impl BatchRange {
    pub fn contains(&self, index: u32) -> bool {
        match self {
            BatchRange::All => true,
            BatchRange::Range { start, end } => (*start..=*end).contains(&index),
        }
    }
}

impl fmt::Display for BatchRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchRange::All => write!(f, "all"),
            BatchRange::Range { start, end } => write!(f, "{start}-{end}"),
        }
    }
}

impl FromStr for BatchRange {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(BatchRange::All);
        }
        if let Some((start, end)) = s.split_once('-') {
            let start: u32 = start
                .trim()
                .parse()
                .map_err(|_| HarnessError::Parse(s.to_string()))?;
            let end: u32 = end
                .trim()
                .parse()
                .map_err(|_| HarnessError::Parse(s.to_string()))?;
            if start > end {
                return Err(HarnessError::Parse(format!(
                    "{s}: start must not exceed end"
                )));
            }
            return Ok(BatchRange::Range { start, end });
        }
        let index: u32 = s.parse().map_err(|_| HarnessError::Parse(s.to_string()))?;
        Ok(BatchRange::Range {
            start: index,
            end: index,
        })
    }
}

impl From<BatchRange> for String {
    fn from(range: BatchRange) -> Self {
        range.to_string()
    }
}

impl TryFrom<String> for BatchRange {
    type Error = HarnessError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Per-request runner configuration, forwarded opaquely to the runner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Hard ceiling on one execution attempt. Expiry is classified as an
    /// infrastructure error and feeds the retry policy.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Extra environment passed to runner subprocesses.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

/// A unit of work: one plan (or batch slice of one) to execute in an
/// isolated worktree.
///
/// Requests are immutable from the client's and runner's perspective;
/// only the queue mutates `retry_count`, and only on re-enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRequest {
    pub id: String,
    pub plan_path: PathBuf,
    #[serde(default)]
    pub batch_range: BatchRange,
    #[serde(default)]
    pub config: RunnerConfig,
    /// Larger values dispatch earlier.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
}

fn default_max_retries() -> u32 {
    2
}

impl TestRequest {
    pub fn new(id: impl Into<String>, plan_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            plan_path: plan_path.into(),
            batch_range: BatchRange::All,
            config: RunnerConfig::default(),
            priority: 0,
            retry_count: 0,
            max_retries: default_max_retries(),
            created_at: Utc::now(),
        }
    }

    pub fn with_batch_range(mut self, range: BatchRange) -> Self {
        self.batch_range = range;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retries_remaining(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }
}
