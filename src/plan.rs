//! Test-plan model and parsing.
//!
//! The execution core treats plans, batches, and tasks as opaque
//! payloads; only the runner interprets them. The parser lives behind
//! the [`PlanParser`] trait so callers can substitute their own format.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::request::BatchRange;

/// A plan is a sequence of batches; a batch is a sequence of tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub batches: Vec<Batch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    /// Shell command executed in the worktree. A task without a command
    /// is a no-op placeholder and counts as passed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl Plan {
    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    pub fn task_count(&self) -> usize {
        self.batches.iter().map(|b| b.tasks.len()).sum()
    }

    /// Batches selected by a range, paired with their 1-based indices.
    pub fn select(&self, range: &BatchRange) -> Vec<(u32, &Batch)> {
        self.batches
            .iter()
            .enumerate()
            .map(|(i, b)| (i as u32 + 1, b))
            .filter(|(i, _)| range.contains(*i))
            .collect()
    }
}

/// Supplies a fully-materialised plan given a path.
#[async_trait]
pub trait PlanParser: Send + Sync {
    async fn parse(&self, plan_path: &Path) -> Result<Plan>;
}

/// Parses YAML plan files.
pub struct YamlPlanParser;

#[async_trait]
impl PlanParser for YamlPlanParser {
    async fn parse(&self, plan_path: &Path) -> Result<Plan> {
        let raw = tokio::fs::read_to_string(plan_path)
            .await
            .with_context(|| format!("reading plan {}", plan_path.display()))?;
        let plan: Plan = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing plan {}", plan_path.display()))?;
        Ok(plan)
    }
}
