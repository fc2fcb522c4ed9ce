//! The test-runner seam.
//!
//! The execution core treats the runner as a pure asynchronous
//! function from `(worktree, plan, batch range, config)` to a
//! [`RunnerResult`]. [`ShellTestRunner`] is the production
//! implementation; test doubles implement [`TestRunner`] directly.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::plan::{PlanParser, YamlPlanParser};
use crate::request::{BatchRange, RunnerConfig};
use crate::result::TestStatus;
use crate::subprocess::{ProcessCommandBuilder, SubprocessManager};

/// Structured outcome returned by a runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerResult {
    pub status: TestStatus,
    #[serde(default)]
    pub tasks_passed: u32,
    #[serde(default)]
    pub tasks_failed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunnerResult {
    pub fn complete(tasks_passed: u32) -> Self {
        Self {
            status: TestStatus::Complete,
            tasks_passed,
            tasks_failed: 0,
            report_path: None,
            error: None,
        }
    }

    pub fn failed(tasks_passed: u32, tasks_failed: u32, error: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Failed,
            tasks_passed,
            tasks_failed,
            report_path: None,
            error: Some(error.into()),
        }
    }
}

/// Executes a plan slice inside a worktree.
///
/// Implementations must be re-entrant: the orchestrator issues several
/// concurrent calls against distinct worktrees.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(
        &self,
        worktree_path: &Path,
        plan_path: &Path,
        batch_range: &BatchRange,
        config: &RunnerConfig,
    ) -> Result<RunnerResult>;
}

/// Runs each selected task's shell command inside the worktree.
///
/// Tasks run in plan order; a failing task marks the batch failed but
/// does not stop the remaining tasks.
pub struct ShellTestRunner {
    subprocess: SubprocessManager,
    parser: YamlPlanParser,
}

impl ShellTestRunner {
    pub fn new(subprocess: SubprocessManager) -> Self {
        Self {
            subprocess,
            parser: YamlPlanParser,
        }
    }
}

#[async_trait]
impl TestRunner for ShellTestRunner {
    async fn run(
        &self,
        worktree_path: &Path,
        plan_path: &Path,
        batch_range: &BatchRange,
        config: &RunnerConfig,
    ) -> Result<RunnerResult> {
        let plan = self.parser.parse(plan_path).await?;
        let selected = plan.select(batch_range);

        let mut passed = 0u32;
        let mut failed = 0u32;
        let mut first_failure: Option<String> = None;

        for (index, batch) in selected {
            for task in &batch.tasks {
                let Some(command) = &task.command else {
                    passed += 1;
                    continue;
                };

                let mut builder = ProcessCommandBuilder::new("sh")
                    .arg("-c")
                    .arg(command)
                    .current_dir(worktree_path)
                    .envs(config.env.iter());
                if let Some(timeout) = config.timeout {
                    builder = builder.timeout(timeout);
                }

                let output = self
                    .subprocess
                    .runner()
                    .run(builder.build())
                    .await
                    .with_context(|| {
                        format!("running task '{}' of batch {} ({})", task.name, index, batch.name)
                    })?;

                if output.status.success() {
                    passed += 1;
                } else {
                    failed += 1;
                    if first_failure.is_none() {
                        let detail = if output.stderr.trim().is_empty() {
                            format!("exit code {:?}", output.status.code())
                        } else {
                            output.stderr.trim().to_string()
                        };
                        first_failure =
                            Some(format!("task '{}' in batch '{}': {}", task.name, batch.name, detail));
                    }
                }
            }
        }

        if failed == 0 {
            Ok(RunnerResult::complete(passed))
        } else {
            Ok(RunnerResult::failed(
                passed,
                failed,
                first_failure.unwrap_or_else(|| "tasks failed".to_string()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_plan(dir: &Path, yaml: &str) -> std::path::PathBuf {
        let path = dir.join("plan.yml");
        fs::write(&path, yaml).unwrap();
        path
    }

    #[tokio::test]
    async fn all_tasks_passing_yields_complete() {
        let dir = TempDir::new().unwrap();
        let plan = write_plan(
            dir.path(),
            "name: ok\nbatches:\n  - name: b1\n    tasks:\n      - name: t1\n        command: \"true\"\n      - name: t2\n",
        );

        let runner = ShellTestRunner::new(SubprocessManager::production());
        let result = runner
            .run(dir.path(), &plan, &BatchRange::All, &RunnerConfig::default())
            .await
            .unwrap();

        assert_eq!(result.status, TestStatus::Complete);
        assert_eq!(result.tasks_passed, 2);
        assert_eq!(result.tasks_failed, 0);
    }

    #[tokio::test]
    async fn failing_task_yields_failed_with_message() {
        let dir = TempDir::new().unwrap();
        let plan = write_plan(
            dir.path(),
            "name: mixed\nbatches:\n  - name: b1\n    tasks:\n      - name: good\n        command: \"true\"\n      - name: bad\n        command: \"exit 3\"\n",
        );

        let runner = ShellTestRunner::new(SubprocessManager::production());
        let result = runner
            .run(dir.path(), &plan, &BatchRange::All, &RunnerConfig::default())
            .await
            .unwrap();

        assert_eq!(result.status, TestStatus::Failed);
        assert_eq!(result.tasks_passed, 1);
        assert_eq!(result.tasks_failed, 1);
        assert!(result.error.as_deref().unwrap().contains("bad"));
    }

    #[tokio::test]
    async fn batch_range_limits_execution() {
        let dir = TempDir::new().unwrap();
        let plan = write_plan(
            dir.path(),
            "name: ranged\nbatches:\n  - name: b1\n    tasks:\n      - name: t1\n        command: \"exit 1\"\n  - name: b2\n    tasks:\n      - name: t2\n        command: \"true\"\n",
        );

        let runner = ShellTestRunner::new(SubprocessManager::production());
        let result = runner
            .run(
                dir.path(),
                &plan,
                &BatchRange::Range { start: 2, end: 2 },
                &RunnerConfig::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.status, TestStatus::Complete);
        assert_eq!(result.tasks_passed, 1);
    }
}
