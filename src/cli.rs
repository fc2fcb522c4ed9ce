//! Command-line surface.
//!
//! A thin shell over the orchestrator: parse arguments, validate the
//! plans, run the session, print the report as JSON.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::HarnessConfig;
use crate::orchestrator::ParallelOrchestrator;
use crate::plan::{PlanParser, YamlPlanParser};
use crate::report::SessionStatus;
use crate::request::{BatchRange, TestRequest};
use crate::runner::ShellTestRunner;
use crate::subprocess::SubprocessManager;

#[derive(Parser)]
#[command(name = "quench", version, about = "Run hardening test plans in parallel across isolated git worktrees")]
pub struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Execute one or more plans in parallel
    Run {
        /// Plan files to execute
        #[arg(required = true)]
        plans: Vec<PathBuf>,

        /// Number of parallel workers (and worktrees)
        #[arg(short = 'j', long)]
        workers: Option<usize>,

        /// Batch selection applied to every plan ("all", "5", "3-7")
        #[arg(long, default_value = "all")]
        batches: String,

        /// Repository to run against (defaults to the current directory)
        #[arg(long)]
        repo: Option<PathBuf>,

        /// Harness config file (YAML or TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Retry attempts per plan after a non-complete outcome
        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// Parse a plan and print its shape
    CheckPlan {
        plan: PathBuf,
    },
}

pub fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 2)
        .init();
}

pub async fn execute(command: Command) -> Result<()> {
    match command {
        Command::Run {
            plans,
            workers,
            batches,
            repo,
            config,
            max_retries,
        } => run_plans(plans, workers, batches, repo, config, max_retries).await,
        Command::CheckPlan { plan } => check_plan(plan).await,
    }
}

async fn run_plans(
    plans: Vec<PathBuf>,
    workers: Option<usize>,
    batches: String,
    repo: Option<PathBuf>,
    config_path: Option<PathBuf>,
    max_retries: Option<u32>,
) -> Result<()> {
    let batch_range: BatchRange = batches.parse()?;

    let mut config = match config_path {
        Some(path) => HarnessConfig::from_file(&path)?,
        None => {
            let repo = match repo {
                Some(repo) => repo,
                None => std::env::current_dir().context("resolving current directory")?,
            };
            HarnessConfig::new(repo)
        }
    };
    if let Some(workers) = workers {
        config.num_workers = workers;
    }
    config.validate()?;

    // Fail fast on unparseable plans before any worktree exists.
    let parser = YamlPlanParser;
    let mut requests = Vec::with_capacity(plans.len());
    for (index, plan_path) in plans.iter().enumerate() {
        let plan = parser.parse(plan_path).await?;
        let stem = plan_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| plan.name.clone());
        let mut request = TestRequest::new(format!("{}-{}", stem, index + 1), plan_path.clone())
            .with_batch_range(batch_range.clone());
        if let Some(max_retries) = max_retries {
            request = request.with_max_retries(max_retries);
        }
        requests.push(request);
    }

    let subprocess = SubprocessManager::production();
    let runner = Arc::new(ShellTestRunner::new(subprocess.clone()));
    let git = Arc::new(subprocess.git());

    let orchestrator = ParallelOrchestrator::new(config, runner, git);
    let report = orchestrator.run_tests(requests).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);

    match report.status {
        SessionStatus::Complete | SessionStatus::NoTests => Ok(()),
        status => bail!("session finished with status {status:?}"),
    }
}

async fn check_plan(plan_path: PathBuf) -> Result<()> {
    let plan = YamlPlanParser.parse(&plan_path).await?;
    println!(
        "{}: {} batches, {} tasks",
        plan.name,
        plan.batch_count(),
        plan.task_count()
    );
    for (index, batch) in plan.batches.iter().enumerate() {
        println!("  {}. {} ({} tasks)", index + 1, batch.name, batch.tasks.len());
    }
    Ok(())
}
