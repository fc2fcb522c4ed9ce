//! # quench
//!
//! A pipeline-hardening harness that executes test plans in parallel
//! across isolated git worktrees.
//!
//! N independent test plans run concurrently against one underlying
//! repository without version-control corruption or cross-test
//! interference: each worker leases an isolated worktree on its own
//! branch, the shared object database is only appended to, and every
//! worktree is reset to a verified clean state between executions.
//!
//! ## Modules
//!
//! - `config` - session configuration with file loading and defaults
//! - `error` - typed error kinds for the execution core
//! - `orchestrator` - pool + queue + workers composed into a session
//! - `plan` - plan model and the parser seam
//! - `pool` - fixed pool of isolated worktrees, leased exclusively
//! - `queue` - pending-work queue with status tracking and retries
//! - `report` - session report and status derivation
//! - `request` / `result` - the data model for work and outcomes
//! - `runner` - the test-runner seam and its shell implementation
//! - `subprocess` - trait-based process execution with mocks
//! - `worker` - the acquire, execute, release loop

pub mod cli;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod plan;
pub mod pool;
pub mod queue;
pub mod report;
pub mod request;
pub mod result;
pub mod runner;
pub mod subprocess;
pub mod worker;
