use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::runner::ProcessCommand;

/// Assembles a [`ProcessCommand`] field by field.
///
/// The harness builds exactly two shapes of command: git invocations
/// pinned to a repository or worktree directory, and `sh -c` task
/// commands carrying per-request environment. The builder keeps both
/// call sites declarative; arguments accept anything string-like so
/// paths and borrowed config values pass through without ceremony.
pub struct ProcessCommandBuilder {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
    suppress_stderr: bool,
}

impl ProcessCommandBuilder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            timeout: None,
            suppress_stderr: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Silence stderr; used by probes whose failure is an answer, not
    /// an incident worth logging.
    pub fn suppress_stderr(mut self) -> Self {
        self.suppress_stderr = true;
        self
    }

    pub fn build(self) -> ProcessCommand {
        ProcessCommand {
            program: self.program,
            args: self.args,
            env: self.env,
            working_dir: self.working_dir,
            timeout: self.timeout,
            suppress_stderr: self.suppress_stderr,
        }
    }
}
