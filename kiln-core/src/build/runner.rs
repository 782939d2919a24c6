// kiln-core/src/build/runner.rs
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use kiln_aio::process::run_command_with_timeout;
use kiln_common::error::Result;
use kiln_common::pipeline::StageFailure;

/// One external command: program, arguments, working directory and the complete environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// How a command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// `None` when killed by a signal or after a timeout.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// The stage failure this outcome amounts to, `None` on success.
    pub fn failure(&self, timeout: Option<Duration>) -> Option<StageFailure> {
        if self.timed_out {
            return Some(StageFailure::Timeout(timeout.unwrap_or_default()));
        }
        match self.exit_code {
            Some(0) => None,
            Some(code) => Some(StageFailure::ExitCode(code)),
            None => Some(StageFailure::Terminated),
        }
    }

    /// Captured output for error reports.
    pub fn combined_output(&self) -> String {
        let mut out = self.stdout.trim_end().to_string();
        if !self.stderr.trim().is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(self.stderr.trim_end());
        }
        out
    }
}

/// The boundary to external build tools. `Err` means the command could not be started at all.
pub trait CommandRunner: Send + Sync {
    fn run(&self, invocation: &Invocation, timeout: Option<Duration>) -> Result<CommandOutcome>;
}

/// Runs commands as child processes with exactly the invocation's environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, invocation: &Invocation, timeout: Option<Duration>) -> Result<CommandOutcome> {
        let output = run_command_with_timeout(
            &invocation.program,
            &invocation.args,
            Some(&invocation.cwd),
            &invocation.env,
            true,
            timeout,
        )?;
        Ok(CommandOutcome {
            exit_code: output.status.and_then(|s| s.code()),
            timed_out: output.timed_out(),
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
        })
    }
}
