// kiln-aio/src/process.rs
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::process::{Command as StdCommand, ExitStatus, Output as StdOutput, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use kiln_common::error::{KilnError, Result};
use tokio::process::Command;
use tracing::{debug, error, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Captured result of a synchronous process run.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// `None` when the process was killed after exceeding its timeout.
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn timed_out(&self) -> bool {
        self.status.is_none()
    }

    pub fn success(&self) -> bool {
        self.status.is_some_and(|s| s.success())
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Runs a command to completion, killing it (and its process group on Unix) if it is still
/// running after `timeout`. With `clear_env` the child sees only `envs`.
pub fn run_command_with_timeout(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    envs: &BTreeMap<String, String>,
    clear_env: bool,
    timeout: Option<Duration>,
) -> Result<ProcessOutput> {
    debug!(
        "Running command: {} {:?} (cwd: {:?}, envs: {:?}, timeout: {:?})",
        program,
        args,
        cwd,
        envs.keys().collect::<Vec<_>>(),
        timeout
    );

    let mut cmd = StdCommand::new(program);
    if clear_env {
        cmd.env_clear();
    }
    cmd.args(args)
        .envs(envs)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|e| {
        error!("Failed to execute command '{}': {}", program, e);
        KilnError::CommandExecError(format!("{program}: {e}"))
    })?;

    let stdout_rx = drain(child.stdout.take());
    let stderr_rx = drain(child.stderr.take());

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break Some(status);
        }
        if timeout.is_some_and(|limit| start.elapsed() >= limit) {
            warn!(
                "Command '{}' exceeded its timeout of {:?}, killing it",
                program, timeout
            );
            kill_tree(&mut child);
            break None;
        }
        thread::sleep(POLL_INTERVAL);
    };

    let grace = if status.is_some() {
        Duration::MAX
    } else {
        OUTPUT_DRAIN_GRACE
    };
    let output = ProcessOutput {
        status,
        stdout: collect(stdout_rx, grace),
        stderr: collect(stderr_rx, grace),
        elapsed: start.elapsed(),
    };
    if !output.success() {
        debug!("Command '{}' finished unsuccessfully: {:?}", program, output.status);
    }
    Ok(output)
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    if let Some(mut pipe) = pipe {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            let _ = tx.send(buf);
        });
    }
    rx
}

fn collect(rx: mpsc::Receiver<Vec<u8>>, grace: Duration) -> Vec<u8> {
    let received = if grace == Duration::MAX {
        rx.recv().ok()
    } else {
        rx.recv_timeout(grace).ok()
    };
    received.unwrap_or_default()
}

fn kill_tree(child: &mut std::process::Child) {
    #[cfg(unix)]
    {
        // The child leads its own process group; take down grandchildren such as compilers too.
        let group = format!("-{}", child.id());
        let _ = StdCommand::new("kill")
            .args(["-KILL", "--", &group])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    if let Err(e) = child.kill() {
        debug!("kill after timeout: {}", e);
    }
    let _ = child.wait();
}

/// Asynchronously runs an external command and captures its output.
pub async fn run_command_async(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    envs: &BTreeMap<String, String>,
) -> Result<StdOutput> {
    debug!("Async running command: {} {:?} (cwd: {:?})", program, args, cwd);

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(envs)
        .kill_on_drop(true)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    match cmd.output().await {
        Ok(output) => {
            if !output.status.success() {
                debug!("Async command failed with status: {}", output.status);
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.trim().is_empty() {
                    debug!("Stderr:\n{}", stderr.trim());
                }
            }
            Ok(output)
        }
        Err(e) => {
            error!("Async failed to execute command '{}': {}", program, e);
            Err(KilnError::CommandExecError(format!("{program}: {e}")))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn captures_output_and_exit_code() {
        let out = run_command_with_timeout(
            "sh",
            &sh("echo out; echo err >&2; exit 3"),
            None,
            &BTreeMap::new(),
            false,
            None,
        )
        .unwrap();
        assert_eq!(out.status.and_then(|s| s.code()), Some(3));
        assert_eq!(out.stdout_lossy(), "out\n");
        assert_eq!(out.stderr_lossy(), "err\n");
    }

    #[test]
    fn environment_and_cwd_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let envs = BTreeMap::from([("KILN_TEST_VALUE".to_string(), "42".to_string())]);
        let out = run_command_with_timeout(
            "sh",
            &sh("echo $KILN_TEST_VALUE; pwd"),
            Some(dir.path()),
            &envs,
            false,
            None,
        )
        .unwrap();
        let stdout = out.stdout_lossy();
        assert!(stdout.starts_with("42\n"));
        let canonical = dir.path().canonicalize().unwrap();
        assert!(stdout.trim_end().ends_with(canonical.file_name().unwrap().to_str().unwrap()));
    }

    #[test]
    fn timeout_kills_the_process() {
        let out = run_command_with_timeout(
            "sh",
            &sh("sleep 30"),
            None,
            &BTreeMap::new(),
            false,
            Some(Duration::from_millis(200)),
        )
        .unwrap();
        assert!(out.timed_out());
        assert!(out.elapsed < Duration::from_secs(10));
    }

    #[test]
    fn missing_program_is_an_exec_error() {
        let err = run_command_with_timeout(
            "/nonexistent/kiln-no-such-tool",
            &[],
            None,
            &BTreeMap::new(),
            false,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, KilnError::CommandExecError(_)));
    }

    #[test]
    fn cleared_environment_only_has_given_vars() {
        let envs = BTreeMap::from([
            ("PATH".to_string(), "/usr/bin:/bin".to_string()),
            ("ONLY_ME".to_string(), "1".to_string()),
        ]);
        let out = run_command_with_timeout(
            "/bin/sh",
            &sh("env | cut -d= -f1 | sort"),
            None,
            &envs,
            true,
            None,
        )
        .unwrap();
        let names = out.stdout_lossy();
        assert!(names.contains("ONLY_ME"));
        assert!(!names.contains("HOME\n"));
    }

    #[tokio::test]
    async fn async_runner_captures_status() {
        let out = run_command_async("sh", &sh("exit 0"), None, &BTreeMap::new())
            .await
            .unwrap();
        assert!(out.status.success());
    }
}
