//! CLI command execution helpers with automatic timing
//!
//! Wraps the `sentinel` binary built for this test run.

use anyhow::{Context, Result};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// CLI command builder with timing
pub struct SentinelCommand {
    binary_path: PathBuf,
    working_dir: PathBuf,
    args: Vec<String>,
}

impl SentinelCommand {
    /// Create a new command in the given working directory
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            binary_path: PathBuf::from(env!("CARGO_BIN_EXE_sentinel")),
            working_dir: working_dir.as_ref().to_path_buf(),
            args: Vec::new(),
        }
    }

    /// Add command arguments
    pub fn args(&mut self, args: &[&str]) -> &mut Self {
        self.args.extend(args.iter().map(|s| s.to_string()));
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary_path);
        command.args(&self.args).current_dir(&self.working_dir);
        command
    }

    /// Execute command and return result with timing
    pub fn execute(&self) -> Result<CommandResult> {
        let start = Instant::now();
        let output = self.command().output().context("Failed to execute command")?;

        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            duration: start.elapsed(),
        })
    }

    /// Execute and assert success
    pub fn assert_success(&self) -> Result<CommandResult> {
        let result = self.execute()?;

        if !result.success() {
            anyhow::bail!(
                "Command failed (exit code: {}):\nArgs: {:?}\nStdout: {}\nStderr: {}",
                result.exit_code,
                self.args,
                result.stdout,
                result.stderr
            );
        }

        Ok(result)
    }

    /// Execute and expect failure
    pub fn assert_failure(&self) -> Result<CommandResult> {
        let result = self.execute()?;

        if result.success() {
            anyhow::bail!(
                "Command should have failed but succeeded:\nArgs: {:?}\nStdout: {}",
                self.args,
                result.stdout
            );
        }

        Ok(result)
    }

    /// Start a long-running command with its stdout readable line by line
    pub fn spawn(&self) -> Result<RunningCommand> {
        let mut child = self
            .command()
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn command")?;

        let stdout = child.stdout.take().context("No stdout handle")?;
        let (tx, lines) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        Ok(RunningCommand { child, lines })
    }
}

/// A spawned command that is killed when dropped
pub struct RunningCommand {
    child: Child,
    lines: mpsc::Receiver<String>,
}

impl RunningCommand {
    /// Wait for a stdout line matching `predicate`
    pub fn wait_for_line(
        &self,
        timeout: Duration,
        mut predicate: impl FnMut(&str) -> bool,
    ) -> Result<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                anyhow::bail!("Timed out waiting for output");
            }
            match self.lines.recv_timeout(remaining) {
                Ok(line) if predicate(&line) => return Ok(line),
                Ok(_) => continue,
                Err(_) => anyhow::bail!("Timed out waiting for output"),
            }
        }
    }
}

impl Drop for RunningCommand {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Command execution result with timing
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
}

impl CommandResult {
    /// Check if command succeeded
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Check if stdout contains text
    pub fn contains_stdout(&self, text: &str) -> bool {
        self.stdout.contains(text)
    }

    /// Check if stderr contains text
    pub fn contains_stderr(&self, text: &str) -> bool {
        self.stderr.contains(text)
    }
}

/// Macro for convenient command construction
///
/// Usage:
/// ```ignore
/// sentinel!(dir, "config", "--raw").assert_success()?;
/// ```
#[macro_export]
macro_rules! sentinel {
    ($dir:expr, $($arg:expr),+ $(,)?) => {{
        let mut command = $crate::common::cli::SentinelCommand::new($dir);
        command.args(&[$($arg),+]);
        command
    }};
}
