// src/runtime/shell.rs
//! Shell command execution
//!
//! Commands run through `sh -c` with stdout and stderr captured. The
//! `Shell` trait is the seam the orchestrator and its collaborators use, so
//! tests can substitute a recording fake.

use crate::utils::errors::{PlatformError, Result};
use serde::Serialize;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use tracing::{debug, trace};

/// Captured result of one command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShellOutput {
    /// The command line as submitted
    pub command: String,

    /// Exit code (`None` when terminated by a signal)
    pub status: Option<i32>,

    /// Captured standard output
    pub stdout: String,

    /// Captured standard error
    pub stderr: String,
}

impl ShellOutput {
    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Convert a non-zero exit into `ShellExecution`
    pub fn into_result(self) -> Result<ShellOutput> {
        if self.success() {
            Ok(self)
        } else {
            Err(PlatformError::ShellExecution {
                command: self.command,
                status: self.status,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Low-level command execution
pub trait Shell: Send + Sync {
    /// Run `command` and capture its output whatever the exit status
    ///
    /// Errors only when the command could not be started.
    fn execute(&self, command: &str) -> Result<ShellOutput>;

    /// Run `command`, failing with `ShellExecution` on a non-zero exit
    fn run(&self, command: &str) -> Result<ShellOutput> {
        self.execute(command)?.into_result()
    }
}

/// Shell backed by `/bin/sh` on the local host
#[derive(Debug, Clone, Default)]
pub struct SystemShell;

impl SystemShell {
    pub fn new() -> Self {
        Self
    }
}

impl Shell for SystemShell {
    fn execute(&self, command: &str) -> Result<ShellOutput> {
        debug!("Running: {}", command);
        let child = spawn_command(command)?;
        wait_for_output(command, child)
    }
}

/// Spawn `sh -c command` with piped output
///
/// The child leads its own process group so the whole command tree can be
/// signalled at once.
pub(crate) fn spawn_command(command: &str) -> Result<Child> {
    Command::new("sh")
        .arg("-c")
        .arg(command)
        .process_group(0)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| PlatformError::ShellExecution {
            command: command.to_string(),
            status: None,
            stderr: format!("Failed to spawn: {}", e),
        })
}

/// Wait for a spawned command and capture what it wrote
pub(crate) fn wait_for_output(command: &str, child: Child) -> Result<ShellOutput> {
    let output = child.wait_with_output()?;
    let result = ShellOutput {
        command: command.to_string(),
        status: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    trace!("'{}' exited with {:?}", command, result.status);
    Ok(result)
}

/// Quote an argument for inclusion in a `sh -c` command line
pub fn quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}
