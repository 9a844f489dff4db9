//! Bounded execution of external programs.

use std::ffi::OsString;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;

/// Errors from running an external program.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The program could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Collecting the program's output failed.
    #[error("waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program did not finish in time and was killed.
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    /// The program exited unsuccessfully.
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Captured output of a successful run.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// An external program with fixed arguments, environment and timeout.
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    pub program: String,
    pub args: Vec<OsString>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl ExternalCommand {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout,
        }
    }

    /// Appends a fixed argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds an environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Runs the program with the fixed arguments followed by `extra_args`.
    ///
    /// The child is killed if it outlives the timeout or if the returned
    /// future is dropped.
    pub async fn run<I, A>(&self, extra_args: I) -> Result<CommandOutput, CommandError>
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .args(extra_args.into_iter().map(Into::into))
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| CommandError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CommandError::Timeout {
                program: self.program.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| CommandError::Wait {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(CommandError::Failed {
                program: self.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(CommandOutput {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}
