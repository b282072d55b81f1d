/*!
 * External Tool Invocation
 * Runs privileged FreeBSD utilities with a hard deadline
 */

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;

/// Captured output of a tool that exited successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("{program} not found")]
    NotFound { program: String },

    #[error("{program} timed out after {}s", timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },

    #[error("{program} exited with status {code}: {}", stderr.trim())]
    NonZeroExit {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("{program} was killed by signal {signal}")]
    Killed { program: String, signal: i32 },

    #[error("failed to run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Runs an external program as an argument vector.
///
/// Implementations never go through a shell, so nothing in `args` is ever
/// interpreted.
pub trait CommandRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<ToolOutput, InvokeError>;
}

/// Runner backed by real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<ToolOutput, InvokeError> {
        tracing::debug!(program, ?args, timeout_secs = timeout.as_secs(), "Invoking tool");

        // kill_on_drop: abandoning the wait below SIGKILLs the child.
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => InvokeError::NotFound {
                    program: program.to_string(),
                },
                _ => InvokeError::Io {
                    program: program.to_string(),
                    source: e,
                },
            })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(InvokeError::Io {
                    program: program.to_string(),
                    source: e,
                });
            }
            Err(_) => {
                tracing::warn!(program, "Tool exceeded its deadline, child killed");
                return Err(InvokeError::TimedOut {
                    program: program.to_string(),
                    timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        match output.status.code() {
            Some(0) => Ok(ToolOutput { stdout, stderr }),
            Some(code) => Err(InvokeError::NonZeroExit {
                program: program.to_string(),
                code,
                stderr,
            }),
            None => Err(InvokeError::Killed {
                program: program.to_string(),
                signal: output.status.signal().unwrap_or_default(),
            }),
        }
    }
}
