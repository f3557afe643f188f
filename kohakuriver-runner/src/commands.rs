//! Subprocess plumbing shared by the docker, network and QEMU layers.
//!
//! Every external invocation captures stdout and stderr, enforces a
//! timeout and reports non-zero exits with the captured stderr snippet.

use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn '{command}': {error}")]
    Spawn { command: String, error: std::io::Error },

    #[error("'{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("'{command}' exited with {code}: {stderr}")]
    Failed { command: String, code: i32, stderr: String },
}

pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run a command to completion, capturing output. Fails on non-zero exit.
pub async fn run_command(program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput, CommandError> {
    let output = run_command_unchecked(program, args, timeout).await?;
    Ok(output)
}

/// Like [`run_command`] but also returns the exit code so callers can
/// treat non-zero exits as data (e.g. a container's exit code).
pub async fn run_command_status(
    program: &str,
    args: &[&str],
    timeout: Option<Duration>,
) -> Result<(i32, CommandOutput), CommandError> {
    let rendered = render(program, args);
    debug!("Executing: {rendered}");
    let future = Command::new(program).args(args).output();
    let output = match timeout {
        Some(timeout) => tokio::time::timeout(timeout, future)
            .await
            .map_err(|_| CommandError::Timeout { command: rendered.clone(), timeout })?,
        None => future.await,
    }
    .map_err(|error| CommandError::Spawn { command: rendered, error })?;
    let code = output.status.code().unwrap_or(-1);
    let output = CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };
    Ok((code, output))
}

async fn run_command_unchecked(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    let (code, output) = run_command_status(program, args, Some(timeout)).await?;
    if code != 0 {
        return Err(CommandError::Failed { command: render(program, args), code, stderr: output.stderr });
    }
    Ok(output)
}

fn render(program: &str, args: &[&str]) -> String {
    format!("{program} {}", args.join(" "))
}
