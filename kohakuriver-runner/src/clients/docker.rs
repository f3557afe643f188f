//! Docker operations via the `docker` CLI.

use crate::commands::{self, CommandError, DEFAULT_TIMEOUT, run_command, run_command_status};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{path::Path, time::Duration};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum DockerError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("image load from {0} failed: {1}")]
    LoadFailed(String, String),
}

/// How a finished container run ended.
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerExit {
    pub exit_code: i32,
    pub stderr: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DockerClient: Send + Sync {
    /// Run a container to completion. `args` is everything after
    /// `docker run`. No timeout: tasks run as long as they run.
    async fn run_to_completion(&self, args: Vec<String>) -> Result<ContainerExit, DockerError>;

    /// Run a detached container, returning once started.
    async fn run_detached(&self, args: Vec<String>) -> Result<(), DockerError>;

    async fn kill(&self, container: &str) -> Result<(), DockerError>;

    async fn stop(&self, container: &str) -> Result<(), DockerError>;

    async fn restart(&self, container: &str) -> Result<(), DockerError>;

    async fn pause(&self, container: &str) -> Result<(), DockerError>;

    async fn unpause(&self, container: &str) -> Result<(), DockerError>;

    /// Whether a container exists and is in the running state.
    async fn is_running(&self, container: &str) -> bool;

    /// Creation timestamp of a local image, `None` when absent.
    async fn image_created(&self, tag: &str) -> Option<DateTime<Utc>>;

    /// Load an image tarball, bounded by `timeout`.
    async fn load_image(&self, tarball: &Path, timeout: Duration) -> Result<(), DockerError>;

    /// Ensure a bridge network exists with the given IPAM settings.
    /// `bridge_name` pins the kernel bridge device when set.
    async fn ensure_network<'a>(
        &self,
        name: &str,
        subnet: &str,
        gateway: &str,
        bridge_name: Option<&'a str>,
    ) -> Result<(), DockerError>;
}

pub struct CliDockerClient;

impl CliDockerClient {
    async fn simple(&self, args: &[&str]) -> Result<(), DockerError> {
        run_command("docker", args, DEFAULT_TIMEOUT).await?;
        Ok(())
    }
}

#[async_trait]
impl DockerClient for CliDockerClient {
    async fn run_to_completion(&self, args: Vec<String>) -> Result<ContainerExit, DockerError> {
        let mut full: Vec<&str> = vec!["run"];
        full.extend(args.iter().map(String::as_str));
        let (exit_code, output) = run_command_status("docker", &full, None).await?;
        Ok(ContainerExit { exit_code, stderr: output.stderr })
    }

    async fn run_detached(&self, args: Vec<String>) -> Result<(), DockerError> {
        let mut full: Vec<&str> = vec!["run", "-d"];
        full.extend(args.iter().map(String::as_str));
        run_command("docker", &full, Duration::from_secs(120)).await?;
        Ok(())
    }

    async fn kill(&self, container: &str) -> Result<(), DockerError> {
        self.simple(&["kill", container]).await
    }

    async fn stop(&self, container: &str) -> Result<(), DockerError> {
        run_command("docker", &["stop", container], Duration::from_secs(60)).await?;
        Ok(())
    }

    async fn restart(&self, container: &str) -> Result<(), DockerError> {
        run_command("docker", &["restart", container], Duration::from_secs(60)).await?;
        Ok(())
    }

    async fn pause(&self, container: &str) -> Result<(), DockerError> {
        self.simple(&["pause", container]).await
    }

    async fn unpause(&self, container: &str) -> Result<(), DockerError> {
        self.simple(&["unpause", container]).await
    }

    async fn is_running(&self, container: &str) -> bool {
        let args = ["inspect", "-f", "{{.State.Running}}", container];
        match run_command("docker", &args, DEFAULT_TIMEOUT).await {
            Ok(output) => output.stdout.trim() == "true",
            Err(_) => false,
        }
    }

    async fn image_created(&self, tag: &str) -> Option<DateTime<Utc>> {
        let args = ["image", "inspect", "-f", "{{.Created}}", tag];
        let output = run_command("docker", &args, DEFAULT_TIMEOUT).await.ok()?;
        parse_image_created(output.stdout.trim())
    }

    async fn load_image(&self, tarball: &Path, timeout: Duration) -> Result<(), DockerError> {
        let path = tarball.display().to_string();
        info!("Loading image tarball {path}");
        let args = ["load", "-i", &path];
        match commands::run_command("docker", &args, timeout).await {
            Ok(_) => Ok(()),
            Err(CommandError::Failed { stderr, .. }) => Err(DockerError::LoadFailed(path, stderr)),
            Err(e) => Err(DockerError::LoadFailed(path, e.to_string())),
        }
    }

    async fn ensure_network<'a>(
        &self,
        name: &str,
        subnet: &str,
        gateway: &str,
        bridge_name: Option<&'a str>,
    ) -> Result<(), DockerError> {
        let inspect = ["network", "inspect", name];
        if run_command("docker", &inspect, DEFAULT_TIMEOUT).await.is_ok() {
            debug!("Docker network '{name}' already exists");
            return Ok(());
        }
        let mut args: Vec<&str> =
            vec!["network", "create", "--driver", "bridge", "--subnet", subnet, "--gateway", gateway];
        let bridge_opt;
        if let Some(bridge) = bridge_name {
            bridge_opt = format!("com.docker.network.bridge.name={bridge}");
            args.extend(["-o", &bridge_opt]);
        }
        args.push(name);
        run_command("docker", &args, DEFAULT_TIMEOUT).await?;
        info!("Created Docker network '{name}' (subnet={subnet}, gateway={gateway})");
        Ok(())
    }
}

/// Docker reports RFC 3339 with nanoseconds, e.g.
/// "2024-05-01T10:00:00.123456789Z".
fn parse_image_created(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value).ok().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_created_parsing() {
        let parsed = parse_image_created("2024-05-01T10:00:00.123456789Z").expect("failed to parse");
        assert_eq!(parsed.timestamp(), 1_714_557_600);
        assert!(parse_image_created("yesterday").is_none());
    }
}
