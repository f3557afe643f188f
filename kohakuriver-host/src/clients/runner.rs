//! HTTP client for driving runners.
//!
//! Transport failures and HTTP rejections are distinct errors on purpose:
//! a connection error leaves the runner as the source of truth (the task
//! stays `assigning`), while an HTTP rejection is an explicit refusal that
//! fails the task.

use async_trait::async_trait;
use kohakuriver_models::{
    task::{ExecuteTaskRequest, KillTaskRequest, PauseResumeRequest},
    vps::{RunnerCreateVpsRequest, RunnerCreateVpsResponse},
};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum RunnerClientError {
    /// Could not reach the runner at all. The task's fate is unknown.
    #[error("runner unreachable: {0}")]
    Transport(String),

    /// The runner answered and said no.
    #[error("runner rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RunnerClient: Send + Sync {
    async fn execute(&self, base_url: &str, request: ExecuteTaskRequest) -> Result<(), RunnerClientError>;

    async fn kill(&self, base_url: &str, request: KillTaskRequest) -> Result<(), RunnerClientError>;

    async fn pause(&self, base_url: &str, request: PauseResumeRequest) -> Result<(), RunnerClientError>;

    async fn resume(&self, base_url: &str, request: PauseResumeRequest) -> Result<(), RunnerClientError>;

    /// VPS creation may legitimately take minutes (cloud-init, driver
    /// install); this call carries no client timeout and the caller is
    /// expected to run a watchdog instead.
    async fn create_vps(
        &self,
        base_url: &str,
        request: RunnerCreateVpsRequest,
    ) -> Result<RunnerCreateVpsResponse, RunnerClientError>;

    async fn stop_vps(&self, base_url: &str, task_id: i64) -> Result<(), RunnerClientError>;

    async fn restart_vps(&self, base_url: &str, task_id: i64) -> Result<(), RunnerClientError>;
}

pub struct HttpRunnerClient {
    client: Client,
    /// Client without a request timeout, for VPS creation.
    slow_client: Client,
}

impl HttpRunnerClient {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let slow_client = Client::builder().connect_timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, slow_client })
    }

    async fn post<B: Serialize + Sync>(
        &self,
        client: &Client,
        url: String,
        body: &B,
    ) -> Result<reqwest::Response, RunnerClientError> {
        debug!("POST {url}");
        let response =
            client.post(&url).json(body).send().await.map_err(|e| RunnerClientError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RunnerClientError::Rejected { status: status.as_u16(), body });
        }
        Ok(response)
    }
}

#[async_trait]
impl RunnerClient for HttpRunnerClient {
    async fn execute(&self, base_url: &str, request: ExecuteTaskRequest) -> Result<(), RunnerClientError> {
        self.post(&self.client, format!("{base_url}/api/execute"), &request).await?;
        Ok(())
    }

    async fn kill(&self, base_url: &str, request: KillTaskRequest) -> Result<(), RunnerClientError> {
        self.post(&self.client, format!("{base_url}/api/kill"), &request).await?;
        Ok(())
    }

    async fn pause(&self, base_url: &str, request: PauseResumeRequest) -> Result<(), RunnerClientError> {
        self.post(&self.client, format!("{base_url}/api/pause"), &request).await?;
        Ok(())
    }

    async fn resume(&self, base_url: &str, request: PauseResumeRequest) -> Result<(), RunnerClientError> {
        self.post(&self.client, format!("{base_url}/api/resume"), &request).await?;
        Ok(())
    }

    async fn create_vps(
        &self,
        base_url: &str,
        request: RunnerCreateVpsRequest,
    ) -> Result<RunnerCreateVpsResponse, RunnerClientError> {
        let response = self.post(&self.slow_client, format!("{base_url}/api/vps/create"), &request).await?;
        response.json().await.map_err(|e| RunnerClientError::Transport(format!("invalid response body: {e}")))
    }

    async fn stop_vps(&self, base_url: &str, task_id: i64) -> Result<(), RunnerClientError> {
        self.post(&self.client, format!("{base_url}/api/vps/stop/{task_id}"), &()).await?;
        Ok(())
    }

    async fn restart_vps(&self, base_url: &str, task_id: i64) -> Result<(), RunnerClientError> {
        self.post(&self.client, format!("{base_url}/api/vps/restart/{task_id}"), &()).await?;
        Ok(())
    }
}
