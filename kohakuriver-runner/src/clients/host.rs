//! HTTP client for talking back to the host.

use async_trait::async_trait;
use kohakuriver_models::{
    cluster::{HeartbeatRequest, RegisterRequest, RegisterResponse},
    overlay::{ConsumeReservationRequest, ConsumeReservationResponse},
    task::TaskStatusUpdate,
};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum HostClientError {
    #[error("host unreachable: {0}")]
    Transport(String),

    /// The host does not know this node; a full re-registration is due.
    #[error("host does not know this node")]
    Unregistered,

    #[error("host rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostApiClient: Send + Sync {
    async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse, HostClientError>;

    async fn heartbeat(&self, hostname: &str, request: HeartbeatRequest) -> Result<(), HostClientError>;

    async fn report_status(&self, update: TaskStatusUpdate) -> Result<(), HostClientError>;

    /// Claim a reserved overlay IP for a container about to start.
    async fn consume_reservation(
        &self,
        request: ConsumeReservationRequest,
    ) -> Result<ConsumeReservationResponse, HostClientError>;
}

pub struct HttpHostApiClient {
    client: Client,
    base_url: String,
}

impl HttpHostApiClient {
    pub fn new(base_url: String) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, base_url })
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, HostClientError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(HostClientError::Unregistered);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HostClientError::Rejected { status: status.as_u16(), body });
        }
        Ok(response)
    }
}

#[async_trait]
impl HostApiClient for HttpHostApiClient {
    async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse, HostClientError> {
        let url = format!("{}/api/register", self.base_url);
        debug!("POST {url}");
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| HostClientError::Transport(e.to_string()))?;
        let response = self.check(response).await?;
        response.json().await.map_err(|e| HostClientError::Transport(format!("invalid response body: {e}")))
    }

    async fn heartbeat(&self, hostname: &str, request: HeartbeatRequest) -> Result<(), HostClientError> {
        let url = format!("{}/api/heartbeat/{hostname}", self.base_url);
        let response = self
            .client
            .put(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| HostClientError::Transport(e.to_string()))?;
        self.check(response).await?;
        Ok(())
    }

    async fn report_status(&self, update: TaskStatusUpdate) -> Result<(), HostClientError> {
        let url = format!("{}/api/update", self.base_url);
        debug!("Task {}: reporting status '{}'", update.task_id, update.status);
        let response = self
            .client
            .post(&url)
            .json(&update)
            .send()
            .await
            .map_err(|e| HostClientError::Transport(e.to_string()))?;
        self.check(response).await?;
        Ok(())
    }

    async fn consume_reservation(
        &self,
        request: ConsumeReservationRequest,
    ) -> Result<ConsumeReservationResponse, HostClientError> {
        let url = format!("{}/api/overlay/ip/consume", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| HostClientError::Transport(e.to_string()))?;
        let response = self.check(response).await?;
        response.json().await.map_err(|e| HostClientError::Transport(format!("invalid response body: {e}")))
    }
}
