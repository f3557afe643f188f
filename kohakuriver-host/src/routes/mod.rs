use crate::{
    overlay::{manager::OverlayError, reservation::{IpReservationManager, ReservationError}},
    proxy,
    services::{
        cluster::{ClusterService, ClusterServiceError},
        tasks::{TaskService, TaskServiceError},
    },
};
use axum::{
    Json, Router,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
};
use kohakuriver_models::ErrorResponse;
use std::sync::Arc;

pub(crate) mod cluster;
pub(crate) mod overlay;
pub(crate) mod tasks;
pub(crate) mod vps;

#[derive(Clone)]
pub struct AppState {
    pub cluster: Arc<ClusterService>,
    pub tasks: Arc<TaskService>,
    pub reservations: Arc<IpReservationManager>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest(
            "/api",
            Router::new()
                .route("/register", post(cluster::register))
                .route("/heartbeat/{hostname}", put(cluster::heartbeat))
                .route("/nodes", get(cluster::list_nodes))
                .route("/submit", post(tasks::submit))
                .route("/update", post(tasks::update))
                .route("/tasks", get(tasks::list))
                .route("/tasks/{task_id}", get(tasks::get_task))
                .route("/tasks/{task_id}/kill", post(tasks::kill))
                .route("/tasks/{task_id}/pause", post(tasks::pause))
                .route("/tasks/{task_id}/resume", post(tasks::resume))
                .route("/tasks/{task_id}/stdout", get(tasks::stdout))
                .route("/tasks/{task_id}/stderr", get(tasks::stderr))
                .route("/vps/create", post(vps::create))
                .route("/vps/stop/{task_id}", post(vps::stop))
                .route("/vps/restart/{task_id}", post(vps::restart))
                .route("/overlay/ip/reserve", post(overlay::reserve))
                .route("/overlay/ip/release", post(overlay::release))
                .route("/overlay/ip/consume", post(overlay::consume))
                .route("/overlay/allocations", get(overlay::allocations)),
        )
        .route("/ws/forward/{task_id}/{port}", get(proxy::forward))
        .route("/ws/task/{task_id}/terminal", get(proxy::terminal))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Error payload every handler funnels through: HTTP status plus a JSON
/// `{detail}` body.
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self { status, detail: detail.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(ErrorResponse::new(self.detail))).into_response()
    }
}

impl From<TaskServiceError> for ApiError {
    fn from(e: TaskServiceError) -> Self {
        let status = match &e {
            TaskServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            TaskServiceError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            TaskServiceError::TaskNotFound => StatusCode::NOT_FOUND,
            TaskServiceError::StateConflict(_) => StatusCode::CONFLICT,
            TaskServiceError::RunnerUnreachable(_) => StatusCode::BAD_GATEWAY,
            TaskServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<ClusterServiceError> for ApiError {
    fn from(e: ClusterServiceError) -> Self {
        let status = match &e {
            ClusterServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ClusterServiceError::NodeNotFound => StatusCode::NOT_FOUND,
            ClusterServiceError::Overlay(OverlayError::Exhausted(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ClusterServiceError::Overlay(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ClusterServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<ReservationError> for ApiError {
    fn from(e: ReservationError) -> Self {
        let status = match &e {
            ReservationError::UnknownRunner(_) => StatusCode::NOT_FOUND,
            ReservationError::IpUnavailable(..) | ReservationError::NoFreeIps(_) => StatusCode::SERVICE_UNAVAILABLE,
            ReservationError::TokenInvalid => StatusCode::FORBIDDEN,
            ReservationError::AlreadyConsumed | ReservationError::InUse => StatusCode::CONFLICT,
        };
        Self::new(status, e.to_string())
    }
}
