use crate::routes::{ApiError, AppState};
use axum::{
    Json,
    extract::{Path, State},
};
use kohakuriver_models::cluster::{HeartbeatRequest, NodeSummary, RegisterRequest, RegisterResponse};

pub(crate) async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    Ok(Json(state.cluster.register(request).await?))
}

pub(crate) async fn heartbeat(
    State(state): State<AppState>,
    Path(hostname): Path<String>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<(), ApiError> {
    state.cluster.heartbeat(&hostname, request).await?;
    Ok(())
}

pub(crate) async fn list_nodes(State(state): State<AppState>) -> Result<Json<Vec<NodeSummary>>, ApiError> {
    Ok(Json(state.cluster.list_nodes().await?))
}
