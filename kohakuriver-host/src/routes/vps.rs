use crate::routes::{ApiError, AppState};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use kohakuriver_models::vps::{CreateVpsRequest, CreateVpsResponse};

pub(crate) async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateVpsRequest>,
) -> Result<(StatusCode, Json<CreateVpsResponse>), ApiError> {
    let response = state.tasks.create_vps(request).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

pub(crate) async fn stop(State(state): State<AppState>, Path(task_id): Path<i64>) -> Result<(), ApiError> {
    state.tasks.stop_vps(task_id).await?;
    Ok(())
}

pub(crate) async fn restart(State(state): State<AppState>, Path(task_id): Path<i64>) -> Result<(), ApiError> {
    state.tasks.restart_vps(task_id).await?;
    Ok(())
}
