use crate::{
    repositories::task::TaskFilter,
    routes::{ApiError, AppState},
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use kohakuriver_models::task::{SubmitResponse, SubmitTaskRequest, TaskStatus, TaskStatusUpdate, TaskSummary};
use serde::Deserialize;

pub(crate) async fn submit(
    State(state): State<AppState>,
    Json(request): Json<SubmitTaskRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let task_ids = state.tasks.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { task_ids })))
}

pub(crate) async fn update(
    State(state): State<AppState>,
    Json(update): Json<TaskStatusUpdate>,
) -> Result<(), ApiError> {
    state.tasks.handle_status_update(update).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListQuery {
    status: Option<TaskStatus>,
    node: Option<String>,
    limit: Option<u32>,
}

pub(crate) async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<TaskSummary>>, ApiError> {
    let filter = TaskFilter { status: query.status, node: query.node, limit: query.limit };
    Ok(Json(state.tasks.list(filter).await?))
}

pub(crate) async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> Result<Json<TaskSummary>, ApiError> {
    Ok(Json(state.tasks.get(task_id).await?))
}

pub(crate) async fn kill(State(state): State<AppState>, Path(task_id): Path<i64>) -> Result<(), ApiError> {
    state.tasks.kill(task_id).await?;
    Ok(())
}

pub(crate) async fn pause(State(state): State<AppState>, Path(task_id): Path<i64>) -> Result<(), ApiError> {
    state.tasks.pause(task_id).await?;
    Ok(())
}

pub(crate) async fn resume(State(state): State<AppState>, Path(task_id): Path<i64>) -> Result<(), ApiError> {
    state.tasks.resume(task_id).await?;
    Ok(())
}

pub(crate) async fn stdout(State(state): State<AppState>, Path(task_id): Path<i64>) -> Result<String, ApiError> {
    Ok(state.tasks.read_log(task_id, false).await?)
}

pub(crate) async fn stderr(State(state): State<AppState>, Path(task_id): Path<i64>) -> Result<String, ApiError> {
    Ok(state.tasks.read_log(task_id, true).await?)
}
