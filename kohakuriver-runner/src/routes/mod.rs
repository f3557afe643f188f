use crate::{
    clients::docker::DockerError,
    commands::CommandError,
    qemu::manager::{VmError, VmManager},
    repositories::records::TaskRecordRepository,
    services::{
        executor::TaskExecutor,
        vps::{VpsError, VpsService},
    },
    tunnel::{self, TunnelRegistry},
    workers::heartbeat::KilledTaskQueue,
};
use axum::{
    Json, Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use kohakuriver_models::{
    ErrorResponse,
    cluster::{VmPhoneHomeRequest, VmTelemetryRequest},
    task::{ExecuteTaskRequest, KillTaskRequest, PauseResumeRequest},
    tunnel::Proto,
    vps::{RunnerCreateVpsRequest, RunnerCreateVpsResponse, VmInstanceSummary},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<TaskExecutor>,
    pub vps: Arc<VpsService>,
    pub vms: Arc<VmManager>,
    pub records: Arc<dyn TaskRecordRepository>,
    pub tunnels: Arc<TunnelRegistry>,
    pub killed: Arc<KilledTaskQueue>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest(
            "/api",
            Router::new()
                .route("/execute", post(execute))
                .route("/kill", post(kill))
                .route("/pause", post(pause))
                .route("/resume", post(resume))
                .route("/vps/create", post(vps_create))
                .route("/vps/stop/{task_id}", post(vps_stop))
                .route("/vps/restart/{task_id}", post(vps_restart))
                .route("/vps/{task_id}/vm-phone-home", post(vm_phone_home))
                .route("/vps/{task_id}/telemetry", post(vm_telemetry))
                .route("/vms", get(list_vms)),
        )
        .route("/ws/tunnel/{container_id}", get(ws_tunnel))
        .route("/ws/forward/{container_id}/{port}", get(ws_forward))
        .route("/ws/task/{task_id}/terminal", get(ws_terminal))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self { status, detail: detail.into() }
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }

    fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse::new(self.detail))).into_response()
    }
}

impl From<crate::services::executor::ExecutorError> for ApiError {
    fn from(e: crate::services::executor::ExecutorError) -> Self {
        match e {
            crate::services::executor::ExecutorError::Docker(e) => e.into(),
        }
    }
}

impl From<DockerError> for ApiError {
    fn from(e: DockerError) -> Self {
        let status = match &e {
            // A refused docker state change (pause on a stopped container
            // and friends) is a conflict, not a server fault.
            DockerError::Command(CommandError::Failed { .. }) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<VpsError> for ApiError {
    fn from(e: VpsError) -> Self {
        let status = match &e {
            VpsError::Validation(_) | VpsError::UnknownGpu(_) => StatusCode::BAD_REQUEST,
            VpsError::VmCapabilityMissing => StatusCode::CONFLICT,
            VpsError::Overlay(crate::overlay::RunnerOverlayError::NoFreeIps(_)) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<VmError> for ApiError {
    fn from(e: VmError) -> Self {
        let status = match &e {
            VmError::NotFound(_) => StatusCode::NOT_FOUND,
            VmError::AlreadyExists(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

/// Accepts the task for background launch; real status arrives at the
/// host through `/api/update`.
async fn execute(State(state): State<AppState>, Json(request): Json<ExecuteTaskRequest>) -> StatusCode {
    info!("Accepted task {} for execution", request.task_id);
    let executor = state.executor.clone();
    tokio::spawn(async move { executor.execute(request).await });
    StatusCode::ACCEPTED
}

async fn kill(State(state): State<AppState>, Json(request): Json<KillTaskRequest>) -> Result<(), ApiError> {
    state.executor.kill(request.task_id, &request.container_name).await?;
    // Confirmed in the next heartbeat too, in case the direct response
    // is lost.
    state.killed.push(request.task_id, "killed on host request");
    Ok(())
}

async fn pause(State(state): State<AppState>, Json(request): Json<PauseResumeRequest>) -> Result<(), ApiError> {
    state.executor.pause(request.task_id, &request.container_name).await?;
    Ok(())
}

async fn resume(State(state): State<AppState>, Json(request): Json<PauseResumeRequest>) -> Result<(), ApiError> {
    state.executor.resume(request.task_id, &request.container_name).await?;
    Ok(())
}

async fn vps_create(
    State(state): State<AppState>,
    Json(request): Json<RunnerCreateVpsRequest>,
) -> Result<Json<RunnerCreateVpsResponse>, ApiError> {
    let response = state.vps.create(request).await?;
    Ok(Json(response))
}

async fn vps_stop(State(state): State<AppState>, Path(task_id): Path<i64>) -> Result<(), ApiError> {
    state.vps.stop(task_id).await?;
    Ok(())
}

async fn vps_restart(State(state): State<AppState>, Path(task_id): Path<i64>) -> Result<(), ApiError> {
    state.vps.restart(task_id).await?;
    Ok(())
}

async fn vm_phone_home(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
    Json(request): Json<VmPhoneHomeRequest>,
) -> Result<(), ApiError> {
    info!("VM {task_id} phoned home (hostname: {:?})", request.hostname);
    state.vps.phone_home(task_id).await?;
    Ok(())
}

async fn vm_telemetry(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
    Json(request): Json<VmTelemetryRequest>,
) -> Result<(), ApiError> {
    state.vms.record_telemetry(task_id, request.gpu_info, request.system_info)?;
    Ok(())
}

async fn list_vms(State(state): State<AppState>) -> Json<Vec<VmInstanceSummary>> {
    let vms = state
        .vms
        .list()
        .into_iter()
        .map(|vm| VmInstanceSummary {
            task_id: vm.task_id,
            pid: vm.pid,
            vm_ip: vm.vm_ip.to_string(),
            tap_device: vm.tap_device,
            gpu_pci_addresses: vm.gpu_pci_addresses,
            ssh_ready: vm.ssh_ready,
            last_heartbeat: vm.last_heartbeat,
        })
        .collect();
    Json(vms)
}

async fn ws_tunnel(
    State(state): State<AppState>,
    Path(container_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| tunnel::handle_container_tunnel(state.tunnels, container_id, socket))
}

#[derive(Debug, Deserialize)]
struct ForwardQuery {
    #[serde(default)]
    proto: Option<String>,
}

async fn ws_forward(
    State(state): State<AppState>,
    Path((container_id, port)): Path<(String, u16)>,
    Query(query): Query<ForwardQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let proto = match query.proto.as_deref() {
        Some("udp") => Proto::Udp,
        _ => Proto::Tcp,
    };
    ws.on_upgrade(move |socket| tunnel::handle_port_forward(state.tunnels, container_id, port, proto, socket))
}

async fn ws_terminal(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let record = state
        .records
        .get(task_id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .ok_or_else(|| ApiError::not_found(format!("no running task {task_id}")))?;
    Ok(ws.on_upgrade(move |socket| tunnel::handle_terminal(record.name, socket)))
}
