use crate::routes::{ApiError, AppState};
use axum::{
    Json,
    extract::{Query, State},
};
use kohakuriver_models::overlay::{
    AllocationSummary, ConsumeReservationRequest, ConsumeReservationResponse, ReserveIpResponse,
};
use serde::Deserialize;
use std::{net::Ipv4Addr, time::Duration};

#[derive(Debug, Deserialize)]
pub(crate) struct ReserveQuery {
    runner: String,
    ip: Option<Ipv4Addr>,
    /// TTL in seconds.
    ttl: Option<u64>,
}

pub(crate) async fn reserve(
    State(state): State<AppState>,
    Query(query): Query<ReserveQuery>,
) -> Result<Json<ReserveIpResponse>, ApiError> {
    let ttl = query.ttl.map(Duration::from_secs);
    let reservation = state.reservations.reserve(&query.runner, query.ip, ttl)?;
    Ok(Json(ReserveIpResponse {
        ip: reservation.ip.to_string(),
        token: reservation.token,
        expires_at: reservation.expires_at,
    }))
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReleaseQuery {
    token: String,
}

pub(crate) async fn release(
    State(state): State<AppState>,
    Query(query): Query<ReleaseQuery>,
) -> Result<(), ApiError> {
    state.reservations.release_by_token(&query.token)?;
    Ok(())
}

/// Called by runners at container create time to claim a reserved IP.
pub(crate) async fn consume(
    State(state): State<AppState>,
    Json(request): Json<ConsumeReservationRequest>,
) -> Result<Json<ConsumeReservationResponse>, ApiError> {
    let ip = state.reservations.consume(&request.token, &request.container_id, Some(&request.runner_name))?;
    Ok(Json(ConsumeReservationResponse { ip: ip.to_string() }))
}

pub(crate) async fn allocations(State(state): State<AppState>) -> Json<Vec<AllocationSummary>> {
    let allocations = state
        .reservations
        .overlay()
        .list_allocations()
        .into_iter()
        .map(|a| AllocationSummary {
            runner_name: a.runner_name,
            runner_id: a.runner_id,
            physical_ip: a.physical_ip.to_string(),
            subnet: a.subnet,
            gateway: a.gateway.to_string(),
            vxlan_device: a.vxlan_device,
            is_active: a.is_active,
        })
        .collect();
    Json(allocations)
}
