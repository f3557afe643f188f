//! Overlay network and IP reservation payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Response for `POST /api/overlay/ip/reserve`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReserveIpResponse {
    pub ip: String,

    /// Self-contained signed token; present it to consume or release.
    pub token: String,

    pub expires_at: DateTime<Utc>,
}

/// Payload for `POST /api/overlay/ip/consume` (runner to host).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsumeReservationRequest {
    pub token: String,

    /// The container (or VM name) claiming the IP.
    pub container_id: String,

    /// The runner making the claim; must match the token.
    pub runner_name: String,
}

/// Response for `POST /api/overlay/ip/consume`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsumeReservationResponse {
    pub ip: String,
}

/// One overlay allocation as returned by `GET /api/overlay/allocations`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AllocationSummary {
    pub runner_name: String,
    pub runner_id: u32,
    pub physical_ip: String,
    pub subnet: String,
    pub gateway: String,
    pub vxlan_device: String,
    pub is_active: bool,
}
