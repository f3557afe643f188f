//! Wire types shared between the Host, the Runners and their clients.
//!
//! Every payload exchanged over HTTP or WebSocket is defined here so both
//! sides of each protocol agree on field names and nullability.

pub mod cluster;
pub mod naming;
pub mod overlay;
pub mod task;
pub mod tunnel;
pub mod vps;

use serde::{Deserialize, Serialize};

/// The JSON body returned for every failed request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human readable description of what went wrong.
    pub detail: String,
}

impl ErrorResponse {
    pub fn new<S: Into<String>>(detail: S) -> Self {
        Self { detail: detail.into() }
    }
}
