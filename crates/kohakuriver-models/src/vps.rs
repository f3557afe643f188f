//! VPS creation and lifecycle payloads.

use crate::task::TargetSelector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{Display, EnumString};

/// Which engine backs a VPS.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VpsBackend {
    #[default]
    Docker,
    Qemu,
}

/// How SSH access to a VPS is provisioned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SshKeyMode {
    /// No SSH at all; no port is allocated.
    Disabled,

    /// SSH enabled but no key injected (password or image-baked access).
    None,

    /// The caller provides a public key.
    #[default]
    Upload,

    /// The runner generates a keypair and returns the private key once.
    Generate,
}

/// Payload for `POST /api/vps/create` (client to host).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateVpsRequest {
    pub required_cores: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_memory_bytes: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_gpus: Option<Vec<u32>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetSelector>,

    #[serde(default)]
    pub vps_backend: VpsBackend,

    #[serde(default)]
    pub ssh_key_mode: SshKeyMode,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,

    /// Docker backend: base container tarball name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_image: Option<String>,

    /// QEMU backend: base image name (e.g. "ubuntu-24.04").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_image: Option<String>,

    /// QEMU backend: overlay disk size, e.g. "40G".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_disk_size: Option<String>,

    /// QEMU backend: guest RAM in MiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u32>,

    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

/// Response for `POST /api/vps/create`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateVpsResponse {
    pub task_id: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,

    /// Only present for `ssh_key_mode = generate`; never stored host-side.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

/// Payload for `POST /api/vps/create` (host to runner).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunnerCreateVpsRequest {
    pub task_id: i64,

    pub vps_backend: VpsBackend,

    pub required_cores: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_memory_bytes: Option<u64>,

    #[serde(default)]
    pub required_gpus: Vec<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_numa_node_id: Option<u32>,

    pub ssh_key_mode: SshKeyMode,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_image: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_image: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_disk_size: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u32>,

    #[serde(default)]
    pub env_vars: HashMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_token: Option<String>,
}

/// Response for the runner-side VPS create call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunnerCreateVpsResponse {
    pub task_id: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_ip: Option<String>,
}

/// One VM instance as reported by a runner.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VmInstanceSummary {
    pub task_id: i64,
    pub pid: u32,
    pub vm_ip: String,
    pub tap_device: String,
    #[serde(default)]
    pub gpu_pci_addresses: Vec<String>,
    pub ssh_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}
