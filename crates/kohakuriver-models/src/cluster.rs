//! Node registration and heartbeat payloads.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One NUMA node as advertised by a runner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NumaNode {
    /// The NUMA node id.
    pub node_id: u32,

    /// The core ids that belong to this node.
    pub cores: Vec<u32>,

    /// The amount of memory attached to this node.
    pub memory_bytes: u64,
}

/// A snapshot of one GPU's state, reported in heartbeats.
///
/// Most fields are optional: a VFIO-bound GPU is invisible to the host's
/// NVML and only carries whatever the in-VM agent reported.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuStats {
    /// Stable GPU id within this node.
    pub gpu_id: u32,

    /// The GPU model name.
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pci_bus_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_version: Option<String>,

    /// Utilisation percentage, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_utilization: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_utilization: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_total_mib: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_used_mib: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<i32>,

    /// Set when the GPU is passed through to a running VM.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_task_id: Option<i64>,

    /// True when the GPU is currently bound to vfio-pci.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vfio_bound: Option<bool>,
}

/// A GPU eligible for VFIO passthrough, with a stable PCI-derived id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VfioGpu {
    /// Stable GPU id, derived from PCI enumeration order.
    pub gpu_id: u32,

    /// PCI address, e.g. "0000:01:00.0".
    pub pci_address: String,

    pub name: String,

    pub vendor_id: String,

    pub device_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub iommu_group: Option<u32>,

    /// Non-bridge devices sharing the IOMMU group (including the GPU itself).
    #[serde(default)]
    pub iommu_group_peers: Vec<String>,
}

/// Payload for `POST /api/register`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub hostname: String,

    /// The runner's HTTP base URL, e.g. "http://10.0.0.5:8001".
    pub url: String,

    pub total_cores: u32,

    pub total_ram_bytes: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub numa_topology: Option<Vec<NumaNode>>,

    #[serde(default)]
    pub gpu_info: Vec<GpuStats>,

    #[serde(default)]
    pub vm_capable: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vfio_gpus: Option<Vec<VfioGpu>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub runner_version: Option<String>,
}

/// Overlay network parameters handed to a runner on registration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OverlayBlock {
    pub runner_id: u32,

    /// The runner's subnet in CIDR notation, e.g. "10.128.64.0/18".
    pub overlay_subnet: String,

    /// The gateway IP containers use, e.g. "10.128.64.1".
    pub overlay_gateway: String,

    /// The host's overlay-global IP, e.g. "10.128.0.1".
    pub host_overlay_ip: String,

    /// The host's physical IP the VXLAN tunnel terminates at.
    pub host_physical_ip: String,

    /// The host's IP inside this runner's subnet, e.g. "10.128.64.254".
    pub host_ip_on_runner_subnet: String,

    /// The whole overlay network in CIDR notation, for routing rules.
    pub overlay_network_cidr: String,
}

/// Response for `POST /api/register`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Absent when the overlay is disabled on the host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay: Option<OverlayBlock>,
}

/// A task the runner killed locally and still has to report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KilledTaskReport {
    pub task_id: i64,
    pub reason: String,
}

/// Payload for `PUT /api/heartbeat/{hostname}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Task ids currently running on this runner.
    #[serde(default)]
    pub running_tasks: Vec<i64>,

    /// Killed tasks pending report, re-queued by the runner on send failure.
    #[serde(default)]
    pub killed_tasks: Vec<KilledTaskReport>,

    pub cpu_percent: f64,

    pub memory_percent: f64,

    pub memory_used_bytes: u64,

    pub memory_total_bytes: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_avg_temp: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_max_temp: Option<f64>,

    #[serde(default)]
    pub gpu_info: Vec<GpuStats>,

    #[serde(default)]
    pub vm_capable: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vfio_gpus: Option<Vec<VfioGpu>>,

    pub runner_version: String,
}

/// One node as returned by `GET /api/nodes`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSummary {
    pub hostname: String,
    pub url: String,
    pub status: String,
    pub total_cores: u32,
    pub total_ram_bytes: u64,
    pub vm_capable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub gpu_info: Vec<GpuStats>,
    #[serde(default)]
    pub running_tasks: Vec<i64>,
}

/// System stats reported by the in-VM agent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VmSystemInfo {
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub disk_total_bytes: u64,
    pub disk_used_bytes: u64,
    pub load_1m: f64,
}

/// Telemetry the in-VM agent POSTs to its runner every few seconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VmTelemetryRequest {
    #[serde(default)]
    pub gpu_info: Vec<GpuStats>,

    #[serde(default)]
    pub system_info: VmSystemInfo,

    /// Extra key/value details, preserved verbatim for display.
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

/// The one-shot call a VM makes once cloud-init has finished.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VmPhoneHomeRequest {
    /// The guest hostname, if the agent knows it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}
