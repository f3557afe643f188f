//! Task submission, execution and status payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{Display, EnumString};

/// The kind of workload a task row describes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskType {
    #[default]
    Command,
    Vps,
}

/// Task lifecycle states. Terminal states are absorbing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigning,
    Running,
    Paused,
    Completed,
    Failed,
    Killed,
    KilledOom,
    Stopped,
    Lost,
}

impl TaskStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Killed | Self::KilledOom | Self::Stopped | Self::Lost)
    }

    /// Active states hold resources on a runner.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Assigning | Self::Running | Self::Paused)
    }
}

/// Where a submission wants to land.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetSelector {
    /// Pin to a specific runner; any online runner when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Pin to a NUMA node on the selected runner.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numa_node_id: Option<u32>,

    /// Pin to specific GPU ids on the selected runner.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_ids: Option<Vec<u32>>,
}

/// Payload for `POST /api/submit`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitTaskRequest {
    pub command: String,

    #[serde(default)]
    pub arguments: Vec<String>,

    #[serde(default)]
    pub env_vars: HashMap<String, String>,

    pub required_cores: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_memory_bytes: Option<u64>,

    /// One task is created per target; an empty list means "any node".
    #[serde(default)]
    pub targets: Vec<TargetSelector>,

    /// Base container tarball name; mutually exclusive with `registry_image`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_image: Option<String>,

    #[serde(default)]
    pub privileged: bool,

    #[serde(default)]
    pub additional_mounts: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    /// A reservation token obtained from `/api/overlay/ip/reserve`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_token: Option<String>,
}

/// Response for `POST /api/submit`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub task_ids: Vec<i64>,
}

/// A runner-reported status change, `POST /api/update`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusUpdate {
    pub task_id: i64,

    pub status: TaskStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Payload for `POST /api/execute` (host to runner).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecuteTaskRequest {
    pub task_id: i64,

    pub command: String,

    #[serde(default)]
    pub arguments: Vec<String>,

    #[serde(default)]
    pub env_vars: HashMap<String, String>,

    pub required_cores: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_memory_bytes: Option<u64>,

    /// GPU ids in this runner's id space.
    #[serde(default)]
    pub required_gpus: Vec<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_numa_node_id: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_image: Option<String>,

    #[serde(default)]
    pub privileged: bool,

    #[serde(default)]
    pub additional_mounts: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    /// Host-side path the runner writes container stdout to.
    pub stdout_path: String,

    pub stderr_path: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_token: Option<String>,
}

/// Payload for `POST /api/kill` (host to runner).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KillTaskRequest {
    pub task_id: i64,
    pub container_name: String,
}

/// Payload for `POST /api/pause` and `POST /api/resume` (host to runner).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PauseResumeRequest {
    pub task_id: i64,
    pub container_name: String,
}

/// One task row as returned by `GET /api/tasks`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: i64,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub command: Option<String>,
    pub required_cores: u32,
    pub required_memory_bytes: Option<u64>,
    pub required_gpus: Option<Vec<u32>>,
    pub target_numa_node_id: Option<u32>,
    pub container_name: Option<String>,
    pub registry_image: Option<String>,
    pub assigned_node: Option<String>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub ssh_port: Option<u16>,
    pub vm_ip: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::completed(TaskStatus::Completed, true)]
    #[case::failed(TaskStatus::Failed, true)]
    #[case::killed(TaskStatus::Killed, true)]
    #[case::killed_oom(TaskStatus::KilledOom, true)]
    #[case::stopped(TaskStatus::Stopped, true)]
    #[case::lost(TaskStatus::Lost, true)]
    #[case::running(TaskStatus::Running, false)]
    #[case::paused(TaskStatus::Paused, false)]
    #[case::assigning(TaskStatus::Assigning, false)]
    fn terminal_states(#[case] status: TaskStatus, #[case] terminal: bool) {
        assert_eq!(status.is_terminal(), terminal);
    }

    #[test]
    fn status_wire_format() {
        let json = serde_json::to_string(&TaskStatus::KilledOom).expect("serialize failed");
        assert_eq!(json, "\"killed_oom\"");
        let parsed: TaskStatus = serde_json::from_str("\"killed_oom\"").expect("parse failed");
        assert_eq!(parsed, TaskStatus::KilledOom);
    }

    #[test]
    fn status_string_roundtrip() {
        let status: TaskStatus = "killed_oom".parse().expect("parse failed");
        assert_eq!(status, TaskStatus::KilledOom);
        assert_eq!(status.to_string(), "killed_oom");
    }
}
