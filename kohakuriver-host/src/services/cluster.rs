//! Node registration, heartbeat intake and reconciliation.

use crate::{
    overlay::manager::{OverlayError, OverlayNetworkManager},
    repositories::{
        node::{NodeHeartbeat, NodeModel, NodeRepository, NodeRepositoryError, NodeStatus},
        task::{StatusChange, TaskRepository, TaskRepositoryError},
    },
};
use chrono::{Duration as ChronoDuration, Utc};
use kohakuriver_models::{
    cluster::{HeartbeatRequest, NodeSummary, RegisterRequest, RegisterResponse},
    task::TaskStatus,
};
use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ClusterServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("node not found")]
    NodeNotFound,

    #[error("overlay allocation failed: {0}")]
    Overlay(#[from] OverlayError),

    #[error("internal: {0}")]
    Internal(String),
}

impl From<NodeRepositoryError> for ClusterServiceError {
    fn from(e: NodeRepositoryError) -> Self {
        match e {
            NodeRepositoryError::NodeNotFound => Self::NodeNotFound,
            NodeRepositoryError::Database(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<TaskRepositoryError> for ClusterServiceError {
    fn from(e: TaskRepositoryError) -> Self {
        Self::Internal(e.to_string())
    }
}

pub struct ClusterServiceArgs {
    pub nodes: Arc<dyn NodeRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub overlay: Option<Arc<OverlayNetworkManager>>,
    pub heartbeat_interval: Duration,
    pub missed_intervals: u32,
}

pub struct ClusterService {
    nodes: Arc<dyn NodeRepository>,
    tasks: Arc<dyn TaskRepository>,
    overlay: Option<Arc<OverlayNetworkManager>>,
    heartbeat_interval: Duration,
    missed_intervals: u32,
    /// Serialises heartbeat processing per hostname so a new heartbeat
    /// never observes a half-applied predecessor.
    heartbeat_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Consecutive heartbeats a running task has been absent from.
    missing_tasks: Mutex<HashMap<(String, i64), u32>>,
    /// Last reported running task ids per node, for the nodes listing.
    running_tasks: Mutex<HashMap<String, Vec<i64>>>,
}

impl ClusterService {
    pub fn new(args: ClusterServiceArgs) -> Self {
        let ClusterServiceArgs { nodes, tasks, overlay, heartbeat_interval, missed_intervals } = args;
        Self {
            nodes,
            tasks,
            overlay,
            heartbeat_interval,
            missed_intervals,
            heartbeat_locks: Default::default(),
            missing_tasks: Default::default(),
            running_tasks: Default::default(),
        }
    }

    /// Handle `POST /api/register`.
    pub async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse, ClusterServiceError> {
        let physical_ip = parse_physical_ip(&request.url)
            .ok_or_else(|| ClusterServiceError::Validation(format!("cannot parse runner address from '{}'", request.url)))?;

        let node = NodeModel {
            hostname: request.hostname.clone(),
            url: request.url.clone(),
            status: NodeStatus::Online,
            total_cores: request.total_cores,
            total_ram_bytes: request.total_ram_bytes,
            numa_topology: request.numa_topology,
            gpu_info: request.gpu_info,
            vm_capable: request.vm_capable,
            vfio_gpus: request.vfio_gpus,
            runner_version: request.runner_version,
            last_heartbeat: Some(Utc::now()),
            registered_at: Utc::now(),
        };
        self.nodes.upsert(node).await?;
        info!("Registered node {} at {}", request.hostname, request.url);

        let overlay = match &self.overlay {
            Some(manager) => {
                let allocation = manager.allocate_for_runner(&request.hostname, physical_ip).await?;
                Some(manager.overlay_block(&allocation)?)
            }
            None => None,
        };
        Ok(RegisterResponse { overlay })
    }

    /// Handle `PUT /api/heartbeat/{hostname}`.
    pub async fn heartbeat(&self, hostname: &str, request: HeartbeatRequest) -> Result<(), ClusterServiceError> {
        let lock = {
            let mut locks = self.heartbeat_locks.lock().expect("heartbeat locks poisoned");
            locks.entry(hostname.to_string()).or_default().clone()
        };
        let _guard = lock.lock().await;

        let heartbeat = NodeHeartbeat {
            gpu_info: request.gpu_info,
            vm_capable: request.vm_capable,
            vfio_gpus: request.vfio_gpus,
            runner_version: Some(request.runner_version),
            seen_at: Utc::now(),
        };
        // Unknown hostname propagates as 404: the runner re-registers.
        self.nodes.apply_heartbeat(hostname, heartbeat).await?;
        if let Some(overlay) = &self.overlay {
            overlay.mark_runner_active(hostname);
        }

        for killed in &request.killed_tasks {
            let change = StatusChange {
                error_message: Some(killed.reason.clone()),
                completed_at: Some(Utc::now()),
                ..StatusChange::new(TaskStatus::Killed)
            };
            match self.tasks.apply_status(killed.task_id, change).await {
                Ok(true) => info!("Task {}: killed by runner ({})", killed.task_id, killed.reason),
                Ok(false) => debug!("Task {}: kill report on terminal row, ignored", killed.task_id),
                Err(e) => warn!("Task {}: failed to persist kill report: {e}", killed.task_id),
            }
        }

        self.detect_missing_tasks(hostname, &request.running_tasks).await?;
        self.running_tasks.lock().expect("running tasks poisoned").insert(hostname.into(), request.running_tasks);
        Ok(())
    }

    /// A task the host believes is running but the runner stopped
    /// reporting is lost after `missed_intervals` consecutive absences.
    async fn detect_missing_tasks(&self, hostname: &str, running: &[i64]) -> Result<(), ClusterServiceError> {
        let active = self.tasks.active_on_node(hostname).await?;
        let mut lost = Vec::new();
        {
            let mut missing = self.missing_tasks.lock().expect("missing tasks poisoned");
            for task in &active {
                if !matches!(task.status, TaskStatus::Running | TaskStatus::Paused) {
                    continue;
                }
                let key = (hostname.to_string(), task.task_id);
                if running.contains(&task.task_id) {
                    missing.remove(&key);
                    continue;
                }
                let count = missing.entry(key.clone()).or_insert(0);
                *count += 1;
                debug!("Task {}: absent from heartbeat {count}/{}", task.task_id, self.missed_intervals);
                if *count >= self.missed_intervals {
                    missing.remove(&key);
                    lost.push(task.task_id);
                }
            }
        }
        for task_id in lost {
            warn!("Task {task_id}: missing from {} heartbeats, marking lost", self.missed_intervals);
            let change = StatusChange {
                error_message: Some("task disappeared from runner heartbeats".into()),
                completed_at: Some(Utc::now()),
                ..StatusChange::new(TaskStatus::Lost)
            };
            self.tasks.apply_status(task_id, change).await?;
        }
        Ok(())
    }

    /// Periodic sweep: nodes silent for `missed_intervals` heartbeats go
    /// offline. Their tasks keep their states; the workloads may well be
    /// alive on a disconnected island.
    pub async fn reconcile(&self) -> Result<(), ClusterServiceError> {
        let window = self.heartbeat_interval * self.missed_intervals;
        let cutoff = Utc::now()
            - ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::seconds(15));
        let offlined = self.nodes.mark_stale_offline(cutoff).await?;
        for hostname in &offlined {
            warn!("Node {hostname} went offline (no heartbeat for {window:?})");
            if let Some(overlay) = &self.overlay {
                overlay.mark_runner_inactive(hostname);
            }
        }
        Ok(())
    }

    /// Handle `GET /api/nodes`.
    pub async fn list_nodes(&self) -> Result<Vec<NodeSummary>, ClusterServiceError> {
        let running = self.running_tasks.lock().expect("running tasks poisoned").clone();
        let nodes = self.nodes.list().await?;
        Ok(nodes
            .into_iter()
            .map(|node| NodeSummary {
                running_tasks: running.get(&node.hostname).cloned().unwrap_or_default(),
                hostname: node.hostname,
                url: node.url,
                status: node.status.to_string(),
                total_cores: node.total_cores,
                total_ram_bytes: node.total_ram_bytes,
                vm_capable: node.vm_capable,
                last_heartbeat: node.last_heartbeat,
                gpu_info: node.gpu_info,
            })
            .collect())
    }
}

/// The runner's physical IP is the host part of its registration URL.
fn parse_physical_ip(url: &str) -> Option<Ipv4Addr> {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let host = rest.split(['/', ':']).next()?;
    host.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::{
        node::MockNodeRepository,
        task::{MockTaskRepository, TaskModel},
    };
    use kohakuriver_models::{
        cluster::KilledTaskReport,
        task::TaskType,
    };
    use mockall::predicate::eq;
    use rstest::rstest;

    fn make_service(nodes: MockNodeRepository, tasks: MockTaskRepository) -> ClusterService {
        ClusterService::new(ClusterServiceArgs {
            nodes: Arc::new(nodes),
            tasks: Arc::new(tasks),
            overlay: None,
            heartbeat_interval: Duration::from_secs(5),
            missed_intervals: 3,
        })
    }

    fn heartbeat_request(running_tasks: Vec<i64>) -> HeartbeatRequest {
        HeartbeatRequest {
            running_tasks,
            killed_tasks: vec![],
            cpu_percent: 10.0,
            memory_percent: 20.0,
            memory_used_bytes: 1024,
            memory_total_bytes: 4096,
            current_avg_temp: None,
            current_max_temp: None,
            gpu_info: vec![],
            vm_capable: false,
            vfio_gpus: None,
            runner_version: "0.1.0".into(),
        }
    }

    fn running_task(task_id: i64, node: &str) -> TaskModel {
        TaskModel {
            task_id,
            task_type: TaskType::Command,
            command: Some("sleep 60".into()),
            arguments: vec![],
            env_vars: Default::default(),
            required_cores: 1,
            required_memory_bytes: None,
            required_gpus: None,
            target_numa_node_id: None,
            container_name: None,
            registry_image: None,
            privileged: false,
            additional_mounts: vec![],
            working_dir: None,
            vps_backend: None,
            ssh_port: None,
            vm_image: None,
            vm_disk_size: None,
            memory_mb: None,
            vm_ip: None,
            assigned_node: Some(node.into()),
            status: TaskStatus::Running,
            exit_code: None,
            error_message: None,
            submitted_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
        }
    }

    #[rstest]
    #[case::plain_http("http://192.168.1.5:8001", Some(Ipv4Addr::new(192, 168, 1, 5)))]
    #[case::no_scheme("192.168.1.5:8001", Some(Ipv4Addr::new(192, 168, 1, 5)))]
    #[case::hostname("http://runner1:8001", None)]
    fn physical_ip_parsing(#[case] url: &str, #[case] expected: Option<Ipv4Addr>) {
        assert_eq!(parse_physical_ip(url), expected);
    }

    #[tokio::test]
    async fn heartbeat_unknown_node_is_not_found() {
        let mut nodes = MockNodeRepository::new();
        nodes.expect_apply_heartbeat().return_once(|_, _| Err(NodeRepositoryError::NodeNotFound));
        let service = make_service(nodes, MockTaskRepository::new());

        let err = service.heartbeat("ghost", heartbeat_request(vec![])).await.expect_err("heartbeat succeeded");
        assert!(matches!(err, ClusterServiceError::NodeNotFound));
    }

    #[tokio::test]
    async fn task_lost_after_three_missing_heartbeats() {
        let mut nodes = MockNodeRepository::new();
        nodes.expect_apply_heartbeat().returning(|_, _| Ok(()));
        let mut tasks = MockTaskRepository::new();
        tasks.expect_active_on_node().with(eq("node1")).returning(|_| Ok(vec![running_task(7, "node1")]));
        tasks
            .expect_apply_status()
            .withf(|task_id, change| *task_id == 7 && change.status == TaskStatus::Lost)
            .once()
            .returning(|_, _| Ok(true));
        let service = make_service(nodes, tasks);

        for _ in 0..3 {
            service.heartbeat("node1", heartbeat_request(vec![])).await.expect("heartbeat failed");
        }
    }

    #[tokio::test]
    async fn present_task_resets_missing_counter() {
        let mut nodes = MockNodeRepository::new();
        nodes.expect_apply_heartbeat().returning(|_, _| Ok(()));
        let mut tasks = MockTaskRepository::new();
        tasks.expect_active_on_node().returning(|_| Ok(vec![running_task(7, "node1")]));
        // Never marked lost.
        tasks.expect_apply_status().never();
        let service = make_service(nodes, tasks);

        service.heartbeat("node1", heartbeat_request(vec![])).await.unwrap();
        service.heartbeat("node1", heartbeat_request(vec![])).await.unwrap();
        // Task shows up again: the counter resets.
        service.heartbeat("node1", heartbeat_request(vec![7])).await.unwrap();
        service.heartbeat("node1", heartbeat_request(vec![])).await.unwrap();
        service.heartbeat("node1", heartbeat_request(vec![])).await.unwrap();
    }

    #[tokio::test]
    async fn killed_reports_are_persisted() {
        let mut nodes = MockNodeRepository::new();
        nodes.expect_apply_heartbeat().returning(|_, _| Ok(()));
        let mut tasks = MockTaskRepository::new();
        tasks.expect_active_on_node().returning(|_| Ok(vec![]));
        tasks
            .expect_apply_status()
            .withf(|task_id, change| {
                *task_id == 9
                    && change.status == TaskStatus::Killed
                    && change.error_message.as_deref() == Some("oom watchdog")
            })
            .once()
            .returning(|_, _| Ok(true));
        let service = make_service(nodes, tasks);

        let mut request = heartbeat_request(vec![]);
        request.killed_tasks = vec![KilledTaskReport { task_id: 9, reason: "oom watchdog".into() }];
        service.heartbeat("node1", request).await.expect("heartbeat failed");
    }

    #[tokio::test]
    async fn reconcile_marks_stale_nodes_offline() {
        let mut nodes = MockNodeRepository::new();
        nodes.expect_mark_stale_offline().return_once(|_| Ok(vec!["node1".into()]));
        let service = make_service(nodes, MockTaskRepository::new());
        service.reconcile().await.expect("reconcile failed");
    }
}
