//! Task and VPS lifecycle on the host side.
//!
//! Writer split: the runner owns `running`, `completed`, `failed` and
//! `killed_oom` (delivered through `handle_status_update`); the host owns
//! `assigning`, `killed`, `paused`, `stopped` and `lost`. Every write goes
//! through the repository's terminal-absorbing primary-key update.

use crate::{
    clients::runner::{RunnerClient, RunnerClientError},
    ids::TaskIdGenerator,
    overlay::reservation::IpReservationManager,
    repositories::{
        node::{NodeModel, NodeRepository, NodeRepositoryError},
        task::{StatusChange, TaskFilter, TaskModel, TaskRepository, TaskRepositoryError},
    },
    scheduler::{self, NodeUsage, ResourceRequest, ScheduleError},
};
use chrono::Utc;
use kohakuriver_models::{
    naming,
    task::{
        ExecuteTaskRequest, KillTaskRequest, PauseResumeRequest, SubmitTaskRequest, TargetSelector, TaskStatus,
        TaskStatusUpdate, TaskSummary, TaskType,
    },
    vps::{CreateVpsRequest, CreateVpsResponse, RunnerCreateVpsRequest, SshKeyMode, VpsBackend},
};
use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum TaskServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("no node can satisfy the request: {0}")]
    ResourceExhausted(String),

    #[error("task not found")]
    TaskNotFound,

    #[error("{0}")]
    StateConflict(String),

    #[error("runner unreachable: {0}")]
    RunnerUnreachable(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl From<TaskRepositoryError> for TaskServiceError {
    fn from(e: TaskRepositoryError) -> Self {
        match e {
            TaskRepositoryError::TaskNotFound => Self::TaskNotFound,
            TaskRepositoryError::Database(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<NodeRepositoryError> for TaskServiceError {
    fn from(e: NodeRepositoryError) -> Self {
        match e {
            NodeRepositoryError::NodeNotFound => Self::Internal("assigned node vanished".into()),
            NodeRepositoryError::Database(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<ScheduleError> for TaskServiceError {
    fn from(e: ScheduleError) -> Self {
        Self::ResourceExhausted(e.to_string())
    }
}

/// VPS-related knobs, lifted out of the host config.
#[derive(Clone, Debug)]
pub struct VpsSettings {
    pub ssh_port_start: u16,
    pub vm_watchdog: Duration,
    pub vm_gpu_watchdog: Duration,
}

pub struct TaskServiceArgs {
    pub tasks: Arc<dyn TaskRepository>,
    pub nodes: Arc<dyn NodeRepository>,
    pub runner_client: Arc<dyn RunnerClient>,
    pub reservations: Arc<IpReservationManager>,
    pub ids: Arc<TaskIdGenerator>,
    pub shared_dir: PathBuf,
    pub vps: VpsSettings,
}

pub struct TaskService {
    tasks: Arc<dyn TaskRepository>,
    nodes: Arc<dyn NodeRepository>,
    runner_client: Arc<dyn RunnerClient>,
    reservations: Arc<IpReservationManager>,
    ids: Arc<TaskIdGenerator>,
    shared_dir: PathBuf,
    vps: VpsSettings,
}

impl TaskService {
    pub fn new(args: TaskServiceArgs) -> Self {
        let TaskServiceArgs { tasks, nodes, runner_client, reservations, ids, shared_dir, vps } = args;
        Self { tasks, nodes, runner_client, reservations, ids, shared_dir, vps }
    }

    fn logs_dir(&self) -> PathBuf {
        self.shared_dir.join("logs")
    }

    async fn usage_by_node(&self) -> Result<HashMap<String, NodeUsage>, TaskServiceError> {
        let active = self.tasks.active().await?;
        let mut by_node: HashMap<String, Vec<&TaskModel>> = HashMap::new();
        for task in &active {
            if let Some(node) = &task.assigned_node {
                by_node.entry(node.clone()).or_default().push(task);
            }
        }
        Ok(by_node.into_iter().map(|(node, tasks)| (node, NodeUsage::from_tasks(tasks))).collect())
    }

    async fn schedule(
        &self,
        request: &ResourceRequest,
        online: &[NodeModel],
    ) -> Result<NodeModel, TaskServiceError> {
        let usage = self.usage_by_node().await?;
        let node = scheduler::pick_node(online, &usage, request)?;
        Ok(node.clone())
    }

    /// Handle `POST /api/submit`. One row per target; a target that fails
    /// to place gets a `failed` row without rolling back its siblings.
    pub async fn submit(self: &Arc<Self>, request: SubmitTaskRequest) -> Result<Vec<i64>, TaskServiceError> {
        // Neither set means the default base container.
        if request.container_name.is_some() && request.registry_image.is_some() {
            return Err(TaskServiceError::Validation(
                "container_name and registry_image are mutually exclusive".into(),
            ));
        }
        if request.required_cores == 0 {
            return Err(TaskServiceError::Validation("required_cores must be at least 1".into()));
        }

        let online = self.nodes.list_online().await?;
        let targets = if request.targets.is_empty() { vec![TargetSelector::default()] } else { request.targets.clone() };
        let mut task_ids = Vec::with_capacity(targets.len());
        for target in targets {
            let task_id = self.ids.next_id();
            task_ids.push(task_id);
            let row = TaskModel {
                task_id,
                task_type: TaskType::Command,
                command: Some(request.command.clone()),
                arguments: request.arguments.clone(),
                env_vars: request.env_vars.clone(),
                required_cores: request.required_cores,
                required_memory_bytes: request.required_memory_bytes,
                required_gpus: target.gpu_ids.clone(),
                target_numa_node_id: target.numa_node_id,
                container_name: request.container_name.clone(),
                registry_image: request.registry_image.clone(),
                privileged: request.privileged,
                additional_mounts: request.additional_mounts.clone(),
                working_dir: request.working_dir.clone(),
                vps_backend: None,
                ssh_port: None,
                vm_image: None,
                vm_disk_size: None,
                memory_mb: None,
                vm_ip: None,
                assigned_node: None,
                status: TaskStatus::Assigning,
                exit_code: None,
                error_message: None,
                submitted_at: Utc::now(),
                started_at: None,
                completed_at: None,
            };

            let resource_request = ResourceRequest {
                cores: request.required_cores,
                memory_bytes: request.required_memory_bytes,
                gpu_ids: target.gpu_ids.clone().unwrap_or_default(),
                hostname: target.hostname.clone(),
                numa_node_id: target.numa_node_id,
                needs_vm: false,
            };
            match self.schedule(&resource_request, &online).await {
                Ok(node) => {
                    let row = TaskModel { assigned_node: Some(node.hostname.clone()), ..row };
                    self.tasks.create(row).await?;
                    info!("Task {task_id} assigned to {}", node.hostname);
                    let execute = self.build_execute_request(task_id, &request, &target);
                    let service = self.clone();
                    tokio::spawn(async move { service.dispatch_execute(task_id, node, execute).await });
                }
                Err(e) => {
                    // Scheduling failure: the row goes straight to failed
                    // without any runner having been touched.
                    warn!("Task {task_id} cannot be placed: {e}");
                    self.tasks.create(row).await?;
                    let change = StatusChange {
                        error_message: Some(e.to_string()),
                        completed_at: Some(Utc::now()),
                        ..StatusChange::new(TaskStatus::Failed)
                    };
                    self.tasks.apply_status(task_id, change).await?;
                }
            }
        }
        Ok(task_ids)
    }

    fn build_execute_request(
        &self,
        task_id: i64,
        request: &SubmitTaskRequest,
        target: &TargetSelector,
    ) -> ExecuteTaskRequest {
        let logs = self.logs_dir();
        ExecuteTaskRequest {
            task_id,
            command: request.command.clone(),
            arguments: request.arguments.clone(),
            env_vars: request.env_vars.clone(),
            required_cores: request.required_cores,
            required_memory_bytes: request.required_memory_bytes,
            required_gpus: target.gpu_ids.clone().unwrap_or_default(),
            target_numa_node_id: target.numa_node_id,
            container_name: request.container_name.clone(),
            registry_image: request.registry_image.clone(),
            privileged: request.privileged,
            additional_mounts: request.additional_mounts.clone(),
            working_dir: request.working_dir.clone(),
            stdout_path: logs.join(format!("{task_id}.out")).display().to_string(),
            stderr_path: logs.join(format!("{task_id}.err")).display().to_string(),
            reservation_token: request.reservation_token.clone(),
        }
    }

    async fn dispatch_execute(&self, task_id: i64, node: NodeModel, request: ExecuteTaskRequest) {
        match self.runner_client.execute(&node.url, request).await {
            Ok(()) => debug!("Task {task_id} accepted by {}", node.hostname),
            Err(RunnerClientError::Transport(e)) => {
                // The runner may or may not have received the task; it owns
                // the truth and the row stays in assigning.
                warn!("Task {task_id}: runner {} unreachable, leaving task assigning: {e}", node.hostname);
            }
            Err(e @ RunnerClientError::Rejected { .. }) => {
                error!("Task {task_id} rejected by {}: {e}", node.hostname);
                let change = StatusChange {
                    error_message: Some(e.to_string()),
                    completed_at: Some(Utc::now()),
                    ..StatusChange::new(TaskStatus::Failed)
                };
                if let Err(e) = self.tasks.apply_status(task_id, change).await {
                    error!("Task {task_id}: failed to persist rejection: {e}");
                }
            }
        }
    }

    /// Handle `POST /api/update`, the runner's side of the writer split.
    pub async fn handle_status_update(&self, update: TaskStatusUpdate) -> Result<(), TaskServiceError> {
        let task = self.tasks.find(update.task_id).await?;
        let change = StatusChange {
            status: update.status,
            exit_code: update.exit_code,
            error_message: update.message.clone(),
            started_at: update.started_at,
            completed_at: update.completed_at,
        };
        let applied = self.tasks.apply_status(update.task_id, change).await?;
        if !applied {
            // Terminal state wins; a late report is dropped on the floor.
            debug!("Task {}: ignoring update to {} on terminal row", update.task_id, update.status);
            return Ok(());
        }
        info!("Task {}: {} -> {}", update.task_id, task.status, update.status);
        if update.status.is_terminal() {
            self.release_task_resources(&task);
        }
        Ok(())
    }

    fn release_task_resources(&self, task: &TaskModel) {
        let container = container_name_for(task);
        let released = self.reservations.release_by_container(&container);
        if !released.is_empty() {
            info!("Task {}: released overlay IPs {released:?}", task.task_id);
        }
    }

    /// Handle `POST /api/tasks/{id}/kill`. The host marks the row killed
    /// immediately and tells the runner afterwards.
    pub async fn kill(self: &Arc<Self>, task_id: i64) -> Result<(), TaskServiceError> {
        let task = self.tasks.find(task_id).await?;
        if task.status.is_terminal() {
            return Err(TaskServiceError::StateConflict(format!("task already {}", task.status)));
        }
        let change = StatusChange { completed_at: Some(Utc::now()), ..StatusChange::new(TaskStatus::Killed) };
        self.tasks.apply_status(task_id, change).await?;
        self.release_task_resources(&task);

        if let Some(node_name) = &task.assigned_node {
            let node = self.nodes.find(node_name).await?;
            let request = KillTaskRequest { task_id, container_name: container_name_for(&task) };
            let service = self.clone();
            tokio::spawn(async move {
                if let Err(e) = service.runner_client.kill(&node.url, request).await {
                    warn!("Task {task_id}: kill delivery failed: {e}");
                }
            });
        }
        Ok(())
    }

    pub async fn pause(&self, task_id: i64) -> Result<(), TaskServiceError> {
        let task = self.tasks.find(task_id).await?;
        if task.status != TaskStatus::Running {
            return Err(TaskServiceError::StateConflict(format!("cannot pause a {} task", task.status)));
        }
        self.deliver_pause_resume(&task, true).await?;
        self.tasks.apply_status(task_id, StatusChange::new(TaskStatus::Paused)).await?;
        Ok(())
    }

    pub async fn resume(&self, task_id: i64) -> Result<(), TaskServiceError> {
        let task = self.tasks.find(task_id).await?;
        if task.status != TaskStatus::Paused {
            return Err(TaskServiceError::StateConflict(format!("cannot resume a {} task", task.status)));
        }
        self.deliver_pause_resume(&task, false).await?;
        self.tasks.apply_status(task_id, StatusChange::new(TaskStatus::Running)).await?;
        Ok(())
    }

    async fn deliver_pause_resume(&self, task: &TaskModel, pause: bool) -> Result<(), TaskServiceError> {
        let node_name =
            task.assigned_node.as_ref().ok_or_else(|| TaskServiceError::StateConflict("task has no node".into()))?;
        let node = self.nodes.find(node_name).await?;
        let request = PauseResumeRequest { task_id: task.task_id, container_name: container_name_for(task) };
        let result = if pause {
            self.runner_client.pause(&node.url, request).await
        } else {
            self.runner_client.resume(&node.url, request).await
        };
        result.map_err(|e| match e {
            RunnerClientError::Transport(e) => TaskServiceError::RunnerUnreachable(e),
            RunnerClientError::Rejected { body, .. } => TaskServiceError::StateConflict(body),
        })
    }

    pub async fn list(&self, filter: TaskFilter) -> Result<Vec<TaskSummary>, TaskServiceError> {
        Ok(self.tasks.list(filter).await?.into_iter().map(TaskSummary::from).collect())
    }

    pub async fn get(&self, task_id: i64) -> Result<TaskSummary, TaskServiceError> {
        Ok(self.tasks.find(task_id).await?.into())
    }

    /// Serve a task's stdout or stderr from the shared logs directory.
    pub async fn read_log(&self, task_id: i64, stderr: bool) -> Result<String, TaskServiceError> {
        // Ensure the task exists before touching the filesystem.
        self.tasks.find(task_id).await?;
        let suffix = if stderr { "err" } else { "out" };
        let path = self.logs_dir().join(format!("{task_id}.{suffix}"));
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| TaskServiceError::Internal(format!("cannot open {}: {e}", path.display())))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .await
            .map_err(|e| TaskServiceError::Internal(format!("cannot read {}: {e}", path.display())))?;
        Ok(contents)
    }

    /// Handle `POST /api/vps/create`. The runner call is awaited without a
    /// timeout; a host-side watchdog fails VMs that never phone home.
    pub async fn create_vps(self: &Arc<Self>, request: CreateVpsRequest) -> Result<CreateVpsResponse, TaskServiceError> {
        self.validate_vps(&request)?;

        let ssh_enabled = request.ssh_key_mode != SshKeyMode::Disabled;
        let ssh_port = if ssh_enabled { Some(self.allocate_ssh_port().await?) } else { None };

        let online = self.nodes.list_online().await?;
        let target = request.target.clone().unwrap_or_default();
        let gpu_ids = request.required_gpus.clone().unwrap_or_default();
        let resource_request = ResourceRequest {
            cores: request.required_cores,
            memory_bytes: request.required_memory_bytes,
            gpu_ids: gpu_ids.clone(),
            hostname: target.hostname.clone(),
            numa_node_id: target.numa_node_id,
            needs_vm: request.vps_backend == VpsBackend::Qemu,
        };
        let node = self.schedule(&resource_request, &online).await?;

        let task_id = self.ids.next_id();
        let row = TaskModel {
            task_id,
            task_type: TaskType::Vps,
            command: None,
            arguments: vec![],
            env_vars: request.env_vars.clone(),
            required_cores: request.required_cores,
            required_memory_bytes: request.required_memory_bytes,
            required_gpus: request.required_gpus.clone(),
            target_numa_node_id: target.numa_node_id,
            container_name: request.container_name.clone(),
            registry_image: request.registry_image.clone(),
            privileged: false,
            additional_mounts: vec![],
            working_dir: None,
            vps_backend: Some(request.vps_backend),
            ssh_port,
            vm_image: request.vm_image.clone(),
            vm_disk_size: request.vm_disk_size.clone(),
            memory_mb: request.memory_mb,
            vm_ip: None,
            assigned_node: Some(node.hostname.clone()),
            status: TaskStatus::Assigning,
            exit_code: None,
            error_message: None,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.tasks.create(row).await?;
        info!("VPS {task_id} ({}) assigned to {}", request.vps_backend, node.hostname);

        if request.vps_backend == VpsBackend::Qemu {
            self.spawn_vm_watchdog(task_id, !gpu_ids.is_empty());
        }

        let runner_request = RunnerCreateVpsRequest {
            task_id,
            vps_backend: request.vps_backend,
            required_cores: request.required_cores,
            required_memory_bytes: request.required_memory_bytes,
            required_gpus: gpu_ids,
            target_numa_node_id: target.numa_node_id,
            ssh_key_mode: request.ssh_key_mode,
            ssh_public_key: request.ssh_public_key.clone(),
            ssh_port,
            container_name: request.container_name.clone(),
            registry_image: request.registry_image.clone(),
            vm_image: request.vm_image.clone(),
            vm_disk_size: request.vm_disk_size.clone(),
            memory_mb: request.memory_mb,
            env_vars: request.env_vars,
            reservation_token: None,
        };
        match self.runner_client.create_vps(&node.url, runner_request).await {
            Ok(response) => {
                if let Some(vm_ip) = &response.vm_ip {
                    self.tasks.set_vm_ip(task_id, vm_ip).await?;
                }
                Ok(CreateVpsResponse { task_id, ssh_port, private_key: response.private_key })
            }
            Err(RunnerClientError::Transport(e)) => {
                // The runner may still be materialising the VPS; leave the
                // row assigning and let the watchdog or a status report
                // settle it.
                warn!("VPS {task_id}: lost connection during creation: {e}");
                Err(TaskServiceError::RunnerUnreachable(e))
            }
            Err(e @ RunnerClientError::Rejected { .. }) => {
                let change = StatusChange {
                    error_message: Some(e.to_string()),
                    completed_at: Some(Utc::now()),
                    ..StatusChange::new(TaskStatus::Failed)
                };
                self.tasks.apply_status(task_id, change).await?;
                Err(TaskServiceError::StateConflict(e.to_string()))
            }
        }
    }

    fn validate_vps(&self, request: &CreateVpsRequest) -> Result<(), TaskServiceError> {
        if request.required_cores == 0 {
            return Err(TaskServiceError::Validation("required_cores must be at least 1".into()));
        }
        match request.vps_backend {
            VpsBackend::Qemu => {
                if request.vm_image.is_none() {
                    return Err(TaskServiceError::Validation("vm_image is required for the qemu backend".into()));
                }
            }
            VpsBackend::Docker => {
                if request.container_name.is_some() && request.registry_image.is_some() {
                    return Err(TaskServiceError::Validation(
                        "container_name and registry_image are mutually exclusive".into(),
                    ));
                }
            }
        }
        if request.ssh_key_mode == SshKeyMode::Upload && request.ssh_public_key.is_none() {
            return Err(TaskServiceError::Validation("ssh_public_key is required for upload key mode".into()));
        }
        Ok(())
    }

    /// Smallest free port at or above the configured start, unique across
    /// all active VPS.
    async fn allocate_ssh_port(&self) -> Result<u16, TaskServiceError> {
        let used: std::collections::HashSet<u16> = self.tasks.active_ssh_ports().await?.into_iter().collect();
        (self.vps.ssh_port_start..u16::MAX)
            .find(|port| !used.contains(port))
            .ok_or_else(|| TaskServiceError::ResourceExhausted("ssh port space exhausted".into()))
    }

    fn spawn_vm_watchdog(&self, task_id: i64, has_gpus: bool) {
        let timeout = if has_gpus { self.vps.vm_gpu_watchdog } else { self.vps.vm_watchdog };
        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let task = match tasks.find(task_id).await {
                Ok(task) => task,
                Err(e) => {
                    warn!("VPS {task_id}: watchdog lookup failed: {e}");
                    return;
                }
            };
            if task.status == TaskStatus::Assigning {
                warn!("VPS {task_id}: VM never phoned home within {timeout:?}, failing");
                let change = StatusChange {
                    error_message: Some(format!("VM did not phone home within {timeout:?}")),
                    completed_at: Some(Utc::now()),
                    ..StatusChange::new(TaskStatus::Failed)
                };
                if let Err(e) = tasks.apply_status(task_id, change).await {
                    error!("VPS {task_id}: watchdog failed to persist: {e}");
                }
            }
        });
    }

    /// Handle `POST /api/vps/stop/{id}`.
    pub async fn stop_vps(&self, task_id: i64) -> Result<(), TaskServiceError> {
        let task = self.find_vps(task_id).await?;
        if task.status.is_terminal() {
            return Err(TaskServiceError::StateConflict(format!("vps already {}", task.status)));
        }
        let node = self.node_of(&task).await?;
        self.runner_client.stop_vps(&node.url, task_id).await.map_err(map_delivery_error)?;
        let change = StatusChange { completed_at: Some(Utc::now()), ..StatusChange::new(TaskStatus::Stopped) };
        self.tasks.apply_status(task_id, change).await?;
        self.release_task_resources(&task);
        Ok(())
    }

    /// Handle `POST /api/vps/restart/{id}`. For QEMU this is a QMP
    /// `system_reset`: disk, network and GPU binding survive.
    pub async fn restart_vps(&self, task_id: i64) -> Result<(), TaskServiceError> {
        let task = self.find_vps(task_id).await?;
        if task.status != TaskStatus::Running {
            return Err(TaskServiceError::StateConflict(format!("cannot restart a {} vps", task.status)));
        }
        let node = self.node_of(&task).await?;
        self.runner_client.restart_vps(&node.url, task_id).await.map_err(map_delivery_error)
    }

    /// Resolve where a tunnel or terminal session for a task must go:
    /// the runner's base URL and the container (or VM) name.
    pub async fn forward_target(&self, task_id: i64) -> Result<(String, String), TaskServiceError> {
        let task = self.tasks.find(task_id).await?;
        if task.status != TaskStatus::Running {
            return Err(TaskServiceError::StateConflict(format!("task is not running (status: {})", task.status)));
        }
        let node = self.node_of(&task).await?;
        Ok((node.url, container_name_for(&task)))
    }

    async fn find_vps(&self, task_id: i64) -> Result<TaskModel, TaskServiceError> {
        let task = self.tasks.find(task_id).await?;
        if task.task_type != TaskType::Vps {
            return Err(TaskServiceError::Validation(format!("task {task_id} is not a vps")));
        }
        Ok(task)
    }

    async fn node_of(&self, task: &TaskModel) -> Result<NodeModel, TaskServiceError> {
        let node_name =
            task.assigned_node.as_ref().ok_or_else(|| TaskServiceError::StateConflict("vps has no node".into()))?;
        Ok(self.nodes.find(node_name).await?)
    }
}

fn map_delivery_error(e: RunnerClientError) -> TaskServiceError {
    match e {
        RunnerClientError::Transport(e) => TaskServiceError::RunnerUnreachable(e),
        RunnerClientError::Rejected { body, .. } => TaskServiceError::StateConflict(body),
    }
}

/// The container (or VM) name a task materialises as on its runner.
pub fn container_name_for(task: &TaskModel) -> String {
    match (task.task_type, task.vps_backend) {
        (TaskType::Vps, Some(VpsBackend::Qemu)) => naming::vm_name(task.task_id),
        (TaskType::Vps, _) => naming::vps_container_name(task.task_id),
        (TaskType::Command, _) => naming::task_container_name(task.task_id),
    }
}
