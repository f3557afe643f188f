//! Batch task execution.
//!
//! `/api/execute` returns 202 immediately; the actual lifecycle runs in a
//! background task that syncs the image, launches `docker run`, waits for
//! the container to exit and reports every state change to the host. The
//! runner is the sole writer of `running`, `completed`, `failed` and
//! `killed_oom`.

use crate::{
    clients::{
        docker::{DockerClient, DockerError},
        host::HostApiClient,
    },
    repositories::records::{TaskRecord, TaskRecordRepository},
    resources,
    services::images::ImageSyncService,
};
use chrono::Utc;
use kohakuriver_models::{
    cluster::NumaNode,
    naming,
    overlay::ConsumeReservationRequest,
    task::{ExecuteTaskRequest, TaskStatus, TaskStatusUpdate},
};
use std::{collections::HashMap, path::PathBuf, sync::Arc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Where the shared logs directory appears inside containers.
const CONTAINER_LOGS_DIR: &str = "/kohakuriver-logs";

/// Tunnel client baked into the base images; started before the user
/// command when present.
const TUNNEL_CLIENT_PATH: &str = "/usr/local/bin/kohakuriver-tunnel-client";

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("container operation failed: {0}")]
    Docker(#[from] DockerError),
}

/// Static node-level settings the executor composes commands from.
#[derive(Clone, Debug)]
pub struct ExecutorSettings {
    pub hostname: String,
    pub shared_dir: PathBuf,
    pub local_temp_dir: PathBuf,
    pub additional_mounts: Vec<String>,
    pub default_network: String,
    pub overlay_network: Option<String>,
    pub tasks_privileged: bool,
    /// ws:// URL prefix the in-container tunnel client dials back to.
    pub tunnel_url_base: String,
    pub numa_topology: Option<Vec<NumaNode>>,
}

pub struct TaskExecutor {
    docker: Arc<dyn DockerClient>,
    images: Arc<ImageSyncService>,
    records: Arc<dyn TaskRecordRepository>,
    host: Arc<dyn HostApiClient>,
    settings: ExecutorSettings,
}

impl TaskExecutor {
    pub fn new(
        docker: Arc<dyn DockerClient>,
        images: Arc<ImageSyncService>,
        records: Arc<dyn TaskRecordRepository>,
        host: Arc<dyn HostApiClient>,
        settings: ExecutorSettings,
    ) -> Self {
        Self { docker, images, records, host, settings }
    }

    async fn report(&self, update: TaskStatusUpdate) {
        let task_id = update.task_id;
        if let Err(e) = self.host.report_status(update).await {
            error!("Task {task_id}: failed to report status to host: {e}");
        }
    }

    async fn report_failed(&self, task_id: i64, message: String) {
        error!("Task {task_id}: {message}");
        self.report(TaskStatusUpdate {
            task_id,
            status: TaskStatus::Failed,
            exit_code: None,
            message: Some(message),
            started_at: None,
            completed_at: Some(Utc::now()),
        })
        .await;
    }

    /// Run one task to completion. Spawned by the `/api/execute` handler.
    pub async fn execute(&self, request: ExecuteTaskRequest) {
        let task_id = request.task_id;
        let started_at = Utc::now();
        info!("Task {task_id}: starting execution of '{}'", request.command);

        // Image sync first; a task on a stale image must not start.
        // Registry images are docker's problem; everything else syncs from
        // shared storage, defaulting to the base container.
        if request.registry_image.is_none() {
            let container_name = request.container_name.as_deref().unwrap_or("kohakuriver-base");
            if let Err(e) = self.images.ensure_synced(container_name).await {
                self.report_failed(task_id, format!("Docker image sync failed: {e}")).await;
                return;
            }
        }

        // A reserved overlay IP is claimed exactly once, before the
        // container exists.
        let container = naming::task_container_name(task_id);
        let reserved_ip = match &request.reservation_token {
            Some(token) => {
                let consume = ConsumeReservationRequest {
                    token: token.clone(),
                    container_id: container.clone(),
                    runner_name: self.settings.hostname.clone(),
                };
                match self.host.consume_reservation(consume).await {
                    Ok(response) => Some(response.ip),
                    Err(e) => {
                        self.report_failed(task_id, format!("IP reservation rejected: {e}")).await;
                        return;
                    }
                }
            }
            None => None,
        };

        let args = build_docker_run_args(&request, &self.settings, reserved_ip.as_deref());

        // Persist before creation: a crash between here and the exit
        // report is resolved by startup reconciliation.
        let record = TaskRecord::container(
            task_id,
            container.clone(),
            request.required_cores,
            request.required_gpus.clone(),
            request.target_numa_node_id,
        );
        if let Err(e) = self.records.insert(record).await {
            self.report_failed(task_id, format!("cannot persist task record: {e}")).await;
            return;
        }

        self.report(TaskStatusUpdate {
            task_id,
            status: TaskStatus::Running,
            exit_code: None,
            message: None,
            started_at: Some(started_at),
            completed_at: None,
        })
        .await;

        let exit = match self.docker.run_to_completion(args).await {
            Ok(exit) => exit,
            Err(e) => {
                let _ = self.records.remove(task_id).await;
                self.report_failed(task_id, format!("docker run failed: {e}")).await;
                return;
            }
        };
        debug!("Task {task_id}: container exited with code {}", exit.exit_code);

        // kill() removes the record before signalling the container, so
        // a missing record means the host already owns the final state.
        match self.records.remove(task_id).await {
            Ok(true) => {}
            Ok(false) => {
                info!("Task {task_id}: killed externally, skipping status report");
                return;
            }
            Err(e) => warn!("Task {task_id}: failed to drop record: {e}"),
        }

        let (status, message) = classify_exit(exit.exit_code, &exit.stderr);
        info!("Task {task_id}: finished as {status}");
        self.report(TaskStatusUpdate {
            task_id,
            status,
            exit_code: Some(exit.exit_code),
            message,
            started_at: Some(started_at),
            completed_at: Some(Utc::now()),
        })
        .await;
    }

    /// Handle `/api/kill`. The record is dropped before the signal so the
    /// waiting executor does not also post a terminal status; the host
    /// already owns `killed`.
    pub async fn kill(&self, task_id: i64, container_name: &str) -> Result<(), ExecutorError> {
        match self.records.remove(task_id).await {
            Ok(removed) => debug!("Task {task_id}: record removed before kill ({removed})"),
            Err(e) => warn!("Task {task_id}: failed to drop record before kill: {e}"),
        }
        match self.docker.kill(container_name).await {
            Ok(()) => info!("Task {task_id}: killed"),
            // The container may already be gone; the task is dead either way.
            Err(e) => warn!("Task {task_id}: docker kill reported: {e}"),
        }
        Ok(())
    }

    pub async fn pause(&self, task_id: i64, container_name: &str) -> Result<(), ExecutorError> {
        self.docker.pause(container_name).await?;
        info!("Task {task_id}: paused");
        Ok(())
    }

    pub async fn resume(&self, task_id: i64, container_name: &str) -> Result<(), ExecutorError> {
        self.docker.unpause(container_name).await?;
        info!("Task {task_id}: resumed");
        Ok(())
    }
}

/// Map a container exit code onto the task state machine.
///
/// 137 is 128+SIGKILL, which in practice means the kernel OOM killer;
/// 143 is 128+SIGTERM.
fn classify_exit(exit_code: i32, stderr: &str) -> (TaskStatus, Option<String>) {
    match exit_code {
        0 => (TaskStatus::Completed, None),
        137 => (TaskStatus::KilledOom, Some("Container killed (SIGKILL) - likely out of memory.".into())),
        143 => (TaskStatus::Failed, Some("Container terminated (SIGTERM).".into())),
        code => {
            let mut message = format!("Container exited with code {code}.");
            let stderr = stderr.trim();
            if !stderr.is_empty() {
                let snippet: String = stderr.chars().take(500).collect();
                message.push_str(&format!(" Docker stderr: {snippet}"));
            }
            (TaskStatus::Failed, Some(message))
        }
    }
}

/// POSIX single-quote escaping.
fn shell_quote(value: &str) -> String {
    if !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || "-_./=:".contains(c)) {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Rewrite a host-side log path into the container-side mount.
fn container_log_path(host_path: &str, logs_dir: &std::path::Path) -> String {
    let logs = logs_dir.display().to_string();
    match host_path.strip_prefix(&logs) {
        Some(rest) => format!("{CONTAINER_LOGS_DIR}{rest}"),
        None => host_path.to_string(),
    }
}

/// Compose the full `docker run` argument list for a task.
pub(crate) fn build_docker_run_args(
    request: &ExecuteTaskRequest,
    settings: &ExecutorSettings,
    reserved_ip: Option<&str>,
) -> Vec<String> {
    let container = naming::task_container_name(request.task_id);
    let mut args: Vec<String> = vec!["--rm".into(), "--name".into(), container.clone()];

    // A reserved IP implies the overlay network; everything else uses the
    // node-local bridge.
    match (reserved_ip, &settings.overlay_network) {
        (Some(ip), Some(network)) => {
            args.extend(["--network".into(), network.clone(), "--ip".into(), ip.to_string()]);
        }
        _ => args.extend(["--network".into(), settings.default_network.clone()]),
    }

    if request.privileged || settings.tasks_privileged {
        args.push("--privileged".into());
    } else {
        args.extend(["--cap-add".into(), "SYS_NICE".into()]);
    }

    let shared = settings.shared_dir.display();
    let local_temp = settings.local_temp_dir.display();
    let mut mounts = vec![
        format!("{shared}/shared_data:/shared"),
        format!("{shared}/logs:{CONTAINER_LOGS_DIR}"),
        format!("{local_temp}:/local_temp"),
    ];
    mounts.extend(settings.additional_mounts.iter().cloned());
    mounts.extend(request.additional_mounts.iter().cloned());
    for mount in mounts {
        let mut parts = mount.splitn(3, ':');
        let (Some(source), Some(target)) = (parts.next(), parts.next()) else {
            warn!("Invalid mount '{mount}', skipping");
            continue;
        };
        let options = parts.next().map(|options| format!(",{options}")).unwrap_or_default();
        args.extend(["--mount".into(), format!("type=bind,source={source},target={target}{options}")]);
    }

    if let Some(working_dir) = &request.working_dir {
        args.extend(["--workdir".into(), working_dir.clone()]);
    }
    if request.required_cores > 0 {
        args.extend(["--cpus".into(), request.required_cores.to_string()]);
    }
    if let Some(memory) = request.required_memory_bytes {
        args.extend(["--memory".into(), format!("{}m", memory / (1024 * 1024))]);
    }
    if !request.required_gpus.is_empty() {
        let ids = request.required_gpus.iter().map(ToString::to_string).collect::<Vec<_>>().join(",");
        args.extend(["--gpus".into(), format!("\"device={ids}\"")]);
    }

    let mut env: HashMap<String, String> = request.env_vars.clone();
    env.insert("KOHAKURIVER_TASK_ID".into(), request.task_id.to_string());
    env.insert("KOHAKURIVER_SHARED_DIR".into(), shared.to_string());
    env.insert("KOHAKURIVER_LOCAL_TEMP_DIR".into(), local_temp.to_string());
    if let Some(numa) = request.target_numa_node_id {
        env.insert("KOHAKURIVER_TARGET_NUMA_NODE".into(), numa.to_string());
    }
    env.insert("KOHAKURIVER_TUNNEL_URL".into(), format!("{}/ws/tunnel/{container}", settings.tunnel_url_base));
    let mut env: Vec<_> = env.into_iter().collect();
    env.sort();
    for (key, value) in env {
        args.extend(["-e".into(), format!("{key}={value}")]);
    }

    let image = match (&request.container_name, &request.registry_image) {
        (Some(name), _) => naming::image_tag(name),
        (None, Some(image)) => image.clone(),
        (None, None) => naming::image_tag("kohakuriver-base"),
    };
    args.push(image);

    // The container entrypoint is a shell that optionally boots the
    // tunnel client, then execs the user command with output redirected
    // into the shared logs mount.
    let quoted_args = request.arguments.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" ");
    let numa_prefix = resources::numa_prefix(request.target_numa_node_id, settings.numa_topology.as_deref());
    let mut inner = match numa_prefix {
        Some(prefix) => format!("{prefix} {}", request.command),
        None => request.command.clone(),
    };
    if !quoted_args.is_empty() {
        inner = format!("{inner} {quoted_args}");
    }
    let logs_dir = settings.shared_dir.join("logs");
    let stdout = shell_quote(&container_log_path(&request.stdout_path, &logs_dir));
    let stderr = shell_quote(&container_log_path(&request.stderr_path, &logs_dir));
    let shell_cmd = format!(
        "([ -x {TUNNEL_CLIENT_PATH} ] && {TUNNEL_CLIENT_PATH} &); exec {inner} > {stdout} 2> {stderr}"
    );
    args.extend(["/bin/sh".into(), "-c".into(), shell_cmd]);
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clients::{docker::{ContainerExit, MockDockerClient}, host::MockHostApiClient},
        repositories::records::MockTaskRecordRepository,
    };
    use mockall::predicate::eq;
    use rstest::rstest;
    use std::time::Duration;

    fn settings() -> ExecutorSettings {
        ExecutorSettings {
            hostname: "node1".into(),
            shared_dir: "/mnt/cluster".into(),
            local_temp_dir: "/tmp/kohakuriver".into(),
            additional_mounts: vec![],
            default_network: "kohakuriver-net".into(),
            overlay_network: Some("kohakuriver-overlay".into()),
            tasks_privileged: false,
            tunnel_url_base: "ws://172.31.0.1:8001".into(),
            numa_topology: None,
        }
    }

    fn request(task_id: i64) -> ExecuteTaskRequest {
        ExecuteTaskRequest {
            task_id,
            command: "echo hi".into(),
            arguments: vec![],
            env_vars: HashMap::new(),
            required_cores: 1,
            required_memory_bytes: None,
            required_gpus: vec![],
            target_numa_node_id: None,
            container_name: Some("envA".into()),
            registry_image: None,
            privileged: false,
            additional_mounts: vec![],
            working_dir: None,
            stdout_path: "/mnt/cluster/logs/1.out".into(),
            stderr_path: "/mnt/cluster/logs/1.err".into(),
            reservation_token: None,
        }
    }

    #[rstest]
    #[case::success(0, TaskStatus::Completed)]
    #[case::oom(137, TaskStatus::KilledOom)]
    #[case::sigterm(143, TaskStatus::Failed)]
    #[case::error(2, TaskStatus::Failed)]
    fn exit_classification(#[case] code: i32, #[case] expected: TaskStatus) {
        let (status, _) = classify_exit(code, "");
        assert_eq!(status, expected);
    }

    #[test]
    fn exit_message_includes_stderr_snippet() {
        let long_stderr = "x".repeat(1000);
        let (_, message) = classify_exit(1, &long_stderr);
        let message = message.expect("no message");
        assert!(message.contains("code 1"));
        // Snippet is capped at 500 chars.
        assert!(message.len() < 600);
    }

    #[rstest]
    #[case::plain("hello", "hello")]
    #[case::with_space("hello world", "'hello world'")]
    #[case::with_quote("it's", r"'it'\''s'")]
    #[case::empty("", "''")]
    #[case::path("/a/b-c.txt", "/a/b-c.txt")]
    fn quoting(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(shell_quote(input), expected);
    }

    #[test]
    fn run_args_basic_shape() {
        let args = build_docker_run_args(&request(1), &settings(), None);
        let rendered = args.join(" ");
        assert!(args.starts_with(&["--rm".into(), "--name".into(), "kohakuriver-task-1".into()]));
        assert!(rendered.contains("--network kohakuriver-net"));
        assert!(rendered.contains("--cap-add SYS_NICE"));
        assert!(rendered.contains("type=bind,source=/mnt/cluster/shared_data,target=/shared"));
        assert!(rendered.contains("type=bind,source=/mnt/cluster/logs,target=/kohakuriver-logs"));
        assert!(rendered.contains("--cpus 1"));
        assert!(rendered.contains("kohakuriver/envA:base"));
        // Log paths are rewritten into the container mount.
        let shell = args.last().expect("no shell command");
        assert!(shell.contains("exec echo hi > /kohakuriver-logs/1.out 2> /kohakuriver-logs/1.err"), "{shell}");
    }

    #[test]
    fn run_args_reserved_ip_joins_overlay() {
        let args = build_docker_run_args(&request(1), &settings(), Some("10.128.64.5"));
        let rendered = args.join(" ");
        assert!(rendered.contains("--network kohakuriver-overlay --ip 10.128.64.5"));
        assert!(!rendered.contains("kohakuriver-net"));
    }

    #[test]
    fn run_args_resources_and_numa() {
        let mut req = request(2);
        req.required_memory_bytes = Some(512 * 1024 * 1024);
        req.required_gpus = vec![0, 1];
        req.target_numa_node_id = Some(0);
        let mut settings = settings();
        settings.numa_topology = Some(vec![NumaNode { node_id: 0, cores: vec![0, 1], memory_bytes: 1 << 30 }]);

        let args = build_docker_run_args(&req, &settings, None);
        let rendered = args.join(" ");
        assert!(rendered.contains("--memory 512m"));
        assert!(rendered.contains("--gpus \"device=0,1\""));
        let shell = args.last().unwrap();
        assert!(shell.contains("numactl --cpunodebind=0 --membind=0 echo hi"), "{shell}");
        assert!(rendered.contains("-e KOHAKURIVER_TARGET_NUMA_NODE=0"));
    }

    #[test]
    fn run_args_privileged_skips_cap_add() {
        let mut req = request(3);
        req.privileged = true;
        let rendered = build_docker_run_args(&req, &settings(), None).join(" ");
        assert!(rendered.contains("--privileged"));
        assert!(!rendered.contains("--cap-add"));
    }

    fn make_executor(
        docker: MockDockerClient,
        records: MockTaskRecordRepository,
        host: MockHostApiClient,
    ) -> TaskExecutor {
        let mut sync_docker = MockDockerClient::new();
        sync_docker.expect_image_created().returning(|_| Some(chrono::Utc::now()));
        let images = Arc::new(ImageSyncService::new(
            Arc::new(sync_docker),
            std::env::temp_dir(),
            Duration::from_secs(600),
        ));
        TaskExecutor::new(Arc::new(docker), images, Arc::new(records), Arc::new(host), settings())
    }

    #[tokio::test]
    async fn successful_run_reports_running_then_completed() {
        let mut docker = MockDockerClient::new();
        docker.expect_run_to_completion().return_once(|_| Ok(ContainerExit { exit_code: 0, stderr: String::new() }));
        let mut records = MockTaskRecordRepository::new();
        records.expect_insert().once().returning(|_| Ok(()));
        records.expect_remove().with(eq(1)).return_once(|_| Ok(true));
        let mut host = MockHostApiClient::new();
        let mut reported = Vec::new();
        host.expect_report_status().times(2).returning(move |update| {
            reported.push(update.status);
            assert!(matches!(update.status, TaskStatus::Running | TaskStatus::Completed));
            Ok(())
        });

        make_executor(docker, records, host).execute(request(1)).await;
    }

    #[tokio::test]
    async fn externally_killed_run_reports_nothing_terminal() {
        let mut docker = MockDockerClient::new();
        docker
            .expect_run_to_completion()
            .return_once(|_| Ok(ContainerExit { exit_code: 137, stderr: String::new() }));
        let mut records = MockTaskRecordRepository::new();
        records.expect_insert().returning(|_| Ok(()));
        // Record already gone: kill() removed it first.
        records.expect_remove().with(eq(1)).return_once(|_| Ok(false));
        let mut host = MockHostApiClient::new();
        // Only the initial `running` report goes out.
        host.expect_report_status()
            .withf(|update| update.status == TaskStatus::Running)
            .once()
            .returning(|_| Ok(()));

        make_executor(docker, records, host).execute(request(1)).await;
    }

    #[tokio::test]
    async fn kill_removes_record_before_signal() {
        let mut records = MockTaskRecordRepository::new();
        let mut docker = MockDockerClient::new();
        let mut sequence = mockall::Sequence::new();
        records
            .expect_remove()
            .with(eq(5))
            .once()
            .in_sequence(&mut sequence)
            .returning(|_| Ok(true));
        docker
            .expect_kill()
            .with(eq("kohakuriver-task-5"))
            .once()
            .in_sequence(&mut sequence)
            .returning(|_| Ok(()));

        let executor = make_executor(docker, records, MockHostApiClient::new());
        executor.kill(5, "kohakuriver-task-5").await.expect("kill failed");
    }

    #[tokio::test]
    async fn image_sync_failure_fails_task() {
        let docker = MockDockerClient::new();
        let records = MockTaskRecordRepository::new();
        let mut host = MockHostApiClient::new();
        host.expect_report_status()
            .withf(|update| {
                update.status == TaskStatus::Failed
                    && update.message.as_deref().is_some_and(|m| m.contains("image sync failed"))
            })
            .once()
            .returning(|_| Ok(()));

        // No tarball and no local image: sync fails.
        let mut sync_docker = MockDockerClient::new();
        sync_docker.expect_image_created().returning(|_| None);
        let dir = tempfile::tempdir().unwrap();
        let images = Arc::new(ImageSyncService::new(
            Arc::new(sync_docker),
            dir.path().to_path_buf(),
            Duration::from_secs(600),
        ));
        let executor =
            TaskExecutor::new(Arc::new(docker), images, Arc::new(records), Arc::new(host), settings());
        executor.execute(request(1)).await;
    }
}
