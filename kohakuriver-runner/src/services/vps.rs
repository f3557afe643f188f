//! VPS materialisation on the runner: Docker containers with sshd, or
//! QEMU VMs with cloud-init provisioning.

use crate::{
    clients::{docker::{DockerClient, DockerError}, host::HostApiClient},
    commands::{CommandError, run_command},
    overlay::{RunnerOverlayManager, RunnerOverlayError},
    qemu::{
        capability::VmCapability,
        manager::{VmCreateOptions, VmError, VmManager},
    },
    repositories::records::{RecordKind, TaskRecord, TaskRecordRepository},
    services::images::{ImageSyncError, ImageSyncService},
};
use chrono::Utc;
use kohakuriver_models::{
    naming,
    task::{TaskStatus, TaskStatusUpdate},
    vps::{RunnerCreateVpsRequest, RunnerCreateVpsResponse, SshKeyMode, VpsBackend},
};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum VpsError {
    #[error("{0}")]
    Validation(String),

    #[error("this node is not VM capable")]
    VmCapabilityMissing,

    #[error("unknown GPU id {0}")]
    UnknownGpu(u32),

    #[error("image sync failed: {0}")]
    ImageSync(#[from] ImageSyncError),

    #[error("docker failed: {0}")]
    Docker(#[from] DockerError),

    #[error("vm creation failed: {0}")]
    Vm(#[from] VmError),

    #[error("overlay: {0}")]
    Overlay(#[from] RunnerOverlayError),

    #[error("ssh keygen failed: {0}")]
    SshKeygen(String),

    #[error("internal: {0}")]
    Internal(String),
}

/// A generated SSH keypair; the private half is returned once and never
/// stored.
struct GeneratedKeypair {
    private_key: String,
    public_key: String,
}

pub struct VpsServiceArgs {
    pub docker: Arc<dyn DockerClient>,
    pub images: Arc<ImageSyncService>,
    pub records: Arc<dyn TaskRecordRepository>,
    pub host: Arc<dyn HostApiClient>,
    pub overlay: Arc<RunnerOverlayManager>,
    pub vms: Arc<VmManager>,
    pub capability: Arc<RwLock<VmCapability>>,
    pub hostname: String,
    /// This runner's own public key, injected into guests for probing.
    pub runner_public_key: Option<String>,
    /// The URL guests reach this runner at (phone home, telemetry).
    pub runner_url: String,
    pub default_network: String,
}

pub struct VpsService {
    docker: Arc<dyn DockerClient>,
    images: Arc<ImageSyncService>,
    records: Arc<dyn TaskRecordRepository>,
    host: Arc<dyn HostApiClient>,
    overlay: Arc<RunnerOverlayManager>,
    vms: Arc<VmManager>,
    capability: Arc<RwLock<VmCapability>>,
    hostname: String,
    runner_public_key: Option<String>,
    runner_url: String,
    default_network: String,
}

impl VpsService {
    pub fn new(args: VpsServiceArgs) -> Self {
        let VpsServiceArgs {
            docker,
            images,
            records,
            host,
            overlay,
            vms,
            capability,
            hostname,
            runner_public_key,
            runner_url,
            default_network,
        } = args;
        Self {
            docker,
            images,
            records,
            host,
            overlay,
            vms,
            capability,
            hostname,
            runner_public_key,
            runner_url,
            default_network,
        }
    }

    pub async fn create(&self, request: RunnerCreateVpsRequest) -> Result<RunnerCreateVpsResponse, VpsError> {
        let keypair = match request.ssh_key_mode {
            SshKeyMode::Generate => Some(self.generate_keypair(request.task_id).await?),
            _ => None,
        };
        let public_key = match (request.ssh_key_mode, &keypair) {
            (SshKeyMode::Upload, _) => request.ssh_public_key.clone(),
            (SshKeyMode::Generate, Some(keypair)) => Some(keypair.public_key.clone()),
            _ => None,
        };

        match request.vps_backend {
            VpsBackend::Docker => self.create_docker_vps(&request, public_key.as_deref()).await?,
            VpsBackend::Qemu => {
                let vm_ip = self.create_vm_vps(&request, public_key.as_deref()).await?;
                return Ok(RunnerCreateVpsResponse {
                    task_id: request.task_id,
                    private_key: keypair.map(|k| k.private_key),
                    vm_ip: Some(vm_ip),
                });
            }
        }
        Ok(RunnerCreateVpsResponse {
            task_id: request.task_id,
            private_key: keypair.map(|k| k.private_key),
            vm_ip: None,
        })
    }

    async fn generate_keypair(&self, task_id: i64) -> Result<GeneratedKeypair, VpsError> {
        let dir = tempfile::TempDir::with_prefix("kohakuriver-keygen")
            .map_err(|e| VpsError::SshKeygen(e.to_string()))?;
        let key_path = dir.path().join("key");
        let path = key_path.display().to_string();
        let comment = format!("kohakuriver-vps-{task_id}");
        run_command(
            "ssh-keygen",
            &["-t", "ed25519", "-N", "", "-f", &path, "-C", &comment],
            Duration::from_secs(15),
        )
        .await
        .map_err(|e: CommandError| VpsError::SshKeygen(e.to_string()))?;
        let private_key =
            tokio::fs::read_to_string(&key_path).await.map_err(|e| VpsError::SshKeygen(e.to_string()))?;
        let public_key = tokio::fs::read_to_string(key_path.with_extension("pub"))
            .await
            .map_err(|e| VpsError::SshKeygen(e.to_string()))?
            .trim()
            .to_string();
        Ok(GeneratedKeypair { private_key, public_key })
    }

    async fn create_docker_vps(
        &self,
        request: &RunnerCreateVpsRequest,
        public_key: Option<&str>,
    ) -> Result<(), VpsError> {
        let task_id = request.task_id;
        let container = naming::vps_container_name(task_id);
        if request.registry_image.is_none() {
            let container_name = request.container_name.as_deref().unwrap_or("kohakuriver-base");
            self.images.ensure_synced(container_name).await?;
        }

        let record = TaskRecord {
            ssh_port: request.ssh_port,
            ..TaskRecord::container(
                task_id,
                container.clone(),
                request.required_cores,
                request.required_gpus.clone(),
                request.target_numa_node_id,
            )
        };
        self.records.insert(record).await.map_err(|e| VpsError::Internal(e.to_string()))?;

        let args = build_docker_vps_args(request, &container, &self.default_network, public_key);
        if let Err(e) = self.docker.run_detached(args).await {
            let _ = self.records.remove(task_id).await;
            return Err(e.into());
        }
        info!("VPS {task_id}: container {container} started");

        self.report_running(task_id).await;
        Ok(())
    }

    async fn create_vm_vps(
        &self,
        request: &RunnerCreateVpsRequest,
        public_key: Option<&str>,
    ) -> Result<String, VpsError> {
        let task_id = request.task_id;
        let capability = self.capability.read().await;
        if !capability.vm_capable {
            return Err(VpsError::VmCapabilityMissing);
        }
        let vm_image = request
            .vm_image
            .clone()
            .ok_or_else(|| VpsError::Validation("vm_image is required for the qemu backend".into()))?;

        // GPU ids resolve to PCI addresses in this node's stable id space.
        let mut gpu_pci_addresses = Vec::new();
        for gpu_id in &request.required_gpus {
            let gpu = capability
                .vfio_gpus
                .iter()
                .find(|gpu| gpu.gpu_id == *gpu_id)
                .ok_or(VpsError::UnknownGpu(*gpu_id))?;
            gpu_pci_addresses.push(gpu.pci_address.clone());
        }
        drop(capability);

        let network = self.overlay.allocate_vm_network()?;
        let memory_mb = request
            .memory_mb
            .or(request.required_memory_bytes.map(|bytes| (bytes / (1024 * 1024)) as u32))
            .unwrap_or(2048);

        let record = TaskRecord {
            kind: RecordKind::Vm,
            vm_ip: Some(network.ip.to_string()),
            tap_device: Some(crate::qemu::manager::tap_device_name(task_id)),
            mac_address: Some(crate::qemu::manager::mac_address(task_id)),
            gpu_pci_addresses: gpu_pci_addresses.clone(),
            ssh_port: request.ssh_port,
            network_mode: Some("overlay".into()),
            bridge_name: Some(network.bridge.clone()),
            ..TaskRecord::container(
                task_id,
                naming::vm_name(task_id),
                request.required_cores,
                request.required_gpus.clone(),
                request.target_numa_node_id,
            )
        };
        self.records.insert(record).await.map_err(|e| VpsError::Internal(e.to_string()))?;

        let options = VmCreateOptions {
            task_id,
            base_image: vm_image,
            cores: request.required_cores,
            memory_mb,
            disk_size: request.vm_disk_size.clone(),
            gpu_pci_addresses,
            network: network.clone(),
            ssh_public_key: public_key.map(ToString::to_string),
            runner_public_key: self.runner_public_key.clone(),
            runner_url: self.runner_url.clone(),
        };
        match self.vms.create_vm(options, &self.overlay).await {
            Ok(instance) => Ok(instance.vm_ip.to_string()),
            Err(e) => {
                let _ = self.records.remove(task_id).await;
                Err(e.into())
            }
        }
    }

    async fn report_running(&self, task_id: i64) {
        let update = TaskStatusUpdate {
            task_id,
            status: TaskStatus::Running,
            exit_code: None,
            message: None,
            started_at: Some(Utc::now()),
            completed_at: None,
        };
        if let Err(e) = self.host.report_status(update).await {
            error!("VPS {task_id}: failed to report running: {e}");
        }
    }

    /// `POST /api/vps/stop/{id}` from the host.
    pub async fn stop(&self, task_id: i64) -> Result<(), VpsError> {
        let record = self
            .records
            .get(task_id)
            .await
            .map_err(|e| VpsError::Internal(e.to_string()))?
            .ok_or_else(|| VpsError::Validation(format!("no record for task {task_id}")))?;
        // Drop the record first so nothing else reports a terminal state;
        // the host owns `stopped`.
        let _ = self.records.remove(task_id).await;
        match record.kind {
            RecordKind::Vm => self.vms.stop_vm(task_id, &self.overlay).await?,
            RecordKind::Container => {
                self.docker.stop(&record.name).await?;
            }
        }
        info!("VPS {task_id}: stopped");
        Ok(())
    }

    /// `POST /api/vps/restart/{id}` from the host. QEMU VPS get a QMP
    /// `system_reset`; Docker VPS a `docker restart`.
    pub async fn restart(&self, task_id: i64) -> Result<(), VpsError> {
        let record = self
            .records
            .get(task_id)
            .await
            .map_err(|e| VpsError::Internal(e.to_string()))?
            .ok_or_else(|| VpsError::Validation(format!("no record for task {task_id}")))?;
        match record.kind {
            RecordKind::Vm => self.vms.restart_vm(task_id).await?,
            RecordKind::Container => self.docker.restart(&record.name).await?,
        }
        Ok(())
    }

    /// The in-guest agent's one-shot phone-home. Promotes the task to
    /// running on the host.
    pub async fn phone_home(&self, task_id: i64) -> Result<(), VpsError> {
        self.vms.phone_home(task_id)?;
        self.report_running(task_id).await;
        Ok(())
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}

/// Arguments after `docker run -d` for a Docker-backed VPS.
fn build_docker_vps_args(
    request: &RunnerCreateVpsRequest,
    container: &str,
    network: &str,
    public_key: Option<&str>,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--restart".into(),
        "unless-stopped".into(),
        "--name".into(),
        container.into(),
        "--network".into(),
        network.into(),
    ];
    if let Some(ssh_port) = request.ssh_port {
        args.extend(["-p".into(), format!("{ssh_port}:22")]);
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
    for (key, value) in &request.env_vars {
        args.extend(["-e".into(), format!("{key}={value}")]);
    }
    let image = match (&request.container_name, &request.registry_image) {
        (Some(name), _) => naming::image_tag(name),
        (None, Some(image)) => image.clone(),
        (None, None) => naming::image_tag("kohakuriver-base"),
    };
    args.push(image);

    // Long-running entrypoint: install the authorised key, then sshd in
    // the foreground.
    let key_setup = match public_key {
        Some(key) => format!("mkdir -p /root/.ssh && echo '{key}' >> /root/.ssh/authorized_keys && "),
        None => String::new(),
    };
    let command = format!("{key_setup}mkdir -p /run/sshd && exec /usr/sbin/sshd -D -e");
    args.extend(["/bin/sh".into(), "-c".into(), command]);
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn request(task_id: i64) -> RunnerCreateVpsRequest {
        RunnerCreateVpsRequest {
            task_id,
            vps_backend: VpsBackend::Docker,
            required_cores: 2,
            required_memory_bytes: Some(1024 * 1024 * 1024),
            required_gpus: vec![],
            target_numa_node_id: None,
            ssh_key_mode: SshKeyMode::Upload,
            ssh_public_key: Some("ssh-ed25519 AAAA user".into()),
            ssh_port: Some(2222),
            container_name: Some("envA".into()),
            registry_image: None,
            vm_image: None,
            vm_disk_size: None,
            memory_mb: None,
            env_vars: HashMap::new(),
            reservation_token: None,
        }
    }

    #[test]
    fn docker_vps_args_shape() {
        let req = request(7);
        let args = build_docker_vps_args(&req, "kohakuriver-vps-7", "kohakuriver-net", Some("ssh-ed25519 AAAA user"));
        let rendered = args.join(" ");
        assert!(rendered.contains("--restart unless-stopped"));
        assert!(rendered.contains("--name kohakuriver-vps-7"));
        assert!(rendered.contains("-p 2222:22"));
        assert!(rendered.contains("--cpus 2"));
        assert!(rendered.contains("--memory 1024m"));
        assert!(rendered.contains("kohakuriver/envA:base"));
        let shell = args.last().expect("no command");
        assert!(shell.contains("authorized_keys"));
        assert!(shell.contains("exec /usr/sbin/sshd -D"));
    }

    #[test]
    fn docker_vps_args_without_ssh() {
        let mut req = request(8);
        req.ssh_port = None;
        let args = build_docker_vps_args(&req, "kohakuriver-vps-8", "kohakuriver-net", None);
        let rendered = args.join(" ");
        assert!(!rendered.contains("-p "));
        assert!(!args.last().unwrap().contains("authorized_keys"));
    }
}
