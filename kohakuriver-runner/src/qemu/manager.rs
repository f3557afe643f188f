//! QEMU VM lifecycle: creation, supervision, stop and recovery.

use crate::{
    commands::{CommandError, run_command, run_command_status},
    overlay::{RunnerOverlayManager, VmNetwork},
    qemu::{
        cloud_init::{self, CloudInitError, CloudInitSpec},
        qmp::{QmpClient, QmpError},
        vfio::{self, VfioError},
    },
    repositories::records::TaskRecord,
    resources,
};
use chrono::{DateTime, Utc};
use kohakuriver_models::{
    cluster::{GpuStats, VmSystemInfo},
    naming,
};
use std::{
    collections::{BTreeSet, HashMap},
    net::Ipv4Addr,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

const QEMU_START_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_POLL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum VmError {
    #[error("VM for task {0} already exists")]
    AlreadyExists(i64),

    #[error("VM for task {0} not found")]
    NotFound(i64),

    #[error("base image '{0}' not found")]
    BaseImageMissing(String),

    #[error("QEMU failed to start: {0}")]
    StartFailed(String),

    #[error(transparent)]
    Vfio(#[from] VfioError),

    #[error(transparent)]
    CloudInit(#[from] CloudInitError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Qmp(#[from] QmpError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One live (or recovering) VM.
#[derive(Clone, Debug)]
pub struct VmInstance {
    pub task_id: i64,
    pub pid: u32,
    pub vm_ip: Ipv4Addr,
    pub tap_device: String,
    pub gpu_pci_addresses: Vec<String>,
    pub instance_dir: PathBuf,
    pub qmp_socket: PathBuf,
    pub ssh_ready: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub vm_gpu_info: Vec<GpuStats>,
    pub vm_system_info: VmSystemInfo,
}

/// What the VPS service asks for when materialising a QEMU VPS.
#[derive(Clone, Debug)]
pub struct VmCreateOptions {
    pub task_id: i64,
    pub base_image: String,
    pub cores: u32,
    pub memory_mb: u32,
    pub disk_size: Option<String>,
    pub gpu_pci_addresses: Vec<String>,
    pub network: VmNetwork,
    pub ssh_public_key: Option<String>,
    pub runner_public_key: Option<String>,
    pub runner_url: String,
}

pub struct VmManagerArgs {
    pub images_dir: PathBuf,
    pub instances_dir: PathBuf,
    pub dns_servers: Vec<String>,
    /// Exported into guests as the `kohaku_shared` 9p filesystem.
    pub shared_dir: PathBuf,
    /// Exported into guests as the `kohaku_local` 9p filesystem.
    pub local_temp_dir: PathBuf,
}

pub struct VmManager {
    images_dir: PathBuf,
    instances_dir: PathBuf,
    dns_servers: Vec<String>,
    shared_dir: PathBuf,
    local_temp_dir: PathBuf,
    instances: Mutex<HashMap<i64, VmInstance>>,
    /// VM creation mutates global state (VFIO binding, tap devices); one
    /// at a time keeps the unwind story simple.
    create_lock: AsyncMutex<()>,
}

pub fn instance_dir(instances_dir: &Path, task_id: i64) -> PathBuf {
    instances_dir.join(naming::vm_name(task_id))
}

pub fn tap_device_name(task_id: i64) -> String {
    // Interface names cap at 15 chars; the id is truncated to fit.
    let name = format!("tap-vm-{task_id}");
    name.chars().take(15).collect()
}

pub fn mac_address(task_id: i64) -> String {
    let bytes = (task_id as u64).to_be_bytes();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", bytes[5], bytes[6], bytes[7])
}

fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

impl VmManager {
    pub fn new(args: VmManagerArgs) -> Self {
        let VmManagerArgs { images_dir, instances_dir, dns_servers, shared_dir, local_temp_dir } = args;
        Self {
            images_dir,
            instances_dir,
            dns_servers,
            shared_dir,
            local_temp_dir,
            instances: Default::default(),
            create_lock: AsyncMutex::new(()),
        }
    }

    pub fn get(&self, task_id: i64) -> Option<VmInstance> {
        self.instances.lock().expect("vm instances poisoned").get(&task_id).cloned()
    }

    pub fn list(&self) -> Vec<VmInstance> {
        self.instances.lock().expect("vm instances poisoned").values().cloned().collect()
    }

    /// Create and start a VM. On any failure every resource allocated so
    /// far is unwound in reverse order.
    pub async fn create_vm(&self, options: VmCreateOptions, overlay: &RunnerOverlayManager) -> Result<VmInstance, VmError> {
        let _guard = self.create_lock.lock().await;
        let task_id = options.task_id;
        if self.instances.lock().expect("vm instances poisoned").contains_key(&task_id) {
            return Err(VmError::AlreadyExists(task_id));
        }

        let dir = instance_dir(&self.instances_dir, task_id);
        tokio::fs::create_dir_all(&dir).await?;

        let base_image = self.images_dir.join(format!("{}.qcow2", options.base_image));
        if !tokio::fs::try_exists(&base_image).await.unwrap_or(false) {
            return Err(VmError::BaseImageMissing(options.base_image.clone()));
        }

        let mut bound_groups: Vec<String> = Vec::new();
        let mut tap_created = false;
        let tap = tap_device_name(task_id);
        let result: Result<VmInstance, VmError> = async {
            // Disk first: an overlay qcow2 backed by the base image.
            let root_disk = dir.join("root.qcow2");
            self.create_overlay_disk(&base_image, &root_disk, options.disk_size.as_deref()).await?;

            // The host driver version must be read before VFIO binding
            // hides the GPU from nvidia-smi.
            let nvidia_driver_version = if options.gpu_pci_addresses.is_empty() {
                None
            } else {
                resources::nvidia_driver_version().await
            };

            // Bind whole IOMMU groups; the full device list (GPU, audio,
            // PLX peers) is what QEMU gets.
            let mut devices: BTreeSet<String> = BTreeSet::new();
            for address in &options.gpu_pci_addresses {
                if !devices.contains(address) {
                    let group = vfio::bind_iommu_group(address).await?;
                    bound_groups.push(address.clone());
                    devices.extend(group);
                }
            }
            let passthrough: Vec<String> = devices.into_iter().collect();

            // Tap device attached to the overlay bridge.
            run_command("ip", &["tuntap", "add", &tap, "mode", "tap"], Duration::from_secs(10)).await?;
            tap_created = true;
            run_command(
                "ip",
                &["link", "set", &tap, "master", options.network.bridge.as_str(), "up"],
                Duration::from_secs(10),
            )
            .await?;

            // Cloud-init seed.
            let seed = dir.join("seed.iso");
            let spec = CloudInitSpec {
                task_id,
                hostname: naming::vm_name(task_id),
                mac_address: mac_address(task_id),
                vm_ip: options.network.ip.to_string(),
                gateway: options.network.gateway.to_string(),
                prefix_len: options.network.prefix_len,
                dns_servers: self.dns_servers.clone(),
                ssh_public_key: options.ssh_public_key.clone(),
                runner_public_key: options.runner_public_key.clone(),
                runner_url: options.runner_url.clone(),
                heartbeat_interval_secs: 10,
                nvidia_driver_version,
            };
            cloud_init::create_seed_iso(&seed, &spec).await?;

            let args = build_qemu_args(&QemuArgsSpec {
                cores: options.cores,
                memory_mb: options.memory_mb,
                root_disk: root_disk.clone(),
                seed_iso: seed,
                tap_device: tap.clone(),
                mac_address: mac_address(task_id),
                qmp_socket: dir.join("qmp.sock"),
                serial_log: dir.join("serial.log"),
                pidfile: dir.join("qemu.pid"),
                ovmf_path: find_ovmf().await,
                shared_dir: Some(self.shared_dir.join("shared_data")),
                local_temp_dir: Some(self.local_temp_dir.clone()),
                passthrough_devices: passthrough.clone(),
            });
            let pid = self.spawn_qemu(&dir, &args).await?;

            Ok(VmInstance {
                task_id,
                pid,
                vm_ip: options.network.ip,
                tap_device: tap.clone(),
                gpu_pci_addresses: passthrough,
                instance_dir: dir.clone(),
                qmp_socket: dir.join("qmp.sock"),
                ssh_ready: false,
                last_heartbeat: None,
                vm_gpu_info: vec![],
                vm_system_info: Default::default(),
            })
        }
        .await;

        match result {
            Ok(instance) => {
                info!("VM {task_id} started: pid={}, ip={}", instance.pid, instance.vm_ip);
                self.instances.lock().expect("vm instances poisoned").insert(task_id, instance.clone());
                Ok(instance)
            }
            Err(e) => {
                warn!("VM {task_id} creation failed, unwinding: {e}");
                if tap_created {
                    let _ = run_command("ip", &["link", "del", &tap], Duration::from_secs(10)).await;
                }
                for address in bound_groups.iter().rev() {
                    vfio::unbind_iommu_group(address).await;
                }
                overlay.release_vm_ip(options.network.ip);
                let _ = tokio::fs::remove_dir_all(&dir).await;
                Err(e)
            }
        }
    }

    async fn create_overlay_disk(&self, base: &Path, output: &Path, size: Option<&str>) -> Result<(), VmError> {
        let base = base.display().to_string();
        let output = output.display().to_string();
        run_command(
            "qemu-img",
            &["create", "-f", "qcow2", "-b", &base, "-F", "qcow2", &output],
            Duration::from_secs(60),
        )
        .await?;
        if let Some(size) = size {
            if let Err(e) = run_command("qemu-img", &["resize", &output, size], Duration::from_secs(60)).await {
                warn!("Failed to resize disk to {size}: {e}");
            }
        }
        info!("Created overlay disk {output} (base={base})");
        Ok(())
    }

    /// `-daemonize` makes the foreground process exit once the daemon is
    /// up; the real PID comes from the pidfile.
    async fn spawn_qemu(&self, dir: &Path, args: &[String]) -> Result<u32, VmError> {
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        let (code, output) = run_command_status("qemu-system-x86_64", &argv, Some(QEMU_START_TIMEOUT)).await?;
        if code != 0 {
            // Stderr also lands in qemu_start.err next to the instance.
            let _ = tokio::fs::write(dir.join("qemu_start.err"), &output.stderr).await;
            let message = if output.stderr.is_empty() {
                format!("exit code {code}")
            } else {
                output.stderr.clone()
            };
            return Err(VmError::StartFailed(message));
        }
        let pidfile = dir.join("qemu.pid");
        let pid: u32 = tokio::fs::read_to_string(&pidfile)
            .await
            .map_err(|e| VmError::StartFailed(format!("cannot read pidfile {}: {e}", pidfile.display())))?
            .trim()
            .parse()
            .map_err(|e| VmError::StartFailed(format!("invalid pidfile contents: {e}")))?;
        if !pid_alive(pid) {
            return Err(VmError::StartFailed("QEMU daemon exited immediately after daemonize".into()));
        }
        Ok(pid)
    }

    /// Graceful stop: QMP powerdown, poll, SIGKILL, then resource unwind.
    pub async fn stop_vm(&self, task_id: i64, overlay: &RunnerOverlayManager) -> Result<(), VmError> {
        let instance = self.get(task_id).ok_or(VmError::NotFound(task_id))?;

        match QmpClient::system_powerdown(&instance.qmp_socket).await {
            Ok(()) => debug!("VM {task_id}: powerdown requested"),
            Err(e) => warn!("VM {task_id}: QMP powerdown failed, will force kill: {e}"),
        }
        let deadline = tokio::time::Instant::now() + STOP_POLL_TIMEOUT;
        while pid_alive(instance.pid) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        if pid_alive(instance.pid) {
            warn!("VM {task_id} did not stop gracefully, killing pid {}", instance.pid);
            let pid = instance.pid.to_string();
            let _ = run_command("kill", &["-9", &pid], Duration::from_secs(5)).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        self.cleanup(&instance, overlay).await;
        self.instances.lock().expect("vm instances poisoned").remove(&task_id);
        info!("VM {task_id} stopped");
        Ok(())
    }

    async fn cleanup(&self, instance: &VmInstance, overlay: &RunnerOverlayManager) {
        let mut unbound: BTreeSet<String> = BTreeSet::new();
        for address in &instance.gpu_pci_addresses {
            if !unbound.contains(address) {
                unbound.extend(vfio::unbind_iommu_group(address).await);
            }
        }
        let _ = run_command("ip", &["link", "del", &instance.tap_device], Duration::from_secs(10)).await;
        overlay.release_vm_ip(instance.vm_ip);
        let _ = tokio::fs::remove_file(&instance.qmp_socket).await;
    }

    /// Soft reboot via QMP: disk, network and GPU binding stay intact.
    pub async fn restart_vm(&self, task_id: i64) -> Result<(), VmError> {
        let instance = self.get(task_id).ok_or(VmError::NotFound(task_id))?;
        QmpClient::system_reset(&instance.qmp_socket).await?;
        info!("VM {task_id}: system reset issued");
        Ok(())
    }

    /// The in-guest agent's first call after cloud-init finishes.
    pub fn phone_home(&self, task_id: i64) -> Result<Ipv4Addr, VmError> {
        let mut instances = self.instances.lock().expect("vm instances poisoned");
        let instance = instances.get_mut(&task_id).ok_or(VmError::NotFound(task_id))?;
        instance.ssh_ready = true;
        instance.last_heartbeat = Some(Utc::now());
        info!("VM {task_id} phoned home from {}", instance.vm_ip);
        Ok(instance.vm_ip)
    }

    /// Periodic telemetry from the in-guest agent.
    pub fn record_telemetry(
        &self,
        task_id: i64,
        gpu_info: Vec<GpuStats>,
        system_info: VmSystemInfo,
    ) -> Result<(), VmError> {
        let mut instances = self.instances.lock().expect("vm instances poisoned");
        let instance = instances.get_mut(&task_id).ok_or(VmError::NotFound(task_id))?;
        instance.last_heartbeat = Some(Utc::now());
        instance.vm_gpu_info = gpu_info;
        instance.vm_system_info = system_info;
        Ok(())
    }

    /// Re-adopt a VM from its persisted record after a runner restart.
    /// Returns false when the underlying process is gone.
    pub async fn recover(&self, record: &TaskRecord, overlay: &RunnerOverlayManager) -> bool {
        let dir = instance_dir(&self.instances_dir, record.task_id);
        let pidfile = dir.join("qemu.pid");
        let pid: Option<u32> = tokio::fs::read_to_string(&pidfile)
            .await
            .ok()
            .and_then(|contents| contents.trim().parse().ok());
        let Some(pid) = pid else {
            warn!("VM {}: no valid pidfile at {}", record.task_id, pidfile.display());
            return false;
        };
        if !pid_alive(pid) {
            warn!("VM {}: pid {pid} not running", record.task_id);
            return false;
        }
        let vm_ip: Ipv4Addr = record.vm_ip.as_deref().and_then(|ip| ip.parse().ok()).unwrap_or(Ipv4Addr::UNSPECIFIED);
        overlay.adopt_vm_ip(vm_ip);
        let instance = VmInstance {
            task_id: record.task_id,
            pid,
            vm_ip,
            tap_device: record.tap_device.clone().unwrap_or_default(),
            gpu_pci_addresses: record.gpu_pci_addresses.clone(),
            instance_dir: dir.clone(),
            qmp_socket: dir.join("qmp.sock"),
            // It survived a restart; the guest was already up.
            ssh_ready: true,
            last_heartbeat: None,
            vm_gpu_info: vec![],
            vm_system_info: Default::default(),
        };
        self.instances.lock().expect("vm instances poisoned").insert(record.task_id, instance);
        info!("VM {}: recovered (pid={pid}, ip={vm_ip})", record.task_id);
        true
    }
}

async fn find_ovmf() -> Option<PathBuf> {
    for candidate in [
        "/usr/share/OVMF/OVMF_CODE_4M.fd",
        "/usr/share/OVMF/OVMF_CODE.fd",
        "/usr/share/edk2/ovmf/OVMF_CODE.fd",
        "/usr/share/qemu/OVMF_CODE.fd",
    ] {
        if tokio::fs::try_exists(candidate).await.unwrap_or(false) {
            return Some(candidate.into());
        }
    }
    None
}

/// Everything that shapes the QEMU command line.
#[derive(Clone, Debug)]
pub(crate) struct QemuArgsSpec {
    pub cores: u32,
    pub memory_mb: u32,
    pub root_disk: PathBuf,
    pub seed_iso: PathBuf,
    pub tap_device: String,
    pub mac_address: String,
    pub qmp_socket: PathBuf,
    pub serial_log: PathBuf,
    pub pidfile: PathBuf,
    pub ovmf_path: Option<PathBuf>,
    pub shared_dir: Option<PathBuf>,
    pub local_temp_dir: Option<PathBuf>,
    pub passthrough_devices: Vec<String>,
}

pub(crate) fn build_qemu_args(spec: &QemuArgsSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-enable-kvm".into(),
        "-machine".into(),
        "q35,accel=kvm".into(),
        "-cpu".into(),
        "host".into(),
        "-smp".into(),
        spec.cores.to_string(),
        "-m".into(),
        format!("{}M", spec.memory_mb),
        "-daemonize".into(),
        "-pidfile".into(),
        spec.pidfile.display().to_string(),
    ];
    if let Some(ovmf) = &spec.ovmf_path {
        args.extend(["-drive".into(), format!("if=pflash,format=raw,readonly=on,file={}", ovmf.display())]);
    }
    args.extend([
        "-drive".into(),
        format!("file={},format=qcow2,if=virtio,cache=writeback", spec.root_disk.display()),
        "-drive".into(),
        format!("file={},format=raw,if=virtio,media=cdrom,readonly=on", spec.seed_iso.display()),
        "-netdev".into(),
        format!("tap,id=net0,ifname={},script=no,downscript=no", spec.tap_device),
        "-device".into(),
        format!("virtio-net-pci,netdev=net0,mac={}", spec.mac_address),
        "-qmp".into(),
        format!("unix:{},server,nowait", spec.qmp_socket.display()),
        "-serial".into(),
        format!("file:{}", spec.serial_log.display()),
        "-display".into(),
        "none".into(),
        "-vga".into(),
        "std".into(),
    ]);
    if let Some(shared) = &spec.shared_dir {
        args.extend([
            "-fsdev".into(),
            format!("local,id=fs_shared,path={},security_model=passthrough", shared.display()),
            "-device".into(),
            "virtio-9p-pci,fsdev=fs_shared,mount_tag=kohaku_shared".into(),
        ]);
    }
    if let Some(local_temp) = &spec.local_temp_dir {
        args.extend([
            "-fsdev".into(),
            format!("local,id=fs_local,path={},security_model=passthrough", local_temp.display()),
            "-device".into(),
            "virtio-9p-pci,fsdev=fs_local,mount_tag=kohaku_local".into(),
        ]);
    }
    for device in &spec.passthrough_devices {
        args.extend(["-device".into(), format!("vfio-pci,host={device}")]);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn qemu_args_full_shape() {
        let spec = QemuArgsSpec {
            cores: 4,
            memory_mb: 4096,
            root_disk: "/vms/vm-1/root.qcow2".into(),
            seed_iso: "/vms/vm-1/seed.iso".into(),
            tap_device: "tap-vm-1".into(),
            mac_address: "52:54:00:00:00:01".into(),
            qmp_socket: "/vms/vm-1/qmp.sock".into(),
            serial_log: "/vms/vm-1/serial.log".into(),
            pidfile: "/vms/vm-1/qemu.pid".into(),
            ovmf_path: Some("/usr/share/OVMF/OVMF_CODE.fd".into()),
            shared_dir: Some("/mnt/cluster/shared_data".into()),
            local_temp_dir: Some("/tmp/kohakuriver".into()),
            passthrough_devices: vec!["0000:01:00.0".into(), "0000:01:00.1".into()],
        };
        let args = build_qemu_args(&spec);
        let expected = [
            "-enable-kvm",
            "-machine",
            "q35,accel=kvm",
            "-cpu",
            "host",
            "-smp",
            "4",
            "-m",
            "4096M",
            "-daemonize",
            "-pidfile",
            "/vms/vm-1/qemu.pid",
            "-drive",
            "if=pflash,format=raw,readonly=on,file=/usr/share/OVMF/OVMF_CODE.fd",
            "-drive",
            "file=/vms/vm-1/root.qcow2,format=qcow2,if=virtio,cache=writeback",
            "-drive",
            "file=/vms/vm-1/seed.iso,format=raw,if=virtio,media=cdrom,readonly=on",
            "-netdev",
            "tap,id=net0,ifname=tap-vm-1,script=no,downscript=no",
            "-device",
            "virtio-net-pci,netdev=net0,mac=52:54:00:00:00:01",
            "-qmp",
            "unix:/vms/vm-1/qmp.sock,server,nowait",
            "-serial",
            "file:/vms/vm-1/serial.log",
            "-display",
            "none",
            "-vga",
            "std",
            "-fsdev",
            "local,id=fs_shared,path=/mnt/cluster/shared_data,security_model=passthrough",
            "-device",
            "virtio-9p-pci,fsdev=fs_shared,mount_tag=kohaku_shared",
            "-fsdev",
            "local,id=fs_local,path=/tmp/kohakuriver,security_model=passthrough",
            "-device",
            "virtio-9p-pci,fsdev=fs_local,mount_tag=kohaku_local",
            "-device",
            "vfio-pci,host=0000:01:00.0",
            "-device",
            "vfio-pci,host=0000:01:00.1",
        ];
        assert_eq!(args, expected);
    }

    #[rstest]
    #[case(1, "52:54:00:00:00:01")]
    #[case(0x2a, "52:54:00:00:00:2a")]
    #[case(0x123456, "52:54:00:12:34:56")]
    fn mac_addresses(#[case] task_id: i64, #[case] expected: &str) {
        assert_eq!(mac_address(task_id), expected);
    }

    #[test]
    fn tap_names_fit_interface_limit() {
        assert_eq!(tap_device_name(1), "tap-vm-1");
        assert!(tap_device_name(7_215_145_152_829_440_123).len() <= 15);
    }

    #[test]
    fn instance_dirs_follow_naming() {
        assert_eq!(instance_dir(Path::new("/vms"), 9), PathBuf::from("/vms/vm-9"));
    }
}
