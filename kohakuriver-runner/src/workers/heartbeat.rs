//! Periodic heartbeats to the host, with killed-task re-queue and
//! VM-aware GPU reporting.

use crate::{
    clients::host::{HostApiClient, HostClientError},
    qemu::{capability::VmCapability, manager::VmManager},
    repositories::records::TaskRecordRepository,
    resources,
};
use kohakuriver_models::cluster::{
    GpuStats, HeartbeatRequest, KilledTaskReport, NumaNode, RegisterRequest, RegisterResponse,
};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Killed tasks pending report; re-queued whenever a heartbeat fails.
#[derive(Default)]
pub struct KilledTaskQueue {
    pending: Mutex<Vec<KilledTaskReport>>,
}

impl KilledTaskQueue {
    pub fn push(&self, task_id: i64, reason: impl Into<String>) {
        self.pending.lock().expect("killed queue poisoned").push(KilledTaskReport { task_id, reason: reason.into() });
    }

    fn drain(&self) -> Vec<KilledTaskReport> {
        std::mem::take(&mut *self.pending.lock().expect("killed queue poisoned"))
    }

    fn requeue(&self, reports: Vec<KilledTaskReport>) {
        self.pending.lock().expect("killed queue poisoned").extend(reports);
    }
}

/// The static half of the registration payload; dynamic parts (GPUs, VM
/// capability) are refreshed each time.
#[derive(Clone)]
pub struct NodeIdentity {
    pub hostname: String,
    pub url: String,
    pub total_cores: u32,
    pub total_ram_bytes: u64,
    pub numa_topology: Option<Vec<NumaNode>>,
}

pub async fn register_node(
    host: &Arc<dyn HostApiClient>,
    identity: &NodeIdentity,
    capability: &Arc<RwLock<VmCapability>>,
) -> Result<RegisterResponse, HostClientError> {
    let capability = capability.read().await.clone();
    let request = RegisterRequest {
        hostname: identity.hostname.clone(),
        url: identity.url.clone(),
        total_cores: identity.total_cores,
        total_ram_bytes: identity.total_ram_bytes,
        numa_topology: identity.numa_topology.clone(),
        gpu_info: resources::gpu_stats().await,
        vm_capable: capability.vm_capable,
        vfio_gpus: (!capability.vfio_gpus.is_empty()).then_some(capability.vfio_gpus),
        runner_version: Some(env!("CARGO_PKG_VERSION").to_string()),
    };
    host.register(request).await
}

pub struct HeartbeatWorker {
    pub host: Arc<dyn HostApiClient>,
    pub records: Arc<dyn TaskRecordRepository>,
    pub vms: Arc<VmManager>,
    pub capability: Arc<RwLock<VmCapability>>,
    pub killed: Arc<KilledTaskQueue>,
    pub identity: NodeIdentity,
    pub interval: Duration,
}

impl HeartbeatWorker {
    pub fn spawn(self) {
        tokio::spawn(async move { self.run().await });
    }

    async fn run(self) {
        loop {
            tokio::time::sleep(self.interval).await;
            self.tick().await;
        }
    }

    async fn tick(&self) {
        let running_tasks = match self.records.running_task_ids().await {
            Ok(task_ids) => task_ids,
            Err(e) => {
                warn!("Cannot read running tasks for heartbeat: {e}");
                vec![]
            }
        };
        let killed_tasks = self.killed.drain();
        let stats = tokio::task::block_in_place(resources::gather_stats);
        let capability = self.capability.read().await.clone();
        let gpu_info = merge_vm_gpu_stats(resources::gpu_stats().await, &capability, &self.vms.list());

        let request = HeartbeatRequest {
            running_tasks,
            killed_tasks: killed_tasks.clone(),
            cpu_percent: stats.cpu_percent,
            memory_percent: stats.memory_percent,
            memory_used_bytes: stats.memory_used_bytes,
            memory_total_bytes: stats.memory_total_bytes,
            current_avg_temp: stats.current_avg_temp,
            current_max_temp: stats.current_max_temp,
            gpu_info,
            vm_capable: capability.vm_capable,
            vfio_gpus: (!capability.vfio_gpus.is_empty()).then_some(capability.vfio_gpus),
            runner_version: env!("CARGO_PKG_VERSION").to_string(),
        };

        match self.host.heartbeat(&self.identity.hostname, request).await {
            Ok(()) => debug!("Heartbeat acknowledged"),
            Err(HostClientError::Unregistered) => {
                warn!("Host does not know this node, re-registering");
                self.killed.requeue(killed_tasks);
                if let Err(e) = register_node(&self.host, &self.identity, &self.capability).await {
                    warn!("Re-registration failed: {e}");
                }
            }
            Err(e) => {
                warn!("Heartbeat failed: {e}");
                // Killed reports are best-effort but never silently lost.
                self.killed.requeue(killed_tasks);
            }
        }
    }
}

/// Fold VM-reported stats into the host-visible GPU list.
///
/// VFIO-bound GPUs are invisible to nvidia-smi, which renumbers the
/// survivors from zero. The VFIO list carries stable PCI-derived ids:
/// host-visible entries are remapped onto them, and bound GPUs come back
/// with the stats their VM reported plus a `vm_task_id` tag.
pub(crate) fn merge_vm_gpu_stats(
    mut gpu_info: Vec<GpuStats>,
    capability: &VmCapability,
    vms: &[crate::qemu::manager::VmInstance],
) -> Vec<GpuStats> {
    if capability.vfio_gpus.is_empty() {
        return gpu_info;
    }
    let stable_ids: HashMap<String, u32> =
        capability.vfio_gpus.iter().map(|gpu| (gpu.pci_address.to_lowercase(), gpu.gpu_id)).collect();

    let mut seen: HashSet<String> = HashSet::new();
    for gpu in &mut gpu_info {
        if let Some(pci) = &gpu.pci_bus_id {
            let pci = pci.to_lowercase();
            if let Some(stable) = stable_ids.get(&pci) {
                gpu.gpu_id = *stable;
            }
            seen.insert(pci);
        }
    }

    // VM stats indexed by the PCI addresses passed through to that VM.
    let mut vm_stats_by_pci: HashMap<String, (i64, GpuStats)> = HashMap::new();
    for vm in vms {
        let gpu_pcis: Vec<String> = vm
            .gpu_pci_addresses
            .iter()
            .map(|address| address.to_lowercase())
            .filter(|address| stable_ids.contains_key(address))
            .collect();
        for (index, stats) in vm.vm_gpu_info.iter().enumerate() {
            if let Some(pci) = gpu_pcis.get(index) {
                vm_stats_by_pci.insert(pci.clone(), (vm.task_id, stats.clone()));
            }
        }
    }

    for vfio_gpu in &capability.vfio_gpus {
        let pci = vfio_gpu.pci_address.to_lowercase();
        if seen.contains(&pci) {
            continue;
        }
        let mut entry = match vm_stats_by_pci.get(&pci) {
            Some((task_id, stats)) => {
                let mut entry = stats.clone();
                entry.vm_task_id = Some(*task_id);
                entry
            }
            // Bound but not inside a running VM yet.
            None => GpuStats::default(),
        };
        entry.gpu_id = vfio_gpu.gpu_id;
        if entry.name.is_empty() {
            entry.name = vfio_gpu.name.clone();
        }
        entry.pci_bus_id = Some(vfio_gpu.pci_address.clone());
        entry.vfio_bound = Some(true);
        gpu_info.push(entry);
    }
    gpu_info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qemu::manager::VmInstance;
    use kohakuriver_models::cluster::VfioGpu;

    fn vfio_gpu(gpu_id: u32, pci: &str) -> VfioGpu {
        VfioGpu {
            gpu_id,
            pci_address: pci.into(),
            name: "RTX 4090".into(),
            vendor_id: "10de".into(),
            device_id: "2684".into(),
            iommu_group: Some(10 + gpu_id),
            iommu_group_peers: vec![pci.into()],
        }
    }

    fn vm(task_id: i64, pci: &str, utilization: i32) -> VmInstance {
        VmInstance {
            task_id,
            pid: 100,
            vm_ip: "10.128.64.253".parse().unwrap(),
            tap_device: "tap-vm-1".into(),
            gpu_pci_addresses: vec![pci.into()],
            instance_dir: "/tmp".into(),
            qmp_socket: "/tmp/qmp.sock".into(),
            ssh_ready: true,
            last_heartbeat: None,
            vm_gpu_info: vec![GpuStats {
                gpu_id: 0,
                name: "RTX 4090".into(),
                gpu_utilization: Some(utilization),
                ..Default::default()
            }],
            vm_system_info: Default::default(),
        }
    }

    #[test]
    fn killed_queue_drains_and_requeues() {
        let queue = KilledTaskQueue::default();
        queue.push(1, "oom");
        queue.push(2, "manual");
        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(queue.drain().is_empty());
        queue.requeue(drained);
        assert_eq!(queue.drain().len(), 2);
    }

    #[test]
    fn no_vfio_gpus_passthrough() {
        let gpus = vec![GpuStats { gpu_id: 0, name: "RTX".into(), ..Default::default() }];
        let merged = merge_vm_gpu_stats(gpus.clone(), &VmCapability::default(), &[]);
        assert_eq!(merged, gpus);
    }

    #[test]
    fn bound_gpu_reported_with_vm_stats() {
        let capability = VmCapability {
            vm_capable: true,
            vfio_gpus: vec![vfio_gpu(0, "0000:01:00.0"), vfio_gpu(1, "0000:02:00.0")],
        };
        // GPU 0 is bound to a VM: nvidia-smi only sees GPU 1, renumbered
        // as index 0.
        let host_visible = vec![GpuStats {
            gpu_id: 0,
            name: "RTX 4090".into(),
            pci_bus_id: Some("0000:02:00.0".into()),
            ..Default::default()
        }];
        let vms = vec![vm(77, "0000:01:00.0", 93)];

        let merged = merge_vm_gpu_stats(host_visible, &capability, &vms);
        assert_eq!(merged.len(), 2);
        // Host-visible GPU remapped onto its stable id.
        assert_eq!(merged[0].gpu_id, 1);
        // Bound GPU carries the VM's stats and tags.
        let bound = &merged[1];
        assert_eq!(bound.gpu_id, 0);
        assert_eq!(bound.vm_task_id, Some(77));
        assert_eq!(bound.vfio_bound, Some(true));
        assert_eq!(bound.gpu_utilization, Some(93));
    }

    #[test]
    fn bound_gpu_without_vm_still_listed() {
        let capability = VmCapability { vm_capable: true, vfio_gpus: vec![vfio_gpu(0, "0000:01:00.0")] };
        let merged = merge_vm_gpu_stats(vec![], &capability, &[]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].vfio_bound, Some(true));
        assert_eq!(merged[0].vm_task_id, None);
        assert_eq!(merged[0].name, "RTX 4090");
    }
}
