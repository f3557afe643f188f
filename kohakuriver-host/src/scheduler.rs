//! Placement of tasks onto nodes.
//!
//! Pure selection logic over snapshots of node capacity and current
//! usage. Candidates are filtered (online, capacity, GPU availability,
//! VM capability) and ties are broken by most free cores, then most free
//! memory, then lexicographic hostname.

use crate::repositories::{node::NodeModel, task::TaskModel};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    #[error("no online nodes in the cluster")]
    NoNodesOnline,

    #[error("no node satisfies the request: {0}")]
    NoCandidate(String),
}

/// What a submission needs from a node.
#[derive(Clone, Debug, Default)]
pub struct ResourceRequest {
    pub cores: u32,
    pub memory_bytes: Option<u64>,
    /// Explicit GPU ids, interpreted in the target node's id space.
    pub gpu_ids: Vec<u32>,
    pub hostname: Option<String>,
    pub numa_node_id: Option<u32>,
    /// VM workloads need `vm_capable` nodes and isolated IOMMU groups.
    pub needs_vm: bool,
}

/// Resources already committed to active tasks on one node.
#[derive(Clone, Debug, Default)]
pub struct NodeUsage {
    pub cores: u32,
    pub memory_bytes: u64,
    pub gpu_ids: HashSet<u32>,
}

impl NodeUsage {
    /// Tally usage from the active tasks assigned to a node.
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a TaskModel>) -> Self {
        let mut usage = Self::default();
        for task in tasks {
            usage.cores += task.required_cores;
            usage.memory_bytes += task.required_memory_bytes.unwrap_or(0);
            usage.gpu_ids.extend(task.required_gpus.iter().flatten().copied());
        }
        usage
    }
}

fn free_cores(node: &NodeModel, usage: &NodeUsage) -> u32 {
    node.total_cores.saturating_sub(usage.cores)
}

fn free_memory(node: &NodeModel, usage: &NodeUsage) -> u64 {
    node.total_ram_bytes.saturating_sub(usage.memory_bytes)
}

fn reject(node: &NodeModel, request: &ResourceRequest, usage: &NodeUsage) -> Option<String> {
    if let Some(hostname) = &request.hostname {
        if &node.hostname != hostname {
            return Some(format!("not target node {hostname}"));
        }
    }
    if free_cores(node, usage) < request.cores {
        return Some(format!("{} free cores, need {}", free_cores(node, usage), request.cores));
    }
    if let Some(memory) = request.memory_bytes {
        if free_memory(node, usage) < memory {
            return Some(format!("{} free memory bytes, need {memory}", free_memory(node, usage)));
        }
    }
    if let Some(numa) = request.numa_node_id {
        let known = node.numa_topology.as_ref().is_some_and(|topo| topo.iter().any(|n| n.node_id == numa));
        if !known {
            return Some(format!("no NUMA node {numa}"));
        }
    }
    if !request.gpu_ids.is_empty() {
        let advertised: HashSet<u32> = node.gpu_info.iter().map(|g| g.gpu_id).collect();
        for gpu in &request.gpu_ids {
            if !advertised.contains(gpu) {
                return Some(format!("no GPU {gpu}"));
            }
            if usage.gpu_ids.contains(gpu) {
                return Some(format!("GPU {gpu} in use"));
            }
        }
    }
    if request.needs_vm {
        if !node.vm_capable {
            return Some("not VM capable".into());
        }
        if !request.gpu_ids.is_empty() {
            // Every requested GPU must be passthrough eligible, and no two
            // may share an IOMMU group (VFIO binds whole groups).
            let vfio: HashMap<u32, Option<u32>> = node
                .vfio_gpus
                .iter()
                .flatten()
                .map(|g| (g.gpu_id, g.iommu_group))
                .collect();
            let mut groups = HashSet::new();
            for gpu in &request.gpu_ids {
                let Some(group) = vfio.get(gpu) else {
                    return Some(format!("GPU {gpu} not passthrough eligible"));
                };
                if let Some(group) = group {
                    if !groups.insert(*group) {
                        return Some(format!("GPU {gpu} shares IOMMU group {group} with another requested GPU"));
                    }
                }
            }
        }
    }
    None
}

/// Pick the node a request lands on.
///
/// `usage` maps hostname to the resources its active tasks hold; nodes
/// without an entry are treated as idle.
pub fn pick_node<'a>(
    nodes: &'a [NodeModel],
    usage: &HashMap<String, NodeUsage>,
    request: &ResourceRequest,
) -> Result<&'a NodeModel, ScheduleError> {
    if nodes.is_empty() {
        return Err(ScheduleError::NoNodesOnline);
    }
    let empty = NodeUsage::default();
    let mut candidates = Vec::new();
    let mut rejections = Vec::new();
    for node in nodes {
        let node_usage = usage.get(&node.hostname).unwrap_or(&empty);
        match reject(node, request, node_usage) {
            Some(reason) => rejections.push(format!("{}: {reason}", node.hostname)),
            None => candidates.push((node, node_usage)),
        }
    }
    candidates
        .into_iter()
        .max_by(|(a, a_usage), (b, b_usage)| {
            free_cores(a, a_usage)
                .cmp(&free_cores(b, b_usage))
                .then(free_memory(a, a_usage).cmp(&free_memory(b, b_usage)))
                // max_by keeps the later of equal elements, so reverse the
                // name ordering to prefer the lexicographically smallest.
                .then(b.hostname.cmp(&a.hostname))
        })
        .map(|(node, _)| node)
        .ok_or_else(|| ScheduleError::NoCandidate(rejections.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::node::NodeStatus;
    use chrono::Utc;
    use kohakuriver_models::cluster::{GpuStats, NumaNode, VfioGpu};
    use rstest::rstest;

    fn make_node(hostname: &str, cores: u32, ram: u64) -> NodeModel {
        NodeModel {
            hostname: hostname.into(),
            url: format!("http://{hostname}:8001"),
            status: NodeStatus::Online,
            total_cores: cores,
            total_ram_bytes: ram,
            numa_topology: None,
            gpu_info: vec![],
            vm_capable: false,
            vfio_gpus: None,
            runner_version: None,
            last_heartbeat: Some(Utc::now()),
            registered_at: Utc::now(),
        }
    }

    fn gpu(gpu_id: u32) -> GpuStats {
        GpuStats { gpu_id, name: "RTX 4090".into(), ..Default::default() }
    }

    fn vfio_gpu(gpu_id: u32, iommu_group: u32) -> VfioGpu {
        VfioGpu {
            gpu_id,
            pci_address: format!("0000:0{gpu_id}:00.0"),
            name: "RTX 4090".into(),
            vendor_id: "10de".into(),
            device_id: "2684".into(),
            iommu_group: Some(iommu_group),
            iommu_group_peers: vec![],
        }
    }

    fn request(cores: u32) -> ResourceRequest {
        ResourceRequest { cores, ..Default::default() }
    }

    #[test]
    fn empty_cluster_is_exhausted() {
        let err = pick_node(&[], &Default::default(), &request(1)).expect_err("picked a node");
        assert_eq!(err, ScheduleError::NoNodesOnline);
    }

    #[test]
    fn prefers_most_free_cores() {
        let nodes = vec![make_node("node1", 8, 1024), make_node("node2", 16, 1024)];
        let picked = pick_node(&nodes, &Default::default(), &request(2)).expect("no node picked");
        assert_eq!(picked.hostname, "node2");
    }

    #[test]
    fn usage_counts_against_free_cores() {
        let nodes = vec![make_node("node1", 8, 1024), make_node("node2", 16, 1024)];
        let usage = HashMap::from([("node2".to_string(), NodeUsage { cores: 12, ..Default::default() })]);
        let picked = pick_node(&nodes, &usage, &request(2)).expect("no node picked");
        assert_eq!(picked.hostname, "node1");
    }

    #[test]
    fn memory_breaks_core_ties() {
        let nodes = vec![make_node("node1", 8, 1024), make_node("node2", 8, 4096)];
        let picked = pick_node(&nodes, &Default::default(), &request(2)).expect("no node picked");
        assert_eq!(picked.hostname, "node2");
    }

    #[test]
    fn hostname_breaks_full_ties() {
        let nodes = vec![make_node("nodeb", 8, 1024), make_node("nodea", 8, 1024)];
        let picked = pick_node(&nodes, &Default::default(), &request(2)).expect("no node picked");
        assert_eq!(picked.hostname, "nodea");
    }

    #[test]
    fn pinned_hostname_is_honored() {
        let nodes = vec![make_node("node1", 8, 1024), make_node("node2", 16, 1024)];
        let req = ResourceRequest { hostname: Some("node1".into()), ..request(2) };
        let picked = pick_node(&nodes, &Default::default(), &req).expect("no node picked");
        assert_eq!(picked.hostname, "node1");
    }

    #[test]
    fn insufficient_capacity_everywhere() {
        let nodes = vec![make_node("node1", 2, 1024)];
        let err = pick_node(&nodes, &Default::default(), &request(4)).expect_err("picked a node");
        assert!(matches!(err, ScheduleError::NoCandidate(_)));
    }

    #[test]
    fn gpu_in_use_excludes_node() {
        let mut node = make_node("node1", 8, 1024);
        node.gpu_info = vec![gpu(0), gpu(1)];
        let usage = HashMap::from([(
            "node1".to_string(),
            NodeUsage { gpu_ids: HashSet::from([0]), ..Default::default() },
        )]);

        let req = ResourceRequest { gpu_ids: vec![0], ..request(1) };
        pick_node(std::slice::from_ref(&node), &usage, &req).expect_err("picked a node with busy GPU");

        let req = ResourceRequest { gpu_ids: vec![1], ..request(1) };
        pick_node(std::slice::from_ref(&node), &usage, &req).expect("free GPU not schedulable");
    }

    #[test]
    fn numa_pin_requires_topology() {
        let mut node = make_node("node1", 8, 1024);
        let req = ResourceRequest { numa_node_id: Some(0), ..request(1) };
        pick_node(std::slice::from_ref(&node), &Default::default(), &req).expect_err("picked node without topology");

        node.numa_topology = Some(vec![NumaNode { node_id: 0, cores: (0..8).collect(), memory_bytes: 1024 }]);
        pick_node(std::slice::from_ref(&node), &Default::default(), &req).expect("no node picked");
    }

    #[rstest]
    #[case::distinct_groups(vec![vfio_gpu(0, 10), vfio_gpu(1, 11)], true)]
    #[case::shared_group(vec![vfio_gpu(0, 10), vfio_gpu(1, 10)], false)]
    fn vm_gpu_iommu_isolation(#[case] vfio_gpus: Vec<VfioGpu>, #[case] schedulable: bool) {
        let mut node = make_node("node1", 8, 1024);
        node.vm_capable = true;
        node.gpu_info = vec![gpu(0), gpu(1)];
        node.vfio_gpus = Some(vfio_gpus);
        let req = ResourceRequest { gpu_ids: vec![0, 1], needs_vm: true, ..request(1) };
        let result = pick_node(std::slice::from_ref(&node), &Default::default(), &req);
        assert_eq!(result.is_ok(), schedulable, "{result:?}");
    }

    #[test]
    fn vm_requires_capable_node() {
        let node = make_node("node1", 8, 1024);
        let req = ResourceRequest { needs_vm: true, ..request(1) };
        pick_node(std::slice::from_ref(&node), &Default::default(), &req).expect_err("picked non-VM node");
    }
}
