//! Node introspection: CPU/memory stats, NUMA topology and GPU state.

use crate::commands::{CommandError, run_command};
use kohakuriver_models::cluster::{GpuStats, NumaNode};
use std::time::Duration;
use sysinfo::{Components, System};
use tracing::{debug, warn};

const NVIDIA_SMI_TIMEOUT: Duration = Duration::from_secs(10);

/// A snapshot of the node's load, shipped in heartbeats.
#[derive(Clone, Debug, Default)]
pub struct SystemStats {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub current_avg_temp: Option<f64>,
    pub current_max_temp: Option<f64>,
}

pub fn hostname() -> anyhow::Result<String> {
    System::host_name().ok_or_else(|| anyhow::anyhow!("cannot determine hostname"))
}

pub fn total_cores() -> u32 {
    System::new_all().cpus().len() as u32
}

pub fn total_memory_bytes() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.total_memory()
}

pub fn gather_stats() -> SystemStats {
    let mut sys = System::new_all();
    // Two samples are needed for a meaningful CPU percentage.
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu_usage();
    let cpu_percent = sys.global_cpu_usage() as f64;
    let memory_total_bytes = sys.total_memory();
    let memory_used_bytes = sys.used_memory();
    let memory_percent =
        if memory_total_bytes > 0 { memory_used_bytes as f64 / memory_total_bytes as f64 * 100.0 } else { 0.0 };

    let components = Components::new_with_refreshed_list();
    let temps: Vec<f64> = components.iter().filter_map(|c| c.temperature()).map(f64::from).collect();
    let current_avg_temp =
        if temps.is_empty() { None } else { Some(temps.iter().sum::<f64>() / temps.len() as f64) };
    let current_max_temp = temps.iter().copied().reduce(f64::max);

    SystemStats {
        cpu_percent,
        memory_percent,
        memory_used_bytes,
        memory_total_bytes,
        current_avg_temp,
        current_max_temp,
    }
}

/// Read the NUMA layout from sysfs. `None` when the machine has a single
/// node or no topology is exposed.
pub fn detect_numa_topology() -> Option<Vec<NumaNode>> {
    let entries = std::fs::read_dir("/sys/devices/system/node").ok()?;
    let mut nodes = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(id) = name.strip_prefix("node").and_then(|id| id.parse::<u32>().ok()) else {
            continue;
        };
        let cpulist = std::fs::read_to_string(entry.path().join("cpulist")).ok()?;
        let cores = parse_cpu_list(cpulist.trim());
        let meminfo = std::fs::read_to_string(entry.path().join("meminfo")).unwrap_or_default();
        let memory_bytes = parse_numa_memory(&meminfo).unwrap_or(0);
        nodes.push(NumaNode { node_id: id, cores, memory_bytes });
    }
    nodes.sort_by_key(|n| n.node_id);
    if nodes.len() > 1 { Some(nodes) } else { None }
}

/// Parse a kernel cpulist like "0-3,8-11" into core ids.
fn parse_cpu_list(list: &str) -> Vec<u32> {
    let mut cores = Vec::new();
    for part in list.split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                if let (Ok(start), Ok(end)) = (start.parse::<u32>(), end.parse::<u32>()) {
                    cores.extend(start..=end);
                }
            }
            None => {
                if let Ok(core) = part.parse() {
                    cores.push(core);
                }
            }
        }
    }
    cores
}

/// Pull "Node 0 MemTotal: 32768 kB" out of a NUMA meminfo blob.
fn parse_numa_memory(meminfo: &str) -> Option<u64> {
    for line in meminfo.lines() {
        if line.contains("MemTotal:") {
            let kb: u64 = line.split_whitespace().rev().nth(1)?.parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

/// The `numactl` prefix for a task pinned to a NUMA node, when the node
/// advertises a topology.
pub fn numa_prefix(target_node: Option<u32>, topology: Option<&[NumaNode]>) -> Option<String> {
    let node = target_node?;
    let topology = topology?;
    if !topology.iter().any(|n| n.node_id == node) {
        warn!("NUMA node {node} not present in topology, skipping binding");
        return None;
    }
    Some(format!("numactl --cpunodebind={node} --membind={node}"))
}

/// Query visible GPUs via `nvidia-smi`. Empty when the tool is missing
/// or the node has no NVIDIA GPUs.
pub async fn gpu_stats() -> Vec<GpuStats> {
    let args = [
        "--query-gpu=index,name,pci.bus_id,driver_version,utilization.gpu,utilization.memory,memory.total,memory.used,temperature.gpu",
        "--format=csv,noheader,nounits",
    ];
    match run_command("nvidia-smi", &args, NVIDIA_SMI_TIMEOUT).await {
        Ok(output) => parse_nvidia_smi(&output.stdout),
        Err(CommandError::Spawn { .. }) => {
            debug!("nvidia-smi not available, reporting no GPUs");
            vec![]
        }
        Err(e) => {
            warn!("nvidia-smi failed: {e}");
            vec![]
        }
    }
}

/// The host driver version, needed to install a matching driver inside
/// GPU VMs. Must be read before VFIO binding makes the GPU invisible.
pub async fn nvidia_driver_version() -> Option<String> {
    let args = ["--query-gpu=driver_version", "--format=csv,noheader"];
    let output = run_command("nvidia-smi", &args, NVIDIA_SMI_TIMEOUT).await.ok()?;
    output.stdout.lines().next().map(|line| line.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_nvidia_smi(output: &str) -> Vec<GpuStats> {
    let mut gpus = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 9 {
            warn!("Unparseable nvidia-smi line: {line}");
            continue;
        }
        let Ok(gpu_id) = fields[0].parse() else {
            continue;
        };
        gpus.push(GpuStats {
            gpu_id,
            name: fields[1].to_string(),
            pci_bus_id: Some(fields[2].to_string()),
            driver_version: Some(fields[3].to_string()),
            gpu_utilization: fields[4].parse().ok(),
            mem_utilization: fields[5].parse().ok(),
            memory_total_mib: fields[6].parse().ok(),
            memory_used_mib: fields[7].parse().ok(),
            temperature: fields[8].parse().ok(),
            vm_task_id: None,
            vfio_bound: None,
        });
    }
    gpus
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::range("0-3", vec![0, 1, 2, 3])]
    #[case::mixed("0-1,8,10-11", vec![0, 1, 8, 10, 11])]
    #[case::single("5", vec![5])]
    #[case::empty("", vec![])]
    fn cpu_list_parsing(#[case] input: &str, #[case] expected: Vec<u32>) {
        assert_eq!(parse_cpu_list(input), expected);
    }

    #[test]
    fn numa_memory_parsing() {
        let meminfo = "Node 0 MemTotal:       32768 kB\nNode 0 MemFree:        1024 kB\n";
        assert_eq!(parse_numa_memory(meminfo), Some(32768 * 1024));
    }

    #[test]
    fn numa_prefix_requires_topology() {
        let topology = vec![NumaNode { node_id: 0, cores: vec![0, 1], memory_bytes: 1024 }];
        assert_eq!(
            numa_prefix(Some(0), Some(&topology)),
            Some("numactl --cpunodebind=0 --membind=0".to_string())
        );
        assert_eq!(numa_prefix(Some(3), Some(&topology)), None);
        assert_eq!(numa_prefix(None, Some(&topology)), None);
        assert_eq!(numa_prefix(Some(0), None), None);
    }

    #[test]
    fn nvidia_smi_parsing() {
        let output = "0, NVIDIA GeForce RTX 4090, 00000000:01:00.0, 550.54.14, 35, 12, 24564, 1024, 45\n\
                      1, NVIDIA GeForce RTX 4090, 00000000:02:00.0, 550.54.14, 0, 0, 24564, 2, 32\n";
        let gpus = parse_nvidia_smi(output);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].gpu_id, 0);
        assert_eq!(gpus[0].name, "NVIDIA GeForce RTX 4090");
        assert_eq!(gpus[0].pci_bus_id.as_deref(), Some("00000000:01:00.0"));
        assert_eq!(gpus[0].gpu_utilization, Some(35));
        assert_eq!(gpus[1].temperature, Some(32));
    }

    #[test]
    fn nvidia_smi_garbage_skipped() {
        assert!(parse_nvidia_smi("not, csv\n").is_empty());
    }
}
