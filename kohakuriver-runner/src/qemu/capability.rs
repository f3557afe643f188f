//! VM capability detection: KVM availability, IOMMU groups and the set
//! of passthrough-eligible GPUs.

use crate::commands::{CommandError, run_command};
use kohakuriver_models::cluster::VfioGpu;
use std::{path::Path, time::Duration};
use tracing::{debug, warn};

const LSPCI_TIMEOUT: Duration = Duration::from_secs(10);
const NVIDIA_VENDOR_ID: &str = "10de";

/// What this node can do VM-wise; gathered once at startup and refreshed
/// lazily for heartbeats.
#[derive(Clone, Debug, Default)]
pub struct VmCapability {
    pub vm_capable: bool,
    pub vfio_gpus: Vec<VfioGpu>,
}

/// A node is VM capable when KVM is usable and the QEMU binary exists.
pub async fn detect() -> VmCapability {
    let kvm = Path::new("/dev/kvm").exists();
    let qemu = run_command("qemu-system-x86_64", &["--version"], LSPCI_TIMEOUT).await.is_ok();
    if !kvm || !qemu {
        debug!("VM support unavailable (kvm={kvm}, qemu={qemu})");
        return VmCapability::default();
    }
    let vfio_gpus = match detect_vfio_gpus().await {
        Ok(gpus) => gpus,
        Err(e) => {
            warn!("VFIO GPU detection failed: {e}");
            vec![]
        }
    };
    VmCapability { vm_capable: true, vfio_gpus }
}

/// Enumerate NVIDIA GPUs with their IOMMU groups; passthrough eligibility
/// requires the group to be known.
async fn detect_vfio_gpus() -> Result<Vec<VfioGpu>, CommandError> {
    let output = run_command("lspci", &["-D", "-nn", "-d", &format!("{NVIDIA_VENDOR_ID}:")], LSPCI_TIMEOUT).await?;
    let mut gpus = parse_lspci_gpus(&output.stdout);
    for gpu in &mut gpus {
        gpu.iommu_group = iommu_group(&gpu.pci_address);
        gpu.iommu_group_peers = gpu
            .iommu_group
            .map(iommu_group_devices)
            .unwrap_or_default()
            .into_iter()
            .filter(|device| !is_pci_bridge(device))
            .collect();
    }
    Ok(gpus)
}

/// Parse `lspci -D -nn -d 10de:` output. VGA/3D controllers become GPUs;
/// audio companions and other functions are skipped here but travel as
/// IOMMU group peers.
fn parse_lspci_gpus(output: &str) -> Vec<VfioGpu> {
    let mut gpus = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let Some((address, rest)) = line.split_once(' ') else {
            continue;
        };
        let is_gpu = rest.starts_with("VGA compatible controller") || rest.starts_with("3D controller");
        if !is_gpu {
            continue;
        }
        // Device ids come from the trailing "[10de:2684]" tag, possibly
        // followed by a revision note.
        let ids = rest.rsplit_once('[').and_then(|(_, tail)| tail.split_once(']')).map(|(ids, _)| ids);
        let (vendor_id, device_id) = match ids.and_then(|ids| ids.split_once(':')) {
            Some((vendor, device)) => (vendor.to_string(), device.to_string()),
            None => (NVIDIA_VENDOR_ID.to_string(), String::new()),
        };
        let name = rest
            .split_once(": ")
            .map(|(_, name)| name.rsplit_once(" [").map(|(name, _)| name).unwrap_or(name))
            .unwrap_or(rest)
            .to_string();
        gpus.push(VfioGpu {
            gpu_id: gpus.len() as u32,
            pci_address: address.to_string(),
            name,
            vendor_id,
            device_id,
            iommu_group: None,
            iommu_group_peers: vec![],
        });
    }
    gpus
}

/// The IOMMU group of a device, from its sysfs symlink.
pub fn iommu_group(pci_address: &str) -> Option<u32> {
    let link = format!("/sys/bus/pci/devices/{pci_address}/iommu_group");
    let target = std::fs::read_link(link).ok()?;
    target.file_name()?.to_string_lossy().parse().ok()
}

/// All devices in an IOMMU group.
pub fn iommu_group_devices(group: u32) -> Vec<String> {
    let dir = format!("/sys/kernel/iommu_groups/{group}/devices");
    let Ok(entries) = std::fs::read_dir(dir) else {
        return vec![];
    };
    let mut devices: Vec<String> =
        entries.flatten().map(|entry| entry.file_name().to_string_lossy().to_string()).collect();
    devices.sort();
    devices
}

/// PCI bridges (class 0x06xx) are kernel-managed and never bound to
/// vfio-pci.
pub fn is_pci_bridge(pci_address: &str) -> bool {
    let class = format!("/sys/bus/pci/devices/{pci_address}/class");
    match std::fs::read_to_string(class) {
        Ok(value) => value.trim().starts_with("0x06"),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_gpus_from_lspci() {
        let output = "\
0000:01:00.0 VGA compatible controller [0300]: NVIDIA Corporation AD102 [GeForce RTX 4090] [10de:2684] (rev a1)
0000:01:00.1 Audio device [0403]: NVIDIA Corporation AD102 High Definition Audio Controller [10de:22ba] (rev a1)
0000:02:00.0 3D controller [0302]: NVIDIA Corporation GH100 [H100 PCIe] [10de:2331] (rev a1)
";
        let gpus = parse_lspci_gpus(output);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].pci_address, "0000:01:00.0");
        assert_eq!(gpus[0].vendor_id, "10de");
        assert_eq!(gpus[0].device_id, "2684");
        assert_eq!(gpus[0].gpu_id, 0);
        assert_eq!(gpus[1].pci_address, "0000:02:00.0");
        assert_eq!(gpus[1].device_id, "2331");
        assert_eq!(gpus[1].gpu_id, 1);
    }

    #[test]
    fn audio_functions_are_not_gpus() {
        let output = "0000:01:00.1 Audio device [0403]: NVIDIA Corporation AD102 HDA [10de:22ba] (rev a1)\n";
        assert!(parse_lspci_gpus(output).is_empty());
    }

    #[test]
    fn empty_output_is_empty() {
        assert!(parse_lspci_gpus("").is_empty());
    }
}
