//! VFIO driver binding for GPU passthrough.
//!
//! VFIO requires every non-bridge endpoint in an IOMMU group to be bound
//! to `vfio-pci` together. Sysfs writes are bounded by a 5 s timeout:
//! consumer NVIDIA cards can hang on the unbind write even after the
//! device has actually been released, in which case the hung writer is
//! left to finish in the background and the result is judged by where
//! `driver_override` landed.

use crate::commands::run_command;
use crate::qemu::capability;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const SYSFS_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum VfioError {
    #[error("failed to write '{value}' to {path}: {error}")]
    SysfsWrite { path: String, value: String, error: String },

    #[error("unbind timed out and {0} is still bound to {1}")]
    UnbindHung(String, String),

    #[error("expected vfio-pci on {0} but found '{1}'")]
    BindFailed(String, String),
}

/// Write to a sysfs file from a detached blocking thread, bounded by the
/// timeout. Returns whether the write finished in time; the thread keeps
/// running either way.
async fn write_sysfs_timeout(path: String, value: String) -> Result<bool, VfioError> {
    let (sender, receiver) = tokio::sync::oneshot::channel();
    let thread_path = path.clone();
    let thread_value = value.clone();
    std::thread::spawn(move || {
        let result = std::fs::write(&thread_path, &thread_value);
        let _ = sender.send(result);
    });
    match tokio::time::timeout(SYSFS_WRITE_TIMEOUT, receiver).await {
        Ok(Ok(Ok(()))) => Ok(true),
        Ok(Ok(Err(e))) => Err(VfioError::SysfsWrite { path, value, error: e.to_string() }),
        // Channel dropped without a value; treat like a timeout.
        Ok(Err(_)) | Err(_) => Ok(false),
    }
}

/// The driver currently bound to a PCI device, from the sysfs symlink.
pub fn current_driver(pci_address: &str) -> Option<String> {
    let link = format!("/sys/bus/pci/devices/{pci_address}/driver");
    std::fs::read_link(link).ok().and_then(|target| target.file_name().map(|n| n.to_string_lossy().to_string()))
}

pub fn is_bound_to_vfio(pci_address: &str) -> bool {
    current_driver(pci_address).as_deref() == Some("vfio-pci")
}

fn is_nvidia(pci_address: &str) -> bool {
    let vendor = format!("/sys/bus/pci/devices/{pci_address}/vendor");
    std::fs::read_to_string(vendor).map(|v| v.trim() == "0x10de").unwrap_or(false)
}

/// nvidia-persistenced holds /dev/nvidia* file descriptors open, which
/// blocks the sysfs unbind write indefinitely. Stop it around binding.
async fn stop_nvidia_persistenced() {
    let active = run_command("systemctl", &["is-active", "--quiet", "nvidia-persistenced"], SYSTEMCTL_TIMEOUT).await;
    if active.is_err() {
        return;
    }
    info!("Stopping nvidia-persistenced to release GPU fds");
    if let Err(e) = run_command("systemctl", &["stop", "nvidia-persistenced"], SYSTEMCTL_TIMEOUT).await {
        warn!("Failed to stop nvidia-persistenced: {e}");
    }
}

async fn start_nvidia_persistenced() {
    if let Err(e) = run_command("systemctl", &["start", "nvidia-persistenced"], SYSTEMCTL_TIMEOUT).await {
        warn!("Failed to restart nvidia-persistenced: {e}");
    } else {
        info!("Restarted nvidia-persistenced");
    }
}

/// Unbind a device from its current driver and bind it to vfio-pci.
pub async fn bind_to_vfio(pci_address: &str) -> Result<(), VfioError> {
    if let Some(current) = current_driver(pci_address) {
        if current == "vfio-pci" {
            info!("{pci_address} already bound to vfio-pci");
            return Ok(());
        }
        if current == "nvidia" {
            stop_nvidia_persistenced().await;
        }
        info!("Unbinding {pci_address} from {current}");
        let unbind = format!("/sys/bus/pci/devices/{pci_address}/driver/unbind");
        let completed = write_sysfs_timeout(unbind, pci_address.into()).await?;
        if !completed {
            match current_driver(pci_address) {
                None => info!("Unbind write timed out but {pci_address} is now unbound, continuing"),
                Some(actual) => return Err(VfioError::UnbindHung(pci_address.into(), actual)),
            }
        }
    }

    let override_path = format!("/sys/bus/pci/devices/{pci_address}/driver_override");
    if !write_sysfs_timeout(override_path, "vfio-pci".into()).await? {
        warn!("driver_override write timed out for {pci_address}");
    }

    // drivers_probe first; newer kernels may not honour it after a
    // driver_override, so fall back to an explicit bind.
    let _ = write_sysfs_timeout("/sys/bus/pci/drivers_probe".into(), pci_address.into()).await;
    if !is_bound_to_vfio(pci_address) {
        info!("drivers_probe did not bind {pci_address}, trying explicit vfio-pci/bind");
        let _ = write_sysfs_timeout("/sys/bus/pci/drivers/vfio-pci/bind".into(), pci_address.into()).await;
    }

    match current_driver(pci_address) {
        Some(driver) if driver == "vfio-pci" => {
            info!("Bound {pci_address} to vfio-pci");
            Ok(())
        }
        driver => Err(VfioError::BindFailed(pci_address.into(), driver.unwrap_or_default())),
    }
}

/// Unbind a device from vfio-pci and let the kernel restore its original
/// driver. NVIDIA devices get an explicit `nvidia/bind` fallback.
pub async fn unbind_from_vfio(pci_address: &str) -> Result<(), VfioError> {
    match current_driver(pci_address) {
        Some(current) if current == "vfio-pci" => {}
        current => {
            info!("{pci_address} not bound to vfio-pci (current: {current:?})");
            return Ok(());
        }
    }
    let nvidia = is_nvidia(pci_address);
    if nvidia {
        stop_nvidia_persistenced().await;
    }

    info!("Unbinding {pci_address} from vfio-pci");
    let unbind = format!("/sys/bus/pci/devices/{pci_address}/driver/unbind");
    let completed = write_sysfs_timeout(unbind, pci_address.into()).await?;
    if !completed && is_bound_to_vfio(pci_address) {
        return Err(VfioError::UnbindHung(pci_address.into(), "vfio-pci".into()));
    }

    // Clear the override; some devices reject this, which is fine.
    let override_path = format!("/sys/bus/pci/devices/{pci_address}/driver_override");
    let _ = write_sysfs_timeout(override_path, "\n".into()).await;
    let _ = write_sysfs_timeout("/sys/bus/pci/drivers_probe".into(), pci_address.into()).await;

    let mut driver = current_driver(pci_address);
    if nvidia && driver.as_deref() != Some("nvidia") {
        info!("drivers_probe did not restore nvidia for {pci_address} (driver: {driver:?}), trying nvidia/bind");
        let _ = write_sysfs_timeout("/sys/bus/pci/drivers/nvidia/bind".into(), pci_address.into()).await;
        driver = current_driver(pci_address);
    }
    info!("{pci_address} rebound to {}", driver.unwrap_or_else(|| "none".into()));
    Ok(())
}

/// All non-bridge devices sharing the IOMMU group of a device, the
/// device itself included. Bridges are kernel-managed and stay out.
pub fn iommu_group_non_bridge_devices(pci_address: &str) -> Vec<String> {
    let Some(group) = capability::iommu_group(pci_address) else {
        return vec![pci_address.to_string()];
    };
    let devices = capability::iommu_group_devices(group);
    if devices.is_empty() {
        return vec![pci_address.to_string()];
    }
    devices.into_iter().filter(|device| !capability::is_pci_bridge(device)).collect()
}

/// Bind a whole IOMMU group to vfio-pci. Returns the bound addresses.
pub async fn bind_iommu_group(pci_address: &str) -> Result<Vec<String>, VfioError> {
    let devices = iommu_group_non_bridge_devices(pci_address);
    let mut bound = Vec::new();
    let result: Result<(), VfioError> = async {
        for device in &devices {
            bind_to_vfio(device).await?;
            bound.push(device.clone());
        }
        Ok(())
    }
    .await;
    if !bound.is_empty() {
        // Remaining GPUs keep persistence mode.
        start_nvidia_persistenced().await;
    }
    result?;
    info!("Bound IOMMU group for {pci_address}: {bound:?}");
    Ok(bound)
}

/// Unbind a whole IOMMU group from vfio-pci. Best effort per device.
pub async fn unbind_iommu_group(pci_address: &str) -> Vec<String> {
    let devices = iommu_group_non_bridge_devices(pci_address);
    let mut unbound = Vec::new();
    for device in &devices {
        match unbind_from_vfio(device).await {
            Ok(()) => unbound.push(device.clone()),
            Err(e) => warn!("Failed to unbind {device} from vfio-pci: {e}"),
        }
    }
    if !unbound.is_empty() {
        start_nvidia_persistenced().await;
    }
    info!("Unbound IOMMU group for {pci_address}: {unbound:?}");
    unbound
}
