//! Canonical names for containers, VMs, images and devices.
//!
//! Both sides of the cluster derive names from task ids, so the scheme
//! lives in the shared crate.

/// Docker container name for a batch task.
pub fn task_container_name(task_id: i64) -> String {
    format!("kohakuriver-task-{task_id}")
}

/// Docker container name for a Docker-backed VPS.
pub fn vps_container_name(task_id: i64) -> String {
    format!("kohakuriver-vps-{task_id}")
}

/// QEMU VM name for a VM-backed VPS.
pub fn vm_name(task_id: i64) -> String {
    format!("vm-{task_id}")
}

/// The image tag a container tarball is loaded under.
pub fn image_tag(container_name: &str) -> String {
    format!("kohakuriver/{container_name}:base")
}

/// The Docker network containers join for overlay connectivity.
pub const OVERLAY_DOCKER_NETWORK: &str = "kohakuriver-overlay";

/// The Linux bridge backing the overlay Docker network on a runner.
pub const OVERLAY_BRIDGE: &str = "kohaku-overlay";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert_eq!(task_container_name(42), "kohakuriver-task-42");
        assert_eq!(vps_container_name(42), "kohakuriver-vps-42");
        assert_eq!(vm_name(42), "vm-42");
        assert_eq!(image_tag("envA"), "kohakuriver/envA:base");
    }
}
