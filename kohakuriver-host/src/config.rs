use crate::overlay::subnet::OverlaySubnetConfig;
use serde::Deserialize;
use std::{net::Ipv4Addr, net::SocketAddr, path::PathBuf, time::Duration};

#[derive(Deserialize, Debug)]
pub struct HostConfig {
    /// The endpoint the API server binds to.
    pub bind_endpoint: SocketAddr,

    /// The physical IP runners can reach this host at. VXLAN tunnels
    /// terminate here.
    pub reachable_address: Ipv4Addr,

    /// Root of the cluster-wide shared filesystem.
    pub shared_dir: PathBuf,

    /// The database configuration.
    pub db: DbConfig,

    /// Heartbeat / reconciliation configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Overlay network configuration.
    #[serde(default)]
    pub overlay: OverlayConfig,

    /// VPS configuration.
    #[serde(default)]
    pub vps: VpsConfig,
}

#[derive(Deserialize, Debug)]
pub struct DbConfig {
    /// The database URL, e.g. "sqlite:///var/lib/kohakuriver/host.db".
    pub url: String,
}

#[derive(Deserialize, Debug)]
pub struct HeartbeatConfig {
    /// Expected interval between runner heartbeats.
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub interval: Duration,

    /// A node is offline, and a missing task is lost, after this many
    /// silent intervals.
    #[serde(default = "default_missed_intervals")]
    pub missed_intervals: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval: default_heartbeat_interval(), missed_intervals: default_missed_intervals() }
    }
}

#[derive(Deserialize, Debug)]
pub struct OverlayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Subnet layout in "BASE/TOTAL_PREFIX/NODE_BITS/SUBNET_BITS" form.
    /// Rejected at parse time when the bits are inconsistent.
    #[serde(default = "OverlaySubnetConfig::default_config")]
    pub subnet: OverlaySubnetConfig,

    /// VNI for a runner is `base_vxlan_id + runner_id`.
    #[serde(default = "default_base_vxlan_id")]
    pub base_vxlan_id: u32,

    #[serde(default = "default_vxlan_port")]
    pub vxlan_port: u16,

    #[serde(default = "default_mtu")]
    pub mtu: u32,

    /// Secret for signing IP reservation tokens. Generated at startup
    /// when absent (reservations then do not survive a host restart).
    #[serde(default)]
    pub reservation_secret: Option<String>,

    /// Default reservation TTL.
    #[serde(with = "humantime_serde", default = "default_reservation_ttl")]
    pub reservation_ttl: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            subnet: OverlaySubnetConfig::default_config(),
            base_vxlan_id: default_base_vxlan_id(),
            vxlan_port: default_vxlan_port(),
            mtu: default_mtu(),
            reservation_secret: None,
            reservation_ttl: default_reservation_ttl(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct VpsConfig {
    /// SSH ports are allocated from here upwards.
    #[serde(default = "default_ssh_port_start")]
    pub ssh_port_start: u16,

    /// How long a VM VPS may stay in `assigning` before the watchdog
    /// fails it, when no GPU driver install is involved.
    #[serde(with = "humantime_serde", default = "default_vm_watchdog")]
    pub vm_watchdog: Duration,

    /// Watchdog for VMs that install a GPU driver during cloud-init.
    #[serde(with = "humantime_serde", default = "default_vm_gpu_watchdog")]
    pub vm_gpu_watchdog: Duration,
}

impl Default for VpsConfig {
    fn default() -> Self {
        Self {
            ssh_port_start: default_ssh_port_start(),
            vm_watchdog: default_vm_watchdog(),
            vm_gpu_watchdog: default_vm_gpu_watchdog(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_missed_intervals() -> u32 {
    3
}

fn default_base_vxlan_id() -> u32 {
    100
}

fn default_vxlan_port() -> u16 {
    4789
}

fn default_mtu() -> u32 {
    1450
}

fn default_reservation_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_ssh_port_start() -> u16 {
    2222
}

fn default_vm_watchdog() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_vm_gpu_watchdog() -> Duration {
    Duration::from_secs(15 * 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config() {
        let yaml = r#"
bind_endpoint: 0.0.0.0:8000
reachable_address: 192.168.1.10
shared_dir: /mnt/cluster
db:
  url: "sqlite://:memory:"
"#;
        let config: HostConfig = serde_yaml::from_str(yaml).expect("failed to parse");
        assert_eq!(config.heartbeat.interval, Duration::from_secs(5));
        assert_eq!(config.overlay.base_vxlan_id, 100);
        assert_eq!(config.vps.ssh_port_start, 2222);
    }

    #[test]
    fn bad_overlay_subnet_rejected() {
        let yaml = r#"
bind_endpoint: 0.0.0.0:8000
reachable_address: 192.168.1.10
shared_dir: /mnt/cluster
db:
  url: "sqlite://:memory:"
overlay:
  subnet: "10.0.0.0/20/8/4"
"#;
        serde_yaml::from_str::<HostConfig>(yaml).expect_err("parsing did not fail");
    }
}
