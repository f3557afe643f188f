use serde::Deserialize;
use std::{net::SocketAddr, path::PathBuf, time::Duration};

#[derive(Deserialize, Debug, Clone)]
pub struct RunnerConfig {
    /// The endpoint the runner API binds to.
    pub bind_endpoint: SocketAddr,

    /// Address advertised to the host; derived from `bind_endpoint` when
    /// absent and the bind address is concrete.
    #[serde(default)]
    pub advertise_address: Option<String>,

    /// The host control plane.
    pub host: HostEndpointConfig,

    /// Root of the cluster-wide shared filesystem.
    pub shared_dir: PathBuf,

    /// Node-local scratch space.
    pub local_temp_dir: PathBuf,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub docker: DockerConfig,

    #[serde(default)]
    pub overlay: OverlayConfig,

    #[serde(default)]
    pub vm: VmConfig,

    /// Extra bind mounts every task container gets, "host:container" form.
    #[serde(default)]
    pub additional_mounts: Vec<String>,
}

impl RunnerConfig {
    /// Where container tarballs are published on shared storage.
    pub fn container_tar_dir(&self) -> PathBuf {
        self.shared_dir.join("kohakuriver-containers")
    }

    /// Shared logs directory, bind-mounted into every container.
    pub fn logs_dir(&self) -> PathBuf {
        self.shared_dir.join("logs")
    }

    /// The local state store used for crash recovery.
    pub fn state_db_path(&self) -> PathBuf {
        self.local_temp_dir.join(".kohakuriver/runner-state.db")
    }

    pub fn host_base_url(&self) -> String {
        format!("http://{}:{}", self.host.address, self.host.port)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct HostEndpointConfig {
    pub address: String,

    #[serde(default = "default_host_port")]
    pub port: u16,
}

#[derive(Deserialize, Debug, Clone)]
pub struct HeartbeatConfig {
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval: default_heartbeat_interval() }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct DockerConfig {
    /// The default bridge network for tasks without an overlay IP.
    #[serde(default = "default_network_name")]
    pub network_name: String,

    #[serde(default = "default_network_subnet")]
    pub network_subnet: String,

    #[serde(default = "default_network_gateway")]
    pub network_gateway: String,

    /// Only one image sync runs at a time; this bounds each one.
    #[serde(with = "humantime_serde", default = "default_image_sync_timeout")]
    pub image_sync_timeout: Duration,

    /// Run all task containers privileged.
    #[serde(default)]
    pub tasks_privileged: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            network_name: default_network_name(),
            network_subnet: default_network_subnet(),
            network_gateway: default_network_gateway(),
            image_sync_timeout: default_image_sync_timeout(),
            tasks_privileged: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct OverlayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_base_vxlan_id")]
    pub base_vxlan_id: u32,

    #[serde(default = "default_vxlan_port")]
    pub vxlan_port: u16,

    #[serde(default = "default_mtu")]
    pub mtu: u32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_vxlan_id: default_base_vxlan_id(),
            vxlan_port: default_vxlan_port(),
            mtu: default_mtu(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct VmConfig {
    /// VM support is advertised only when the node actually can run KVM.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Where base images (`<name>.qcow2`) live.
    #[serde(default = "default_vm_images_dir")]
    pub images_dir: PathBuf,

    /// Per-VM instance directories.
    #[serde(default = "default_vm_instances_dir")]
    pub instances_dir: PathBuf,

    /// DNS servers pushed to guests via cloud-init.
    #[serde(default = "default_dns_servers")]
    pub dns_servers: Vec<String>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            images_dir: default_vm_images_dir(),
            instances_dir: default_vm_instances_dir(),
            dns_servers: default_dns_servers(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_host_port() -> u16 {
    8000
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_network_name() -> String {
    "kohakuriver-net".into()
}

fn default_network_subnet() -> String {
    "172.31.0.0/16".into()
}

fn default_network_gateway() -> String {
    "172.31.0.1".into()
}

fn default_image_sync_timeout() -> Duration {
    Duration::from_secs(600)
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

fn default_vm_images_dir() -> PathBuf {
    "/var/lib/kohakuriver/vm-images".into()
}

fn default_vm_instances_dir() -> PathBuf {
    "/var/lib/kohakuriver/vm-instances".into()
}

fn default_dns_servers() -> Vec<String> {
    vec!["8.8.8.8".into(), "1.1.1.1".into()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config() {
        let yaml = r#"
bind_endpoint: 0.0.0.0:8001
host:
  address: 192.168.1.10
shared_dir: /mnt/cluster
local_temp_dir: /tmp/kohakuriver
"#;
        let config: RunnerConfig = serde_yaml::from_str(yaml).expect("failed to parse");
        assert_eq!(config.host_base_url(), "http://192.168.1.10:8000");
        assert_eq!(config.container_tar_dir(), PathBuf::from("/mnt/cluster/kohakuriver-containers"));
        assert_eq!(config.state_db_path(), PathBuf::from("/tmp/kohakuriver/.kohakuriver/runner-state.db"));
        assert_eq!(config.docker.image_sync_timeout, Duration::from_secs(600));
        assert!(config.overlay.enabled);
    }
}
