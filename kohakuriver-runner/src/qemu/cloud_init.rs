//! Cloud-init seed ISO generation.
//!
//! The seed is a `cidata` ISO9660 volume (Joliet + Rock Ridge) with
//! three files: `meta-data`, `user-data` and `network-config`. The
//! user-data provisions the `kohaku` user, authorised keys, the embedded
//! VM agent and its systemd unit, 9p mounts for the shared and local
//! directories and, for GPU VMs, the host-matched NVIDIA driver install.

use crate::commands::{CommandError, run_command};
use serde_json::json;
use std::{path::Path, time::Duration};
use thiserror::Error;
use tracing::info;

const GENISOIMAGE_TIMEOUT: Duration = Duration::from_secs(60);

/// The agent script written to /usr/local/bin/kohakuriver-vm-agent in
/// every guest.
const VM_AGENT_SCRIPT: &str = include_str!("../../assets/vm_agent.py");

#[derive(Debug, Error)]
pub enum CloudInitError {
    #[error("failed to write seed files: {0}")]
    Write(#[from] std::io::Error),

    #[error("failed to serialize cloud-init data: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error("genisoimage failed: {0}")]
    Iso(#[from] CommandError),
}

#[derive(Clone, Debug)]
pub struct CloudInitSpec {
    pub task_id: i64,
    pub hostname: String,
    pub mac_address: String,
    pub vm_ip: String,
    pub gateway: String,
    pub prefix_len: u8,
    pub dns_servers: Vec<String>,
    /// The user's key; empty when SSH key injection is off.
    pub ssh_public_key: Option<String>,
    /// The runner's own key, for host-side health probing.
    pub runner_public_key: Option<String>,
    pub runner_url: String,
    pub heartbeat_interval_secs: u32,
    /// Install this NVIDIA driver version in the guest when set.
    pub nvidia_driver_version: Option<String>,
}

pub fn meta_data(spec: &CloudInitSpec) -> String {
    format!("instance-id: kohaku-vm-{}\nlocal-hostname: {}\n", spec.task_id, spec.hostname)
}

pub fn network_config(spec: &CloudInitSpec) -> Result<String, CloudInitError> {
    let config = json!({
        "version": 2,
        "ethernets": {
            "primary": {
                "match": { "macaddress": spec.mac_address },
                "addresses": [format!("{}/{}", spec.vm_ip, spec.prefix_len)],
                "routes": [{ "to": "default", "via": spec.gateway }],
                "nameservers": { "addresses": spec.dns_servers },
            }
        }
    });
    Ok(serde_yaml::to_string(&config)?)
}

pub fn user_data(spec: &CloudInitSpec) -> Result<String, CloudInitError> {
    let mut authorized_keys: Vec<String> = Vec::new();
    if let Some(key) = &spec.ssh_public_key {
        authorized_keys.push(key.clone());
    }
    if let Some(key) = &spec.runner_public_key {
        authorized_keys.push(key.clone());
    }

    let unit = format!(
        "[Unit]\nDescription=KohakuRiver VM agent\nAfter=network-online.target\nWants=network-online.target\n\n\
         [Service]\nEnvironment=KOHAKU_RUNNER_URL={}\nEnvironment=KOHAKU_TASK_ID={}\n\
         Environment=KOHAKU_HEARTBEAT_INTERVAL={}\nExecStart=/usr/bin/python3 /usr/local/bin/kohakuriver-vm-agent\n\
         Restart=always\nRestartSec=5\n\n[Install]\nWantedBy=multi-user.target\n",
        spec.runner_url, spec.task_id, spec.heartbeat_interval_secs
    );

    let mut runcmd: Vec<Vec<String>> = vec![
        vec!["mkdir".into(), "-p".into(), "/shared".into(), "/local_temp".into()],
        shell("mount -t 9p -o trans=virtio,version=9p2000.L kohaku_shared /shared || true"),
        shell("mount -t 9p -o trans=virtio,version=9p2000.L kohaku_local /local_temp || true"),
        shell("DEBIAN_FRONTEND=noninteractive apt-get install -y qemu-guest-agent || true"),
    ];
    if let Some(version) = &spec.nvidia_driver_version {
        // Match the host driver exactly; a mismatched guest driver cannot
        // talk to the passed-through GPU.
        runcmd.push(shell(&format!(
            "curl -fsSL -o /tmp/nvidia.run https://us.download.nvidia.com/XFree86/Linux-x86_64/{version}/NVIDIA-Linux-x86_64-{version}.run && sh /tmp/nvidia.run --silent --no-questions || true"
        )));
        runcmd.push(shell(&"python3 -m pip install nvidia-ml-py || true".to_string()));
    }
    runcmd.push(vec!["systemctl".into(), "daemon-reload".into()]);
    runcmd.push(vec!["systemctl".into(), "enable".into(), "--now".into(), "kohakuriver-vm-agent".into()]);

    let config = json!({
        "hostname": spec.hostname,
        "users": [
            {
                "name": "kohaku",
                "sudo": "ALL=(ALL) NOPASSWD:ALL",
                "groups": "sudo",
                "shell": "/bin/bash",
                "ssh_authorized_keys": authorized_keys,
            }
        ],
        "ssh_authorized_keys": authorized_keys,
        "disable_root": false,
        "write_files": [
            {
                "path": "/usr/local/bin/kohakuriver-vm-agent",
                "permissions": "0755",
                "content": VM_AGENT_SCRIPT,
            },
            {
                "path": "/etc/systemd/system/kohakuriver-vm-agent.service",
                "permissions": "0644",
                "content": unit,
            }
        ],
        "runcmd": runcmd,
    });
    Ok(format!("#cloud-config\n{}", serde_yaml::to_string(&config)?))
}

fn shell(command: &str) -> Vec<String> {
    vec!["sh".into(), "-c".into(), command.into()]
}

/// Write the three seed files and build the ISO with genisoimage.
pub async fn create_seed_iso(iso_path: &Path, spec: &CloudInitSpec) -> Result<(), CloudInitError> {
    let staging = tempfile::TempDir::with_prefix("kohakuriver-seed")?;
    tokio::fs::write(staging.path().join("meta-data"), meta_data(spec)).await?;
    tokio::fs::write(staging.path().join("user-data"), user_data(spec)?).await?;
    tokio::fs::write(staging.path().join("network-config"), network_config(spec)?).await?;

    let output = iso_path.display().to_string();
    let input = staging.path().display().to_string();
    run_command(
        "genisoimage",
        &["-output", &output, "-volid", "cidata", "-joliet", "-rock", &input],
        GENISOIMAGE_TIMEOUT,
    )
    .await?;
    info!("Cloud-init seed written to {output}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> CloudInitSpec {
        CloudInitSpec {
            task_id: 42,
            hostname: "vm-42".into(),
            mac_address: "52:54:00:00:00:2a".into(),
            vm_ip: "10.128.64.200".into(),
            gateway: "10.128.64.1".into(),
            prefix_len: 18,
            dns_servers: vec!["8.8.8.8".into(), "1.1.1.1".into()],
            ssh_public_key: Some("ssh-ed25519 AAAA user".into()),
            runner_public_key: Some("ssh-ed25519 BBBB runner".into()),
            runner_url: "http://192.168.1.5:8001".into(),
            heartbeat_interval_secs: 10,
            nvidia_driver_version: None,
        }
    }

    #[test]
    fn meta_data_identity() {
        let data = meta_data(&spec());
        assert_eq!(data, "instance-id: kohaku-vm-42\nlocal-hostname: vm-42\n");
    }

    #[test]
    fn network_config_static_address() {
        let config = network_config(&spec()).expect("failed to render");
        assert!(config.contains("52:54:00:00:00:2a"));
        assert!(config.contains("10.128.64.200/18"));
        assert!(config.contains("via: 10.128.64.1"));
        assert!(config.contains("8.8.8.8"));
    }

    #[test]
    fn user_data_carries_agent_and_keys() {
        let data = user_data(&spec()).expect("failed to render");
        assert!(data.starts_with("#cloud-config\n"));
        assert!(data.contains("/usr/local/bin/kohakuriver-vm-agent"));
        assert!(data.contains("KOHAKU_RUNNER_URL=http://192.168.1.5:8001"));
        assert!(data.contains("KOHAKU_TASK_ID=42"));
        assert!(data.contains("KOHAKU_HEARTBEAT_INTERVAL=10"));
        assert!(data.contains("ssh-ed25519 AAAA user"));
        assert!(data.contains("ssh-ed25519 BBBB runner"));
        assert!(data.contains("kohaku_shared /shared"));
        assert!(data.contains("kohaku_local /local_temp"));
        assert!(data.contains("qemu-guest-agent"));
        // No GPU: no driver install.
        assert!(!data.contains("NVIDIA-Linux"));
    }

    #[test]
    fn user_data_installs_matching_driver() {
        let mut spec = spec();
        spec.nvidia_driver_version = Some("550.54.14".into());
        let data = user_data(&spec).expect("failed to render");
        assert!(data.contains("NVIDIA-Linux-x86_64-550.54.14.run"));
        assert!(data.contains("nvidia-ml-py"));
    }
}
