//! Kernel network plumbing for the host side of the overlay.
//!
//! Everything goes through the `ip` / `iptables` / `firewall-cmd` binaries;
//! each invocation captures stdout and stderr and is bounded by a timeout.

use async_trait::async_trait;
use serde::Deserialize;
use std::{net::Ipv4Addr, time::Duration};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to spawn '{command}': {error}")]
    Spawn { command: String, error: std::io::Error },

    #[error("'{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("'{command}' exited with {code}: {stderr}")]
    Failed { command: String, code: i32, stderr: String },

    #[error("failed to parse '{command}' output: {error}")]
    Parse { command: String, error: String },
}

/// A VXLAN interface as reported by the kernel.
#[derive(Clone, Debug, PartialEq)]
pub struct VxlanLink {
    pub name: String,
    pub vni: u32,
    pub remote: Option<Ipv4Addr>,
}

/// Parameters for creating one host-side tunnel endpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct VxlanSpec {
    pub name: String,
    pub vni: u32,
    pub local: Ipv4Addr,
    pub remote: Ipv4Addr,
    pub port: u16,
    pub mtu: u32,
    /// Address assigned to the interface; the kernel auto-adds the
    /// subnet route when this lands.
    pub address: Ipv4Addr,
    pub prefix: u8,
}

/// The kernel-facing operations the overlay manager needs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LinkManager: Send + Sync {
    /// List all VXLAN interfaces currently present.
    async fn list_vxlan_links(&self) -> Result<Vec<VxlanLink>, LinkError>;

    /// Create a VXLAN interface, bring it up and assign its address.
    async fn create_vxlan(&self, spec: &VxlanSpec) -> Result<(), LinkError>;

    /// Delete an interface by name.
    async fn delete_link(&self, name: &str) -> Result<(), LinkError>;

    /// Ensure the `kohaku-host` dummy interface exists, is up and holds
    /// the host overlay IP.
    async fn ensure_dummy(&self, name: &str, address: Ipv4Addr, prefix: u8) -> Result<(), LinkError>;

    /// Enable IPv4 forwarding.
    async fn enable_forwarding(&self) -> Result<(), LinkError>;

    /// Insert FORWARD ACCEPT rules for the overlay CIDR in both directions.
    async fn ensure_forward_rules(&self, cidr: &str) -> Result<(), LinkError>;

    /// Add an interface to the firewalld trusted zone, when firewalld runs.
    async fn add_to_trusted_zone(&self, name: &str);
}

/// `LinkManager` backed by the iproute2 and iptables CLIs.
pub struct CommandLinkManager;

impl CommandLinkManager {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, LinkError> {
        run_command(program, args, COMMAND_TIMEOUT).await
    }

    /// `iptables -C` to probe, `-A` only when the rule is missing.
    async fn ensure_iptables_rule(&self, rule: &[&str]) -> Result<(), LinkError> {
        let mut check = vec!["-C"];
        check.extend_from_slice(rule);
        if self.run("iptables", &check).await.is_ok() {
            debug!("iptables rule already present: {}", rule.join(" "));
            return Ok(());
        }
        let mut add = vec!["-A"];
        add.extend_from_slice(rule);
        self.run("iptables", &add).await?;
        info!("Added iptables rule: {}", rule.join(" "));
        Ok(())
    }
}

pub(crate) async fn run_command(program: &str, args: &[&str], timeout: Duration) -> Result<String, LinkError> {
    let rendered = format!("{program} {}", args.join(" "));
    debug!("Executing: {rendered}");
    let output = tokio::time::timeout(timeout, Command::new(program).args(args).output())
        .await
        .map_err(|_| LinkError::Timeout { command: rendered.clone(), timeout })?
        .map_err(|error| LinkError::Spawn { command: rendered.clone(), error })?;
    if !output.status.success() {
        return Err(LinkError::Failed {
            command: rendered,
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// One entry of `ip -d -j link show type vxlan`.
#[derive(Debug, Deserialize)]
struct IpLinkEntry {
    ifname: String,
    #[serde(default)]
    linkinfo: Option<IpLinkInfo>,
}

#[derive(Debug, Deserialize)]
struct IpLinkInfo {
    #[serde(default)]
    info_kind: Option<String>,
    #[serde(default)]
    info_data: Option<IpVxlanData>,
}

#[derive(Debug, Deserialize)]
struct IpVxlanData {
    #[serde(default)]
    id: Option<u32>,
    #[serde(default)]
    remote: Option<Ipv4Addr>,
    #[serde(default)]
    group: Option<Ipv4Addr>,
}

fn parse_vxlan_links(json: &str) -> Result<Vec<VxlanLink>, serde_json::Error> {
    let entries: Vec<IpLinkEntry> = serde_json::from_str(json)?;
    let links = entries
        .into_iter()
        .filter_map(|entry| {
            let info = entry.linkinfo?;
            if info.info_kind.as_deref() != Some("vxlan") {
                return None;
            }
            let data = info.info_data?;
            Some(VxlanLink { name: entry.ifname, vni: data.id?, remote: data.remote.or(data.group) })
        })
        .collect();
    Ok(links)
}

#[async_trait]
impl LinkManager for CommandLinkManager {
    async fn list_vxlan_links(&self) -> Result<Vec<VxlanLink>, LinkError> {
        let output = self.run("ip", &["-d", "-j", "link", "show", "type", "vxlan"]).await?;
        parse_vxlan_links(&output)
            .map_err(|e| LinkError::Parse { command: "ip -d -j link show".into(), error: e.to_string() })
    }

    async fn create_vxlan(&self, spec: &VxlanSpec) -> Result<(), LinkError> {
        let VxlanSpec { name, vni, local, remote, port, mtu, address, prefix } = spec;
        info!("Creating VXLAN {name}: vni={vni}, local={local}, remote={remote}, port={port}");
        let vni = vni.to_string();
        let local = local.to_string();
        let remote = remote.to_string();
        let port = port.to_string();
        self.run(
            "ip",
            &[
                "link", "add", name, "type", "vxlan", "id", &vni, "local", &local, "remote", &remote, "dstport",
                &port, "nolearning",
            ],
        )
        .await?;
        let mtu = mtu.to_string();
        self.run("ip", &["link", "set", name, "mtu", &mtu, "up"]).await?;
        let cidr = format!("{address}/{prefix}");
        self.run("ip", &["addr", "replace", &cidr, "dev", name]).await?;
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> Result<(), LinkError> {
        self.run("ip", &["link", "del", name]).await?;
        info!("Deleted interface {name}");
        Ok(())
    }

    async fn ensure_dummy(&self, name: &str, address: Ipv4Addr, prefix: u8) -> Result<(), LinkError> {
        match self.run("ip", &["link", "add", name, "type", "dummy"]).await {
            Ok(_) => info!("Created dummy interface {name}"),
            // Already present from a previous run.
            Err(LinkError::Failed { code: 2, .. }) => debug!("Dummy interface {name} already exists"),
            Err(e) => return Err(e),
        }
        self.run("ip", &["link", "set", name, "up"]).await?;
        let cidr = format!("{address}/{prefix}");
        self.run("ip", &["addr", "replace", &cidr, "dev", name]).await?;
        Ok(())
    }

    async fn enable_forwarding(&self) -> Result<(), LinkError> {
        match tokio::fs::write("/proc/sys/net/ipv4/ip_forward", "1").await {
            Ok(()) => {
                info!("Enabled IPv4 forwarding");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                warn!("Cannot enable IP forwarding, ensure net.ipv4.ip_forward=1 is set");
                Ok(())
            }
            Err(error) => Err(LinkError::Spawn { command: "write /proc/sys/net/ipv4/ip_forward".into(), error }),
        }
    }

    async fn ensure_forward_rules(&self, cidr: &str) -> Result<(), LinkError> {
        self.ensure_iptables_rule(&["FORWARD", "-s", cidr, "-j", "ACCEPT"]).await?;
        self.ensure_iptables_rule(&["FORWARD", "-d", cidr, "-j", "ACCEPT"]).await?;
        Ok(())
    }

    async fn add_to_trusted_zone(&self, name: &str) {
        let state = match self.run("firewall-cmd", &["--state"]).await {
            Ok(state) => state,
            Err(_) => {
                debug!("firewalld not available, skipping trusted zone for {name}");
                return;
            }
        };
        if !state.contains("running") {
            debug!("firewalld not running, skipping trusted zone for {name}");
            return;
        }
        let arg = format!("--add-interface={name}");
        match self.run("firewall-cmd", &["--zone=trusted", &arg]).await {
            Ok(_) => info!("Added {name} to firewalld trusted zone"),
            Err(e) => warn!("Failed to add {name} to firewalld trusted zone: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ip_link_output() {
        let json = r#"[
            {"ifname": "vxkr1", "linkinfo": {"info_kind": "vxlan", "info_data": {"id": 101, "remote": "192.168.1.5"}}},
            {"ifname": "vxkr2", "linkinfo": {"info_kind": "vxlan", "info_data": {"id": 102, "group": "192.168.1.6"}}},
            {"ifname": "eth0"}
        ]"#;
        let links = parse_vxlan_links(json).expect("failed to parse");
        assert_eq!(
            links,
            vec![
                VxlanLink { name: "vxkr1".into(), vni: 101, remote: Some("192.168.1.5".parse().unwrap()) },
                VxlanLink { name: "vxkr2".into(), vni: 102, remote: Some("192.168.1.6".parse().unwrap()) },
            ]
        );
    }

    #[test]
    fn parse_empty_output() {
        assert_eq!(parse_vxlan_links("[]").expect("failed to parse"), vec![]);
    }
}
