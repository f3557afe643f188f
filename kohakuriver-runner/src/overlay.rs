//! Runner side of the VXLAN overlay.
//!
//! On registration the host hands out an overlay block; this module
//! materialises it: a local bridge carrying the gateway IP, a `vxlan0`
//! tunnel to the host attached to that bridge, a route sending the rest
//! of the overlay through the host, NAT for internet egress and a Docker
//! network bound to the bridge so containers can join with overlay IPs.
//!
//! VM IPs are handed out from the top of the runner subnet, descending,
//! so they stay clear of Docker's own allocator which walks upwards.

use crate::{
    clients::docker::DockerClient,
    commands::{CommandError, DEFAULT_TIMEOUT, run_command},
};
use kohakuriver_models::{cluster::OverlayBlock, naming};
use std::{
    collections::HashSet,
    net::Ipv4Addr,
    sync::{Arc, Mutex},
};
use thiserror::Error;
use tracing::{debug, info};

const VXLAN_DEVICE: &str = "vxlan0";

#[derive(Debug, Error)]
pub enum RunnerOverlayError {
    #[error("overlay is not configured")]
    NotConfigured,

    #[error("invalid subnet '{0}' in overlay block")]
    BadSubnet(String),

    #[error("no free VM IPs in {0}")]
    NoFreeIps(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("docker network setup failed: {0}")]
    Docker(String),
}

/// A VM's network identity on the overlay.
#[derive(Clone, Debug, PartialEq)]
pub struct VmNetwork {
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub prefix_len: u8,
    pub bridge: String,
}

#[derive(Default)]
struct State {
    block: Option<OverlayBlock>,
    vm_ips: HashSet<Ipv4Addr>,
}

pub struct RunnerOverlayManager {
    base_vxlan_id: u32,
    vxlan_port: u16,
    mtu: u32,
    state: Mutex<State>,
}

impl RunnerOverlayManager {
    pub fn new(base_vxlan_id: u32, vxlan_port: u16, mtu: u32) -> Self {
        Self { base_vxlan_id, vxlan_port, mtu, state: Default::default() }
    }

    pub fn is_configured(&self) -> bool {
        self.state.lock().expect("overlay state poisoned").block.is_some()
    }

    pub fn gateway(&self) -> Option<String> {
        self.state.lock().expect("overlay state poisoned").block.as_ref().map(|b| b.overlay_gateway.clone())
    }

    /// Bring the runner's half of the overlay up from the registration
    /// response.
    pub async fn setup(
        &self,
        block: OverlayBlock,
        runner_physical_ip: Ipv4Addr,
        docker: &Arc<dyn DockerClient>,
    ) -> Result<(), RunnerOverlayError> {
        let (_, prefix) = parse_cidr(&block.overlay_subnet)
            .ok_or_else(|| RunnerOverlayError::BadSubnet(block.overlay_subnet.clone()))?;
        let vni = (self.base_vxlan_id + block.runner_id).to_string();
        let bridge = naming::OVERLAY_BRIDGE;
        info!(
            "Setting up overlay: runner_id={}, subnet={}, vni={vni}, hub={}",
            block.runner_id, block.overlay_subnet, block.host_physical_ip
        );

        // Bridge with the gateway address.
        match run_command("ip", &["link", "add", bridge, "type", "bridge"], DEFAULT_TIMEOUT).await {
            Ok(_) => info!("Created bridge {bridge}"),
            Err(CommandError::Failed { code: 2, .. }) => debug!("Bridge {bridge} already exists"),
            Err(e) => return Err(e.into()),
        }
        let gateway_cidr = format!("{}/{prefix}", block.overlay_gateway);
        run_command("ip", &["addr", "replace", &gateway_cidr, "dev", bridge], DEFAULT_TIMEOUT).await?;
        run_command("ip", &["link", "set", bridge, "up"], DEFAULT_TIMEOUT).await?;

        // Tunnel to the host, attached to the bridge. Recreate rather
        // than patch a stale one.
        let _ = run_command("ip", &["link", "del", VXLAN_DEVICE], DEFAULT_TIMEOUT).await;
        let local = runner_physical_ip.to_string();
        let port = self.vxlan_port.to_string();
        run_command(
            "ip",
            &[
                "link", "add", VXLAN_DEVICE, "type", "vxlan", "id", &vni, "local", &local, "remote",
                block.host_physical_ip.as_str(), "dstport", &port, "nolearning",
            ],
            DEFAULT_TIMEOUT,
        )
        .await?;
        let mtu = self.mtu.to_string();
        run_command("ip", &["link", "set", VXLAN_DEVICE, "mtu", &mtu, "master", bridge, "up"], DEFAULT_TIMEOUT)
            .await?;

        // Cross-runner traffic goes through the host's address on this
        // subnet.
        run_command(
            "ip",
            &["route", "replace", block.overlay_network_cidr.as_str(), "via", block.host_ip_on_runner_subnet.as_str()],
            DEFAULT_TIMEOUT,
        )
        .await?;

        self.ensure_iptables(&block).await?;

        // The Docker network rides the same bridge, so containers joining
        // it land directly on the overlay.
        docker
            .ensure_network(
                naming::OVERLAY_DOCKER_NETWORK,
                &block.overlay_subnet,
                &block.overlay_gateway,
                Some(bridge),
            )
            .await
            .map_err(|e| RunnerOverlayError::Docker(e.to_string()))?;

        self.state.lock().expect("overlay state poisoned").block = Some(block);
        info!("Overlay setup complete");
        Ok(())
    }

    async fn ensure_iptables(&self, block: &OverlayBlock) -> Result<(), RunnerOverlayError> {
        let cidr = block.overlay_network_cidr.as_str();
        for rule in [
            vec!["FORWARD", "-s", cidr, "-j", "ACCEPT"],
            vec!["FORWARD", "-d", cidr, "-j", "ACCEPT"],
        ] {
            let mut check = vec!["-C"];
            check.extend(&rule);
            if run_command("iptables", &check, DEFAULT_TIMEOUT).await.is_err() {
                let mut add = vec!["-A"];
                add.extend(&rule);
                run_command("iptables", &add, DEFAULT_TIMEOUT).await?;
            }
        }
        // Masquerade traffic leaving the overlay for the internet.
        let nat_rule = ["POSTROUTING", "-s", block.overlay_subnet.as_str(), "!", "-d", cidr, "-j", "MASQUERADE"];
        let mut check = vec!["-t", "nat", "-C"];
        check.extend(&nat_rule);
        if run_command("iptables", &check, DEFAULT_TIMEOUT).await.is_err() {
            let mut add = vec!["-t", "nat", "-A"];
            add.extend(&nat_rule);
            run_command("iptables", &add, DEFAULT_TIMEOUT).await?;
        }
        Ok(())
    }

    /// Allocate a VM address from the top of the runner subnet.
    pub fn allocate_vm_network(&self) -> Result<VmNetwork, RunnerOverlayError> {
        let mut state = self.state.lock().expect("overlay state poisoned");
        let block = state.block.as_ref().ok_or(RunnerOverlayError::NotConfigured)?;
        let (base, prefix) = parse_cidr(&block.overlay_subnet)
            .ok_or_else(|| RunnerOverlayError::BadSubnet(block.overlay_subnet.clone()))?;
        let gateway: Ipv4Addr = block
            .overlay_gateway
            .parse()
            .map_err(|_| RunnerOverlayError::BadSubnet(block.overlay_subnet.clone()))?;
        let host_ip: Ipv4Addr = block.host_ip_on_runner_subnet.parse().unwrap_or(Ipv4Addr::UNSPECIFIED);

        let size = 1u32 << (32 - prefix);
        let base = u32::from(base);
        let ip = (2..size - 1)
            .rev()
            .map(|offset| Ipv4Addr::from(base + offset))
            .find(|ip| *ip != gateway && *ip != host_ip && !state.vm_ips.contains(ip))
            .ok_or_else(|| RunnerOverlayError::NoFreeIps(block.overlay_subnet.clone()))?;
        state.vm_ips.insert(ip);
        Ok(VmNetwork { ip, gateway, prefix_len: prefix, bridge: naming::OVERLAY_BRIDGE.into() })
    }

    /// Re-claim an address recovered from a persisted VM record.
    pub fn adopt_vm_ip(&self, ip: Ipv4Addr) {
        self.state.lock().expect("overlay state poisoned").vm_ips.insert(ip);
    }

    pub fn release_vm_ip(&self, ip: Ipv4Addr) {
        self.state.lock().expect("overlay state poisoned").vm_ips.remove(&ip);
    }
}

fn parse_cidr(cidr: &str) -> Option<(Ipv4Addr, u8)> {
    let (address, prefix) = cidr.split_once('/')?;
    Some((address.parse().ok()?, prefix.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured_manager() -> RunnerOverlayManager {
        let manager = RunnerOverlayManager::new(100, 4789, 1450);
        manager.state.lock().unwrap().block = Some(OverlayBlock {
            runner_id: 1,
            overlay_subnet: "10.128.64.0/24".into(),
            overlay_gateway: "10.128.64.1".into(),
            host_overlay_ip: "10.128.0.1".into(),
            host_physical_ip: "192.168.1.1".into(),
            host_ip_on_runner_subnet: "10.128.64.254".into(),
            overlay_network_cidr: "10.128.0.0/12".into(),
        });
        manager
    }

    #[test]
    fn vm_ips_descend_from_subnet_top() {
        let manager = configured_manager();
        let first = manager.allocate_vm_network().expect("allocation failed");
        // .255 is broadcast, .254 is the host: the first VM gets .253.
        assert_eq!(first.ip, Ipv4Addr::new(10, 128, 64, 253));
        assert_eq!(first.gateway, Ipv4Addr::new(10, 128, 64, 1));
        assert_eq!(first.prefix_len, 24);

        let second = manager.allocate_vm_network().expect("allocation failed");
        assert_eq!(second.ip, Ipv4Addr::new(10, 128, 64, 252));
    }

    #[test]
    fn released_ips_are_reused() {
        let manager = configured_manager();
        let first = manager.allocate_vm_network().unwrap();
        manager.release_vm_ip(first.ip);
        let again = manager.allocate_vm_network().unwrap();
        assert_eq!(first.ip, again.ip);
    }

    #[test]
    fn adopted_ips_are_skipped() {
        let manager = configured_manager();
        manager.adopt_vm_ip(Ipv4Addr::new(10, 128, 64, 253));
        let allocated = manager.allocate_vm_network().unwrap();
        assert_eq!(allocated.ip, Ipv4Addr::new(10, 128, 64, 252));
    }

    #[test]
    fn unconfigured_manager_rejects_allocation() {
        let manager = RunnerOverlayManager::new(100, 4789, 1450);
        let err = manager.allocate_vm_network().expect_err("allocated without config");
        assert!(matches!(err, RunnerOverlayError::NotConfigured));
    }
}
