//! Host side of the VXLAN hub overlay.
//!
//! The host is the central L3 router: one VXLAN interface per runner, each
//! carrying the host's `.254` address inside that runner's subnet. The
//! in-memory allocation map is a cache; the live set of `vxkr*` interfaces
//! is the source of truth and is re-read on every startup, so a host
//! restart never disturbs an established tunnel.

use crate::overlay::{
    netlink::{LinkError, LinkManager, VxlanSpec},
    subnet::{self, OverlaySubnetConfig, SubnetConfigError},
};
use chrono::{DateTime, Utc};
use kohakuriver_models::cluster::OverlayBlock;
use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::{Arc, Mutex},
};
use thiserror::Error;
use tracing::{info, warn};

/// Name of the dummy interface holding the host's overlay-global IP.
const HOST_DUMMY_DEVICE: &str = "kohaku-host";

/// Placeholder prefix used for allocations recovered from interfaces
/// before their runner re-registers.
const PLACEHOLDER_PREFIX: &str = "runner_";

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("no available runner ids (1-{0}) and no inactive allocations to evict")]
    Exhausted(u32),

    #[error("unknown runner '{0}'")]
    UnknownRunner(String),

    #[error(transparent)]
    Subnet(#[from] SubnetConfigError),

    #[error("link operation failed: {0}")]
    Link(#[from] LinkError),
}

/// One runner's slot in the overlay.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayAllocation {
    pub runner_name: String,
    pub runner_id: u32,
    pub physical_ip: Ipv4Addr,
    pub subnet: String,
    pub gateway: Ipv4Addr,
    pub vxlan_device: String,
    pub last_used: DateTime<Utc>,
    pub is_active: bool,
}

pub struct OverlayManagerArgs {
    pub subnet: OverlaySubnetConfig,
    pub base_vxlan_id: u32,
    pub vxlan_port: u16,
    pub mtu: u32,
    pub host_physical_ip: Ipv4Addr,
    pub links: Arc<dyn LinkManager>,
}

#[derive(Default)]
struct State {
    allocations: HashMap<String, OverlayAllocation>,
    id_to_runner: HashMap<u32, String>,
}

pub struct OverlayNetworkManager {
    subnet: OverlaySubnetConfig,
    base_vxlan_id: u32,
    vxlan_port: u16,
    mtu: u32,
    host_physical_ip: Ipv4Addr,
    links: Arc<dyn LinkManager>,
    state: Mutex<State>,
}

impl OverlayNetworkManager {
    pub fn new(args: OverlayManagerArgs) -> Self {
        let OverlayManagerArgs { subnet, base_vxlan_id, vxlan_port, mtu, host_physical_ip, links } = args;
        Self { subnet, base_vxlan_id, vxlan_port, mtu, host_physical_ip, links, state: Default::default() }
    }

    pub fn subnet_config(&self) -> &OverlaySubnetConfig {
        &self.subnet
    }

    /// Enable routing, bring up the host dummy interface and rebuild the
    /// allocation map from live interfaces.
    pub async fn initialize(&self) -> Result<(), OverlayError> {
        self.links.enable_forwarding().await?;
        self.links.ensure_dummy(HOST_DUMMY_DEVICE, self.subnet.host_ip(), self.subnet.host_prefix()).await?;
        self.links.ensure_forward_rules(&self.subnet.overlay_cidr()).await?;
        self.recover_from_interfaces().await?;
        let recovered = self.state.lock().expect("overlay lock poisoned").allocations.len();
        info!("Overlay initialized: host_ip={}, recovered_allocations={recovered}", self.subnet.host_ip());
        Ok(())
    }

    /// Scan `vxkr*` interfaces, rebuild placeholder allocations for valid
    /// ones and delete the rest. Runners claim placeholders when they
    /// re-register with a matching physical IP.
    async fn recover_from_interfaces(&self) -> Result<(), OverlayError> {
        let links = self.links.list_vxlan_links().await?;
        let mut recovered = Vec::new();
        let mut deleted = 0usize;
        for link in links {
            if !link.name.starts_with(subnet::VXLAN_DEVICE_PREFIX) {
                continue;
            }
            let runner_id = subnet::parse_vxlan_device_name(&link.name, &self.subnet);
            let expected_vni = runner_id.map(|id| self.base_vxlan_id + id);
            if runner_id.is_none() || Some(link.vni) != expected_vni {
                warn!(
                    "Invalid VXLAN interface {} (vni={}, expected={expected_vni:?}), deleting",
                    link.name, link.vni
                );
                if let Err(e) = self.links.delete_link(&link.name).await {
                    warn!("Failed to delete invalid interface {}: {e}", link.name);
                }
                deleted += 1;
                continue;
            }
            recovered.push((link, runner_id.expect("validated above")));
        }

        let mut trusted = Vec::new();
        {
            let mut state = self.state.lock().expect("overlay lock poisoned");
            for (link, runner_id) in recovered {
                if state.id_to_runner.contains_key(&runner_id) {
                    warn!("Duplicate runner id {runner_id}, skipping {}", link.name);
                    continue;
                }
                let placeholder = format!("{PLACEHOLDER_PREFIX}{runner_id}");
                let allocation = OverlayAllocation {
                    runner_name: placeholder.clone(),
                    runner_id,
                    physical_ip: link.remote.unwrap_or(Ipv4Addr::UNSPECIFIED),
                    subnet: self.subnet.runner_subnet(runner_id)?,
                    gateway: self.subnet.runner_gateway(runner_id)?,
                    vxlan_device: link.name.clone(),
                    last_used: Utc::now(),
                    is_active: false,
                };
                state.id_to_runner.insert(runner_id, placeholder.clone());
                state.allocations.insert(placeholder, allocation);
                trusted.push(link.name.clone());
            }
            info!("Recovered {} overlay allocations, deleted {deleted} invalid interfaces", state.allocations.len());
        }
        for name in trusted {
            self.links.add_to_trusted_zone(&name).await;
        }
        Ok(())
    }

    /// Allocate (or re-use) an overlay slot for a runner.
    ///
    /// A runner keeps its subnet across reconnects; a recovered placeholder
    /// matching the physical IP is remapped; otherwise the smallest free id
    /// is taken, evicting the least recently used inactive allocation when
    /// the pool is full.
    pub async fn allocate_for_runner(
        &self,
        runner_name: &str,
        physical_ip: Ipv4Addr,
    ) -> Result<OverlayAllocation, OverlayError> {
        // Decide what to do under the lock, run link operations outside it.
        enum Plan {
            Reuse { recreate: bool, allocation: OverlayAllocation },
            Create { runner_id: u32, evict: Option<OverlayAllocation> },
        }

        let plan = {
            let mut state = self.state.lock().expect("overlay lock poisoned");
            if let Some(alloc) = state.allocations.get_mut(runner_name) {
                alloc.last_used = Utc::now();
                alloc.is_active = true;
                let recreate = alloc.physical_ip != physical_ip;
                alloc.physical_ip = physical_ip;
                Plan::Reuse { recreate, allocation: alloc.clone() }
            } else if let Some(placeholder) = state
                .allocations
                .iter()
                .find(|(name, alloc)| name.starts_with(PLACEHOLDER_PREFIX) && alloc.physical_ip == physical_ip)
                .map(|(name, _)| name.clone())
            {
                let mut alloc = state.allocations.remove(&placeholder).expect("placeholder vanished");
                alloc.runner_name = runner_name.to_string();
                alloc.last_used = Utc::now();
                alloc.is_active = true;
                state.id_to_runner.insert(alloc.runner_id, runner_name.to_string());
                state.allocations.insert(runner_name.to_string(), alloc.clone());
                info!("Remapped recovered allocation {placeholder} -> {runner_name}: {}", alloc.subnet);
                return Ok(alloc);
            } else {
                let max = self.subnet.max_runners();
                let free_id = (1..=max).find(|id| !state.id_to_runner.contains_key(id));
                match free_id {
                    Some(runner_id) => Plan::Create { runner_id, evict: None },
                    None => {
                        let lru = state
                            .allocations
                            .values()
                            .filter(|a| !a.is_active)
                            .min_by_key(|a| a.last_used)
                            .cloned();
                        let Some(victim) = lru else {
                            return Err(OverlayError::Exhausted(max));
                        };
                        state.allocations.remove(&victim.runner_name);
                        state.id_to_runner.remove(&victim.runner_id);
                        Plan::Create { runner_id: victim.runner_id, evict: Some(victim) }
                    }
                }
            }
        };

        match plan {
            Plan::Reuse { recreate, allocation } => {
                if recreate {
                    info!("Physical IP changed for {runner_name}, recreating VXLAN");
                    self.links.delete_link(&allocation.vxlan_device).await.ok();
                    self.create_tunnel(allocation.runner_id, physical_ip).await?;
                } else {
                    info!("Reusing existing allocation for {runner_name}: {}", allocation.subnet);
                }
                Ok(allocation)
            }
            Plan::Create { runner_id, evict } => {
                if let Some(victim) = evict {
                    info!("Evicting inactive allocation {} (runner_id={runner_id})", victim.runner_name);
                    self.links.delete_link(&victim.vxlan_device).await.ok();
                }
                let device = self.create_tunnel(runner_id, physical_ip).await?;
                let allocation = OverlayAllocation {
                    runner_name: runner_name.to_string(),
                    runner_id,
                    physical_ip,
                    subnet: self.subnet.runner_subnet(runner_id)?,
                    gateway: self.subnet.runner_gateway(runner_id)?,
                    vxlan_device: device,
                    last_used: Utc::now(),
                    is_active: true,
                };
                let mut state = self.state.lock().expect("overlay lock poisoned");
                state.id_to_runner.insert(runner_id, runner_name.to_string());
                state.allocations.insert(runner_name.to_string(), allocation.clone());
                info!(
                    "Created allocation for {runner_name}: runner_id={runner_id}, subnet={}, device={}",
                    allocation.subnet, allocation.vxlan_device
                );
                Ok(allocation)
            }
        }
    }

    async fn create_tunnel(&self, runner_id: u32, physical_ip: Ipv4Addr) -> Result<String, OverlayError> {
        let name = subnet::vxlan_device_name(runner_id);
        // A stale interface with the right name may survive a crash with a
        // wrong remote; replace it unconditionally.
        let existing = self.links.list_vxlan_links().await?;
        if let Some(link) = existing.iter().find(|l| l.name == name) {
            let expected_vni = self.base_vxlan_id + runner_id;
            if link.vni == expected_vni && link.remote == Some(physical_ip) {
                self.links.add_to_trusted_zone(&name).await;
                return Ok(name);
            }
            self.links.delete_link(&name).await?;
        }
        let spec = VxlanSpec {
            name: name.clone(),
            vni: self.base_vxlan_id + runner_id,
            local: self.host_physical_ip,
            remote: physical_ip,
            port: self.vxlan_port,
            mtu: self.mtu,
            address: self.subnet.host_ip_on_runner_subnet(runner_id)?,
            prefix: self.subnet.runner_prefix(),
        };
        self.links.create_vxlan(&spec).await?;
        self.links.add_to_trusted_zone(&name).await;
        Ok(name)
    }

    /// Build the registration response block for a runner's allocation.
    pub fn overlay_block(&self, allocation: &OverlayAllocation) -> Result<OverlayBlock, OverlayError> {
        Ok(OverlayBlock {
            runner_id: allocation.runner_id,
            overlay_subnet: allocation.subnet.clone(),
            overlay_gateway: allocation.gateway.to_string(),
            host_overlay_ip: self.subnet.host_ip().to_string(),
            host_physical_ip: self.host_physical_ip.to_string(),
            host_ip_on_runner_subnet: self.subnet.host_ip_on_runner_subnet(allocation.runner_id)?.to_string(),
            overlay_network_cidr: self.subnet.overlay_cidr(),
        })
    }

    pub fn mark_runner_inactive(&self, runner_name: &str) {
        let mut state = self.state.lock().expect("overlay lock poisoned");
        if let Some(alloc) = state.allocations.get_mut(runner_name) {
            alloc.is_active = false;
            info!("Marked overlay allocation inactive: {runner_name}");
        }
    }

    pub fn mark_runner_active(&self, runner_name: &str) {
        let mut state = self.state.lock().expect("overlay lock poisoned");
        if let Some(alloc) = state.allocations.get_mut(runner_name) {
            alloc.is_active = true;
            alloc.last_used = Utc::now();
        }
    }

    /// Remove a runner's allocation and its tunnel. Containers on that
    /// runner lose overlay connectivity.
    pub async fn release_runner(&self, runner_name: &str) -> Result<(), OverlayError> {
        let removed = {
            let mut state = self.state.lock().expect("overlay lock poisoned");
            let alloc =
                state.allocations.remove(runner_name).ok_or_else(|| OverlayError::UnknownRunner(runner_name.into()))?;
            state.id_to_runner.remove(&alloc.runner_id);
            alloc
        };
        self.links.delete_link(&removed.vxlan_device).await?;
        info!("Released overlay allocation: {runner_name} (runner_id={})", removed.runner_id);
        Ok(())
    }

    pub fn get_allocation(&self, runner_name: &str) -> Option<OverlayAllocation> {
        self.state.lock().expect("overlay lock poisoned").allocations.get(runner_name).cloned()
    }

    pub fn list_allocations(&self) -> Vec<OverlayAllocation> {
        self.state.lock().expect("overlay lock poisoned").allocations.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::netlink::{MockLinkManager, VxlanLink};
    use mockall::predicate::eq;

    fn make_manager(links: MockLinkManager) -> OverlayNetworkManager {
        OverlayNetworkManager::new(OverlayManagerArgs {
            subnet: "10.0.0.0/16/8/8".parse().expect("bad subnet"),
            base_vxlan_id: 100,
            vxlan_port: 4789,
            mtu: 1450,
            host_physical_ip: "192.168.1.1".parse().unwrap(),
            links: Arc::new(links),
        })
    }

    fn expect_tunnel_creation(links: &mut MockLinkManager, runner_id: u32, remote: &str) {
        let remote: Ipv4Addr = remote.parse().unwrap();
        links.expect_list_vxlan_links().returning(|| Ok(vec![]));
        links
            .expect_create_vxlan()
            .withf(move |spec| {
                spec.vni == 100 + runner_id
                    && spec.remote == remote
                    && spec.name == subnet::vxlan_device_name(runner_id)
            })
            .once()
            .returning(|_| Ok(()));
        links.expect_add_to_trusted_zone().return_const(());
    }

    #[tokio::test]
    async fn allocate_new_runner_gets_smallest_id() {
        let mut links = MockLinkManager::new();
        expect_tunnel_creation(&mut links, 1, "192.168.1.5");
        let manager = make_manager(links);

        let alloc = manager.allocate_for_runner("node1", "192.168.1.5".parse().unwrap()).await.expect("failed");
        assert_eq!(alloc.runner_id, 1);
        assert_eq!(alloc.subnet, "10.0.1.0/24");
        assert_eq!(alloc.gateway, Ipv4Addr::new(10, 0, 1, 1));
        assert_eq!(alloc.vxlan_device, "vxkr1");
        assert!(alloc.is_active);
    }

    #[tokio::test]
    async fn allocate_same_runner_reuses_slot() {
        let mut links = MockLinkManager::new();
        expect_tunnel_creation(&mut links, 1, "192.168.1.5");
        let manager = make_manager(links);

        let ip = "192.168.1.5".parse().unwrap();
        let first = manager.allocate_for_runner("node1", ip).await.expect("failed");
        let second = manager.allocate_for_runner("node1", ip).await.expect("failed");
        assert_eq!(first.runner_id, second.runner_id);
    }

    #[tokio::test]
    async fn ip_change_recreates_tunnel() {
        let mut links = MockLinkManager::new();
        links.expect_list_vxlan_links().returning(|| Ok(vec![]));
        links.expect_create_vxlan().times(2).returning(|_| Ok(()));
        links.expect_delete_link().with(eq("vxkr1")).once().returning(|_| Ok(()));
        links.expect_add_to_trusted_zone().return_const(());
        let manager = make_manager(links);

        manager.allocate_for_runner("node1", "192.168.1.5".parse().unwrap()).await.ok();
        let alloc = manager.allocate_for_runner("node1", "192.168.1.6".parse().unwrap()).await.expect("failed");
        assert_eq!(alloc.physical_ip, "192.168.1.6".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn recovery_builds_placeholders_and_deletes_garbage() {
        let mut links = MockLinkManager::new();
        links.expect_enable_forwarding().returning(|| Ok(()));
        links.expect_ensure_dummy().returning(|_, _, _| Ok(()));
        links.expect_ensure_forward_rules().returning(|_| Ok(()));
        links.expect_list_vxlan_links().returning(|| {
            Ok(vec![
                VxlanLink { name: "vxkr1".into(), vni: 101, remote: Some("192.168.1.5".parse().unwrap()) },
                // Wrong VNI for its name.
                VxlanLink { name: "vxkr2".into(), vni: 999, remote: Some("192.168.1.6".parse().unwrap()) },
            ])
        });
        links.expect_delete_link().with(eq("vxkr2")).once().returning(|_| Ok(()));
        links.expect_add_to_trusted_zone().return_const(());
        let manager = make_manager(links);

        manager.initialize().await.expect("failed to initialize");
        let allocations = manager.list_allocations();
        assert_eq!(allocations.len(), 1);
        let placeholder = &allocations[0];
        assert_eq!(placeholder.runner_name, "runner_1");
        assert!(!placeholder.is_active);
    }

    #[tokio::test]
    async fn placeholder_remapped_on_reregistration() {
        let mut links = MockLinkManager::new();
        links.expect_enable_forwarding().returning(|| Ok(()));
        links.expect_ensure_dummy().returning(|_, _, _| Ok(()));
        links.expect_ensure_forward_rules().returning(|_| Ok(()));
        links.expect_list_vxlan_links().returning(|| {
            Ok(vec![VxlanLink { name: "vxkr3".into(), vni: 103, remote: Some("192.168.1.7".parse().unwrap()) }])
        });
        links.expect_add_to_trusted_zone().return_const(());
        let manager = make_manager(links);

        manager.initialize().await.expect("failed to initialize");
        // No create_vxlan expected: the existing tunnel is kept intact.
        let alloc = manager.allocate_for_runner("node3", "192.168.1.7".parse().unwrap()).await.expect("failed");
        assert_eq!(alloc.runner_id, 3);
        assert_eq!(alloc.runner_name, "node3");
        assert!(alloc.is_active);
        assert!(manager.get_allocation("runner_3").is_none());
    }

    #[tokio::test]
    async fn exhausted_pool_evicts_lru_inactive() {
        let subnet: OverlaySubnetConfig = "10.0.0.0/23/1/8".parse().expect("bad subnet");
        assert_eq!(subnet.max_runners(), 1);
        let mut links = MockLinkManager::new();
        links.expect_list_vxlan_links().returning(|| Ok(vec![]));
        links.expect_create_vxlan().returning(|_| Ok(()));
        links.expect_delete_link().returning(|_| Ok(()));
        links.expect_add_to_trusted_zone().return_const(());
        let manager = OverlayNetworkManager::new(OverlayManagerArgs {
            subnet,
            base_vxlan_id: 100,
            vxlan_port: 4789,
            mtu: 1450,
            host_physical_ip: "192.168.1.1".parse().unwrap(),
            links: Arc::new(links),
        });

        manager.allocate_for_runner("node1", "192.168.1.5".parse().unwrap()).await.expect("failed");

        // Pool full and everything active: exhausted.
        let err = manager.allocate_for_runner("node2", "192.168.1.6".parse().unwrap()).await.expect_err("allocated");
        assert!(matches!(err, OverlayError::Exhausted(1)));

        // Once node1 goes inactive its slot is reclaimed.
        manager.mark_runner_inactive("node1");
        let alloc = manager.allocate_for_runner("node2", "192.168.1.6".parse().unwrap()).await.expect("failed");
        assert_eq!(alloc.runner_id, 1);
        assert!(manager.get_allocation("node1").is_none());
    }
}
