//! IP reservations for the overlay network.
//!
//! A reservation promises a container IP on a specific runner before the
//! task is submitted, so distributed jobs can know their master address up
//! front. Tokens are self-contained: `base64url(payload "." signature)`
//! where the signature is a truncated HMAC-SHA256 over the JSON payload
//! `{ip, runner, exp}`. Reservations live in memory only; expired entries
//! are swept lazily.

use crate::overlay::manager::OverlayNetworkManager;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::{
    collections::{HashMap, HashSet},
    net::Ipv4Addr,
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Hex characters kept from the HMAC digest.
const SIGNATURE_LEN: usize = 16;

#[derive(Debug, Error, PartialEq)]
pub enum ReservationError {
    #[error("runner '{0}' has no overlay allocation")]
    UnknownRunner(String),

    #[error("ip {0} is not available on runner '{1}'")]
    IpUnavailable(Ipv4Addr, String),

    #[error("no free IPs on runner '{0}'")]
    NoFreeIps(String),

    #[error("invalid reservation token")]
    TokenInvalid,

    #[error("reservation already consumed by another container")]
    AlreadyConsumed,

    #[error("reservation is in use and cannot be released")]
    InUse,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IpReservation {
    pub ip: Ipv4Addr,
    pub runner_name: String,
    pub runner_id: u32,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    /// Set once a container claims the IP.
    pub container_id: Option<String>,
}

impl IpReservation {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    fn is_used(&self) -> bool {
        self.container_id.is_some()
    }
}

#[derive(Serialize, Deserialize)]
struct TokenPayload {
    ip: Ipv4Addr,
    runner: String,
    exp: i64,
}

#[derive(Default)]
struct State {
    reservations: HashMap<Ipv4Addr, IpReservation>,
    token_to_ip: HashMap<String, Ipv4Addr>,
    /// IPs held by running containers, reserved or not.
    used_ips: HashMap<String, HashSet<Ipv4Addr>>,
}

pub struct IpReservationManager {
    overlay: Arc<OverlayNetworkManager>,
    secret: Vec<u8>,
    default_ttl: Duration,
    state: Mutex<State>,
}

impl IpReservationManager {
    pub fn new(overlay: Arc<OverlayNetworkManager>, secret: Vec<u8>, default_ttl: Duration) -> Self {
        Self { overlay, secret, default_ttl, state: Default::default() }
    }

    pub fn overlay(&self) -> &Arc<OverlayNetworkManager> {
        &self.overlay
    }

    fn sign(&self, payload_json: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(payload_json.as_bytes());
        let digest = hex::encode(mac.finalize().into_bytes());
        digest[..SIGNATURE_LEN].to_string()
    }

    fn generate_token(&self, ip: Ipv4Addr, runner: &str, expires_at: DateTime<Utc>) -> String {
        let payload = TokenPayload { ip, runner: runner.to_string(), exp: expires_at.timestamp() };
        let payload_json = serde_json::to_string(&payload).expect("token payload serializes");
        let signature = self.sign(&payload_json);
        URL_SAFE_NO_PAD.encode(format!("{payload_json}.{signature}"))
    }

    /// Decode and verify a token: signature must match and `exp` must be
    /// in the future.
    fn verify_token(&self, token: &str) -> Option<TokenPayload> {
        let decoded = URL_SAFE_NO_PAD.decode(token).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (payload_json, signature) = decoded.rsplit_once('.')?;
        if self.sign(payload_json) != signature {
            warn!("Reservation token signature verification failed");
            return None;
        }
        let payload: TokenPayload = serde_json::from_str(payload_json).ok()?;
        if payload.exp <= Utc::now().timestamp() {
            debug!("Reservation token expired for {}", payload.ip);
            return None;
        }
        Some(payload)
    }

    fn available_ips_locked(&self, state: &State, runner_name: &str) -> Result<Vec<Ipv4Addr>, ReservationError> {
        let allocation = self
            .overlay
            .get_allocation(runner_name)
            .ok_or_else(|| ReservationError::UnknownRunner(runner_name.into()))?;
        let subnet = self.overlay.subnet_config();
        let (first, last) = subnet
            .container_ip_range(allocation.runner_id)
            .map_err(|_| ReservationError::UnknownRunner(runner_name.into()))?;
        let host_ip = subnet
            .host_ip_on_runner_subnet(allocation.runner_id)
            .map_err(|_| ReservationError::UnknownRunner(runner_name.into()))?;
        let now = Utc::now();
        let reserved: HashSet<Ipv4Addr> = state
            .reservations
            .values()
            .filter(|r| r.runner_name == runner_name && !r.is_expired(now))
            .map(|r| r.ip)
            .collect();
        let used = state.used_ips.get(runner_name);
        let mut available = Vec::new();
        for raw in u32::from(first)..=u32::from(last) {
            let ip = Ipv4Addr::from(raw);
            if ip == host_ip || reserved.contains(&ip) || used.is_some_and(|s| s.contains(&ip)) {
                continue;
            }
            available.push(ip);
        }
        Ok(available)
    }

    /// List IPs currently free to reserve on a runner.
    pub fn available_ips(&self, runner_name: &str, limit: usize) -> Result<Vec<Ipv4Addr>, ReservationError> {
        let mut state = self.state.lock().expect("reservation lock poisoned");
        Self::sweep_expired_locked(&mut state);
        let mut ips = self.available_ips_locked(&state, runner_name)?;
        ips.truncate(limit);
        Ok(ips)
    }

    /// Reserve an IP on a runner. A pinned `ip` must be currently
    /// available; otherwise a random free address is picked.
    pub fn reserve(
        &self,
        runner_name: &str,
        ip: Option<Ipv4Addr>,
        ttl: Option<Duration>,
    ) -> Result<IpReservation, ReservationError> {
        let mut state = self.state.lock().expect("reservation lock poisoned");
        Self::sweep_expired_locked(&mut state);

        let allocation = self
            .overlay
            .get_allocation(runner_name)
            .ok_or_else(|| ReservationError::UnknownRunner(runner_name.into()))?;
        let available = self.available_ips_locked(&state, runner_name)?;
        let ip = match ip {
            Some(ip) => {
                if !available.contains(&ip) {
                    return Err(ReservationError::IpUnavailable(ip, runner_name.into()));
                }
                ip
            }
            None => *available.choose(&mut rand::rng()).ok_or_else(|| ReservationError::NoFreeIps(runner_name.into()))?,
        };

        let ttl = ttl.unwrap_or(self.default_ttl);
        let expires_at = Utc::now() + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::seconds(300));
        let token = self.generate_token(ip, runner_name, expires_at);
        let reservation = IpReservation {
            ip,
            runner_name: runner_name.to_string(),
            runner_id: allocation.runner_id,
            token: token.clone(),
            expires_at,
            container_id: None,
        };
        state.reservations.insert(ip, reservation.clone());
        state.token_to_ip.insert(token, ip);
        info!("Reserved IP {ip} on runner '{runner_name}' (expires at {expires_at})");
        Ok(reservation)
    }

    /// Consume a reservation for a container. Idempotent for the same
    /// container; a second container is rejected.
    pub fn consume(
        &self,
        token: &str,
        container_id: &str,
        expected_runner: Option<&str>,
    ) -> Result<Ipv4Addr, ReservationError> {
        let payload = self.verify_token(token).ok_or(ReservationError::TokenInvalid)?;
        let mut state = self.state.lock().expect("reservation lock poisoned");
        let ip = *state.token_to_ip.get(token).ok_or(ReservationError::TokenInvalid)?;
        let runner_name = {
            let reservation = state.reservations.get_mut(&ip).ok_or(ReservationError::TokenInvalid)?;
            if let Some(expected) = expected_runner {
                if reservation.runner_name != expected || payload.runner != expected {
                    warn!("Token runner mismatch: expected '{expected}', got '{}'", reservation.runner_name);
                    return Err(ReservationError::TokenInvalid);
                }
            }
            match &reservation.container_id {
                Some(existing) if existing == container_id => return Ok(ip),
                Some(_) => return Err(ReservationError::AlreadyConsumed),
                None => reservation.container_id = Some(container_id.to_string()),
            }
            reservation.runner_name.clone()
        };
        state.used_ips.entry(runner_name.clone()).or_default().insert(ip);
        info!("Reservation {ip} on '{runner_name}' now used by container {container_id}");
        Ok(ip)
    }

    /// Release an unconsumed reservation by its token.
    pub fn release_by_token(&self, token: &str) -> Result<(), ReservationError> {
        let mut state = self.state.lock().expect("reservation lock poisoned");
        let ip = *state.token_to_ip.get(token).ok_or(ReservationError::TokenInvalid)?;
        let reservation = state.reservations.get(&ip).ok_or(ReservationError::TokenInvalid)?;
        if reservation.is_used() {
            return Err(ReservationError::InUse);
        }
        state.reservations.remove(&ip);
        state.token_to_ip.remove(token);
        info!("Released reservation for {ip}");
        Ok(())
    }

    /// Release everything a container held. Called when the container
    /// exits. Returns the freed IPs.
    pub fn release_by_container(&self, container_id: &str) -> Vec<Ipv4Addr> {
        let mut state = self.state.lock().expect("reservation lock poisoned");
        let ips: Vec<Ipv4Addr> = state
            .reservations
            .values()
            .filter(|r| r.container_id.as_deref() == Some(container_id))
            .map(|r| r.ip)
            .collect();
        for ip in &ips {
            if let Some(reservation) = state.reservations.remove(ip) {
                state.token_to_ip.remove(&reservation.token);
                if let Some(used) = state.used_ips.get_mut(&reservation.runner_name) {
                    used.remove(ip);
                }
                info!("Released IP {ip} from container {container_id}");
            }
        }
        ips
    }

    /// Track an IP a container obtained without a reservation.
    pub fn mark_ip_used(&self, runner_name: &str, ip: Ipv4Addr) {
        let mut state = self.state.lock().expect("reservation lock poisoned");
        state.used_ips.entry(runner_name.to_string()).or_default().insert(ip);
    }

    pub fn mark_ip_free(&self, runner_name: &str, ip: Ipv4Addr) {
        let mut state = self.state.lock().expect("reservation lock poisoned");
        if let Some(used) = state.used_ips.get_mut(runner_name) {
            used.remove(&ip);
        }
        if let Some(reservation) = state.reservations.remove(&ip) {
            state.token_to_ip.remove(&reservation.token);
        }
    }

    fn sweep_expired_locked(state: &mut State) {
        let now = Utc::now();
        let expired: Vec<Ipv4Addr> = state
            .reservations
            .values()
            .filter(|r| r.is_expired(now) && !r.is_used())
            .map(|r| r.ip)
            .collect();
        for ip in expired {
            if let Some(reservation) = state.reservations.remove(&ip) {
                state.token_to_ip.remove(&reservation.token);
                debug!("Swept expired reservation for {ip}");
            }
        }
    }

    pub fn list(&self, runner_name: Option<&str>) -> Vec<IpReservation> {
        let mut state = self.state.lock().expect("reservation lock poisoned");
        Self::sweep_expired_locked(&mut state);
        state
            .reservations
            .values()
            .filter(|r| runner_name.is_none_or(|name| r.runner_name == name))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::{
        manager::{OverlayManagerArgs, OverlayNetworkManager},
        netlink::MockLinkManager,
    };

    async fn make_manager() -> IpReservationManager {
        let mut links = MockLinkManager::new();
        links.expect_list_vxlan_links().returning(|| Ok(vec![]));
        links.expect_create_vxlan().returning(|_| Ok(()));
        links.expect_add_to_trusted_zone().return_const(());
        let overlay = Arc::new(OverlayNetworkManager::new(OverlayManagerArgs {
            subnet: "10.0.0.0/16/8/8".parse().expect("bad subnet"),
            base_vxlan_id: 100,
            vxlan_port: 4789,
            mtu: 1450,
            host_physical_ip: "192.168.1.1".parse().unwrap(),
            links: Arc::new(links),
        }));
        overlay.allocate_for_runner("node1", "192.168.1.5".parse().unwrap()).await.expect("allocation failed");
        IpReservationManager::new(overlay, b"test-secret".to_vec(), Duration::from_secs(300))
    }

    #[tokio::test]
    async fn reserve_two_distinct_ips() {
        let manager = make_manager().await;
        let first = manager.reserve("node1", None, None).expect("reserve failed");
        let second = manager.reserve("node1", None, None).expect("reserve failed");
        assert_ne!(first.ip, second.ip);
    }

    #[tokio::test]
    async fn reserve_pinned_ip() {
        let manager = make_manager().await;
        let ip: Ipv4Addr = "10.0.1.5".parse().unwrap();
        let reservation = manager.reserve("node1", Some(ip), None).expect("reserve failed");
        assert_eq!(reservation.ip, ip);

        // The same IP cannot be double-reserved.
        let err = manager.reserve("node1", Some(ip), None).expect_err("reserved twice");
        assert_eq!(err, ReservationError::IpUnavailable(ip, "node1".into()));
    }

    #[tokio::test]
    async fn unknown_runner_rejected() {
        let manager = make_manager().await;
        let err = manager.reserve("nodeX", None, None).expect_err("reserved on unknown runner");
        assert_eq!(err, ReservationError::UnknownRunner("nodeX".into()));
    }

    #[tokio::test]
    async fn consume_is_idempotent_per_container() {
        let manager = make_manager().await;
        let reservation = manager.reserve("node1", None, None).expect("reserve failed");

        let ip = manager.consume(&reservation.token, "container-a", Some("node1")).expect("consume failed");
        assert_eq!(ip, reservation.ip);

        // Same container may consume again.
        let again = manager.consume(&reservation.token, "container-a", Some("node1")).expect("consume failed");
        assert_eq!(again, reservation.ip);

        // A different container is rejected.
        let err = manager.consume(&reservation.token, "container-b", Some("node1")).expect_err("consumed twice");
        assert_eq!(err, ReservationError::AlreadyConsumed);
    }

    #[tokio::test]
    async fn consume_checks_runner() {
        let manager = make_manager().await;
        let reservation = manager.reserve("node1", None, None).expect("reserve failed");
        let err = manager.consume(&reservation.token, "c", Some("node2")).expect_err("consumed on wrong runner");
        assert_eq!(err, ReservationError::TokenInvalid);
    }

    #[tokio::test]
    async fn tampered_token_rejected() {
        let manager = make_manager().await;
        let reservation = manager.reserve("node1", None, None).expect("reserve failed");
        let mut tampered = reservation.token.clone();
        tampered.replace_range(0..2, "zz");
        let err = manager.consume(&tampered, "c", None).expect_err("tampered token accepted");
        assert_eq!(err, ReservationError::TokenInvalid);
    }

    #[tokio::test]
    async fn expired_token_rejected() {
        let manager = make_manager().await;
        let reservation = manager.reserve("node1", None, Some(Duration::ZERO)).expect("reserve failed");
        let err = manager.consume(&reservation.token, "c", None).expect_err("expired token accepted");
        assert_eq!(err, ReservationError::TokenInvalid);
    }

    #[tokio::test]
    async fn release_frees_ip_for_new_reservation() {
        let manager = make_manager().await;
        let ip: Ipv4Addr = "10.0.1.9".parse().unwrap();
        let reservation = manager.reserve("node1", Some(ip), None).expect("reserve failed");
        manager.release_by_token(&reservation.token).expect("release failed");
        manager.reserve("node1", Some(ip), None).expect("reserve after release failed");
    }

    #[tokio::test]
    async fn consumed_reservation_released_by_container_exit() {
        let manager = make_manager().await;
        let reservation = manager.reserve("node1", None, None).expect("reserve failed");
        manager.consume(&reservation.token, "container-a", None).expect("consume failed");

        // In use: cannot release by token.
        let err = manager.release_by_token(&reservation.token).expect_err("released while in use");
        assert_eq!(err, ReservationError::InUse);

        let released = manager.release_by_container("container-a");
        assert_eq!(released, vec![reservation.ip]);

        // A verified token whose reservation is gone is refused. No "valid
        // token but unknown to host" state survives.
        let err = manager.consume(&reservation.token, "container-a", None).expect_err("consumed after release");
        assert_eq!(err, ReservationError::TokenInvalid);
    }
}
