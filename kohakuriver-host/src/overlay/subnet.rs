//! Overlay subnet layout.
//!
//! A single configuration string `BASE/TOTAL_PREFIX/NODE_BITS/SUBNET_BITS`
//! (bits must sum to 32) determines the whole address plan: each runner id
//! selects a subnet, the gateway is `.1` within it, the host sits at offset
//! 254, and the host's overlay-global IP is `base + 1`.
//!
//! The default `10.128.0.0/12/6/14` yields up to 63 runners with roughly
//! 16,380 container IPs each.

use serde::Deserialize;
use std::{fmt, net::Ipv4Addr, str::FromStr};
use thiserror::Error;

const BASE36_CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Prefix of every host-side VXLAN device. Interface names are limited to
/// 15 chars; `vxkr` plus a base36 id stays well under that.
pub const VXLAN_DEVICE_PREFIX: &str = "vxkr";

#[derive(Debug, Error, PartialEq)]
pub enum SubnetConfigError {
    #[error("invalid overlay subnet format '{0}', expected BASE/TOTAL_PREFIX/NODE_BITS/SUBNET_BITS")]
    Format(String),

    #[error("invalid base address '{0}'")]
    BaseAddress(String),

    #[error("total_prefix({0}) + node_bits({1}) + subnet_bits({2}) must equal 32")]
    BitSum(u8, u8, u8),

    #[error("total_prefix {0} out of range, must be 1..=24")]
    TotalPrefix(u8),

    #[error("node_bits {0} out of range, must be 1..=16")]
    NodeBits(u8),

    #[error("subnet_bits {0} too small, need at least 8 (256 IPs per runner)")]
    SubnetBits(u8),

    #[error("runner id {0} out of range 1..={1}")]
    RunnerId(u32, u32),
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "String")]
pub struct OverlaySubnetConfig {
    base: Ipv4Addr,
    total_prefix: u8,
    node_bits: u8,
    subnet_bits: u8,
}

impl FromStr for OverlaySubnetConfig {
    type Err = SubnetConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        let [base, total_prefix, node_bits, subnet_bits] = parts[..] else {
            return Err(SubnetConfigError::Format(s.into()));
        };
        let total_prefix: u8 = total_prefix.parse().map_err(|_| SubnetConfigError::Format(s.into()))?;
        let node_bits: u8 = node_bits.parse().map_err(|_| SubnetConfigError::Format(s.into()))?;
        let subnet_bits: u8 = subnet_bits.parse().map_err(|_| SubnetConfigError::Format(s.into()))?;
        if total_prefix as u32 + node_bits as u32 + subnet_bits as u32 != 32 {
            return Err(SubnetConfigError::BitSum(total_prefix, node_bits, subnet_bits));
        }
        if !(1..=24).contains(&total_prefix) {
            return Err(SubnetConfigError::TotalPrefix(total_prefix));
        }
        if !(1..=16).contains(&node_bits) {
            return Err(SubnetConfigError::NodeBits(node_bits));
        }
        if subnet_bits < 8 {
            return Err(SubnetConfigError::SubnetBits(subnet_bits));
        }
        let base: Ipv4Addr = base.parse().map_err(|_| SubnetConfigError::BaseAddress(base.into()))?;
        // Mask the base down to its network address.
        let mask = u32::MAX << (32 - total_prefix);
        let base = Ipv4Addr::from(u32::from(base) & mask);
        Ok(Self { base, total_prefix, node_bits, subnet_bits })
    }
}

impl TryFrom<String> for OverlaySubnetConfig {
    type Error = SubnetConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for OverlaySubnetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { base, total_prefix, node_bits, subnet_bits } = self;
        write!(f, "{base}/{total_prefix}/{node_bits}/{subnet_bits}")
    }
}

impl OverlaySubnetConfig {
    pub fn default_config() -> Self {
        "10.128.0.0/12/6/14".parse().expect("default overlay subnet config is invalid")
    }

    /// Highest allocatable runner id. Id 0 is never allocated.
    pub fn max_runners(&self) -> u32 {
        (1 << self.node_bits) - 1
    }

    /// Prefix length of each runner subnet.
    pub fn runner_prefix(&self) -> u8 {
        32 - self.subnet_bits
    }

    /// The whole overlay network in CIDR notation, for routing rules.
    pub fn overlay_cidr(&self) -> String {
        format!("{}/{}", self.base, self.total_prefix)
    }

    /// The host's overlay-global IP: `base + 1`.
    pub fn host_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.base) + 1)
    }

    pub fn host_prefix(&self) -> u8 {
        self.total_prefix
    }

    fn runner_base(&self, runner_id: u32) -> Result<u32, SubnetConfigError> {
        if runner_id < 1 || runner_id > self.max_runners() {
            return Err(SubnetConfigError::RunnerId(runner_id, self.max_runners()));
        }
        Ok(u32::from(self.base) + (runner_id << self.subnet_bits))
    }

    /// The subnet for a runner, in CIDR notation.
    pub fn runner_subnet(&self, runner_id: u32) -> Result<String, SubnetConfigError> {
        let base = self.runner_base(runner_id)?;
        Ok(format!("{}/{}", Ipv4Addr::from(base), self.runner_prefix()))
    }

    /// The gateway containers use: `.1` within the runner subnet.
    pub fn runner_gateway(&self, runner_id: u32) -> Result<Ipv4Addr, SubnetConfigError> {
        Ok(Ipv4Addr::from(self.runner_base(runner_id)? + 1))
    }

    /// The host's IP inside a runner subnet, at offset 254.
    pub fn host_ip_on_runner_subnet(&self, runner_id: u32) -> Result<Ipv4Addr, SubnetConfigError> {
        Ok(Ipv4Addr::from(self.runner_base(runner_id)? + 254))
    }

    /// The usable container range for a runner: offset 2 up to one before
    /// broadcast, skipping 254 at the top if the range ends there.
    pub fn container_ip_range(&self, runner_id: u32) -> Result<(Ipv4Addr, Ipv4Addr), SubnetConfigError> {
        let base = self.runner_base(runner_id)?;
        let size = 1u32 << self.subnet_bits;
        let first = base + 2;
        let mut last = base + size - 2;
        if last & 0xff == 254 {
            last -= 1;
        }
        Ok((Ipv4Addr::from(first), Ipv4Addr::from(last)))
    }

    /// Whether an address falls inside a runner's subnet.
    pub fn contains(&self, runner_id: u32, ip: Ipv4Addr) -> bool {
        match self.runner_base(runner_id) {
            Ok(base) => {
                let size = 1u32 << self.subnet_bits;
                (base..base + size).contains(&u32::from(ip))
            }
            Err(_) => false,
        }
    }
}

/// Encode a runner id as base36, as used in VXLAN device names.
pub fn encode_runner_id(runner_id: u32) -> String {
    if runner_id == 0 {
        return "0".into();
    }
    let mut digits = Vec::new();
    let mut n = runner_id;
    while n > 0 {
        digits.push(BASE36_CHARS[(n % 36) as usize]);
        n /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).expect("base36 digits are ascii")
}

/// Decode a base36 runner id. Returns `None` on empty or non-base36 input.
pub fn decode_runner_id(encoded: &str) -> Option<u32> {
    if encoded.is_empty() {
        return None;
    }
    let mut value: u32 = 0;
    for c in encoded.bytes() {
        let digit = match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'z' => c - b'a' + 10,
            _ => return None,
        };
        value = value.checked_mul(36)?.checked_add(digit as u32)?;
    }
    Some(value)
}

/// The VXLAN device name for a runner id, e.g. `vxkr1`, `vxkra` for id 10.
pub fn vxlan_device_name(runner_id: u32) -> String {
    format!("{VXLAN_DEVICE_PREFIX}{}", encode_runner_id(runner_id))
}

/// Parse a device name back into a runner id. Returns `None` when the name
/// does not follow the scheme or the id is outside `1..=max_runners`.
pub fn parse_vxlan_device_name(name: &str, config: &OverlaySubnetConfig) -> Option<u32> {
    let encoded = name.strip_prefix(VXLAN_DEVICE_PREFIX)?;
    let runner_id = decode_runner_id(encoded)?;
    if runner_id < 1 || runner_id > config.max_runners() { None } else { Some(runner_id) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn default_config() -> OverlaySubnetConfig {
        OverlaySubnetConfig::default_config()
    }

    #[test]
    fn default_layout() {
        let config = default_config();
        assert_eq!(config.max_runners(), 63);
        assert_eq!(config.runner_prefix(), 18);
        assert_eq!(config.host_ip(), Ipv4Addr::new(10, 128, 0, 1));
        assert_eq!(config.overlay_cidr(), "10.128.0.0/12");
        assert_eq!(config.runner_subnet(1).unwrap(), "10.128.64.0/18");
        assert_eq!(config.runner_gateway(1).unwrap(), Ipv4Addr::new(10, 128, 64, 1));
        assert_eq!(config.host_ip_on_runner_subnet(1).unwrap(), Ipv4Addr::new(10, 128, 64, 254));
    }

    #[test]
    fn wide_layout() {
        let config: OverlaySubnetConfig = "10.0.0.0/8/8/16".parse().expect("failed to parse");
        assert_eq!(config.max_runners(), 255);
        assert_eq!(config.runner_subnet(1).unwrap(), "10.1.0.0/16");
        assert_eq!(config.runner_gateway(2).unwrap(), Ipv4Addr::new(10, 2, 0, 1));
        assert_eq!(config.host_ip(), Ipv4Addr::new(10, 0, 0, 1));
    }

    #[rstest]
    #[case::three_parts("10.0.0.0/8/8")]
    #[case::not_numbers("10.0.0.0/8/x/16")]
    #[case::bad_ip("300.0.0.0/8/8/16")]
    fn parse_format_errors(#[case] input: &str) {
        input.parse::<OverlaySubnetConfig>().expect_err("parsing did not fail");
    }

    #[test]
    fn bits_must_sum_to_32() {
        let err = "10.0.0.0/8/8/15".parse::<OverlaySubnetConfig>().expect_err("parsing did not fail");
        assert_eq!(err, SubnetConfigError::BitSum(8, 8, 15));
    }

    #[test]
    fn small_subnet_bits_rejected() {
        let err = "10.0.0.0/17/8/7".parse::<OverlaySubnetConfig>().expect_err("parsing did not fail");
        assert_eq!(err, SubnetConfigError::SubnetBits(7));
    }

    #[test]
    fn runner_id_zero_rejected() {
        let config = default_config();
        config.runner_subnet(0).expect_err("runner id 0 accepted");
        config.runner_subnet(64).expect_err("runner id past max accepted");
    }

    #[test]
    fn container_range_excludes_edges() {
        let config: OverlaySubnetConfig = "10.0.0.0/16/8/8".parse().expect("failed to parse");
        let (first, last) = config.container_ip_range(1).expect("failed to compute range");
        assert_eq!(first, Ipv4Addr::new(10, 0, 1, 2));
        // .254 is the host IP, so the last usable address backs off to .253.
        assert_eq!(last, Ipv4Addr::new(10, 0, 1, 253));
    }

    #[test]
    fn base36_roundtrip() {
        let config = default_config();
        for id in 1..=config.max_runners() {
            let encoded = encode_runner_id(id);
            assert_eq!(decode_runner_id(&encoded), Some(id));
            assert!(vxlan_device_name(id).len() <= 15);
        }
    }

    #[rstest]
    #[case::simple("vxkr1", Some(1))]
    #[case::base36("vxkra", Some(10))]
    #[case::zero("vxkr0", None)]
    #[case::past_max("vxkr1z", None)]
    #[case::wrong_prefix("vxlan7", None)]
    #[case::garbage("vxkr!", None)]
    #[case::empty_suffix("vxkr", None)]
    fn device_name_parsing(#[case] name: &str, #[case] expected: Option<u32>) {
        assert_eq!(parse_vxlan_device_name(name, &default_config()), expected);
    }
}
