//! Network layer: interface placement and in-namespace configuration
//!
//! Two sides cooperate when a task gets a new network namespace: the
//! intermediate process creates or moves interfaces into the namespace
//! from the host side (it knows the grandchild's PID), and the grandchild
//! brings its links up and assigns addresses from the inside.

pub mod link;

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

pub use link::NetLink;

/// Host interface moved into the task's namespace as-is
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostNetCfg {
    pub dev: String,
}

/// macvlan on top of a host master interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacVlanNetCfg {
    pub master: String,
    pub name: String,
    /// "private", "vepa", "bridge" or "passthru"
    pub mode: String,
    /// Hardware address; generated from hostname and interface name when
    /// empty
    pub hw: String,
    pub mtu: i32,
}

/// ipvlan on top of a host master interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpVlanNetCfg {
    pub master: String,
    pub name: String,
    /// "l2", "l3" or "l3s"
    pub mode: String,
    pub mtu: i32,
}

/// veth pair bridged on the host side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VethNetCfg {
    pub bridge: String,
    /// Endpoint placed into the task's namespace
    pub name: String,
    pub hw: String,
    /// Host endpoint enslaved to the bridge
    pub peer: String,
    pub mtu: i32,
}

/// Address assignment applied inside the task's namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpVec {
    pub iface: String,
    pub addr: IpAddr,
    pub prefix: u8,
}

/// Default gateway applied inside the task's namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GwVec {
    pub iface: String,
    pub addr: IpAddr,
}

/// Everything the launcher needs to know about a task's network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetCfg {
    /// Create a fresh network namespace for the task
    pub new_net_ns: bool,
    /// Reuse the parent's namespace instead of constructing one
    pub inherited: bool,
    /// Share the host namespace
    pub host: bool,
    pub host_iface: Vec<HostNetCfg>,
    pub mac_vlan: Vec<MacVlanNetCfg>,
    pub ip_vlan: Vec<IpVlanNetCfg>,
    pub veth: Vec<VethNetCfg>,
}

impl Default for NetCfg {
    fn default() -> Self {
        // default is a new empty netns
        Self {
            new_net_ns: true,
            inherited: false,
            host: false,
            host_iface: Vec::new(),
            mac_vlan: Vec::new(),
            ip_vlan: Vec::new(),
            veth: Vec::new(),
        }
    }
}

impl NetCfg {
    pub fn host() -> Self {
        Self {
            new_net_ns: false,
            host: true,
            ..Default::default()
        }
    }
}

/// Deterministic locally-administered MAC for a (hostname, interface)
/// pair: `02:NN:HH:HH:HH:HH` with `NN` the low byte of the interface
/// name's CRC32 and `HH...` the hostname's CRC32 big-endian.
pub fn generate_hw(host: &str, name: &str) -> String {
    let n = crc32fast::hash(name.as_bytes());
    let h = crc32fast::hash(host.as_bytes());

    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        n & 0xff,
        (h >> 24) & 0xff,
        (h >> 16) & 0xff,
        (h >> 8) & 0xff,
        h & 0xff,
    )
}

/// Parse a colon-separated hardware address into bytes
pub fn parse_hw(hw: &str) -> Option<Vec<u8>> {
    let bytes: Vec<u8> = hw
        .split(':')
        .map(|part| u8::from_str_radix(part, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    (bytes.len() == 6).then_some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_netcfg_is_empty_new_netns() {
        let cfg = NetCfg::default();
        assert!(cfg.new_net_ns);
        assert!(!cfg.host);
        assert!(cfg.veth.is_empty());
    }

    #[test]
    fn test_host_netcfg_shares_namespace() {
        let cfg = NetCfg::host();
        assert!(!cfg.new_net_ns);
        assert!(cfg.host);
    }

    #[test]
    fn test_generate_hw_is_deterministic() {
        let a = generate_hw("node-1", "eth0veth0");
        let b = generate_hw("node-1", "eth0veth0");
        assert_eq!(a, b);
        assert!(a.starts_with("02:"));
        assert_eq!(a.len(), 17);
    }

    #[test]
    fn test_generate_hw_differs_per_pair() {
        assert_ne!(generate_hw("node-1", "a"), generate_hw("node-1", "b"));
        assert_ne!(generate_hw("node-1", "a"), generate_hw("node-2", "a"));
    }

    #[test]
    fn test_generate_hw_encodes_crc_bytes() {
        let host = "h";
        let name = "n";
        let n = crc32fast::hash(name.as_bytes());
        let h = crc32fast::hash(host.as_bytes());
        let expected = format!(
            "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            n & 0xff,
            (h >> 24) & 0xff,
            (h >> 16) & 0xff,
            (h >> 8) & 0xff,
            h & 0xff,
        );
        assert_eq!(generate_hw(host, name), expected);
    }

    #[test]
    fn test_parse_hw_round_trip() {
        let hw = generate_hw("node", "if");
        let bytes = parse_hw(&hw).unwrap();
        assert_eq!(bytes.len(), 6);
        assert_eq!(bytes[0], 0x02);
    }

    #[test]
    fn test_parse_hw_rejects_garbage() {
        assert!(parse_hw("not-a-mac").is_none());
        assert!(parse_hw("02:00:00:00:00").is_none());
        assert!(parse_hw("02:00:00:00:00:zz").is_none());
    }
}
