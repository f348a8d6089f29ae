//! Network addresses and address classification
//!
//! Classifies peer addresses the way the connection manager needs them:
//! - Validity and locality checks
//! - Routability (private and reserved ranges are never relayed or dialed)
//! - Network groups, the coarse prefix bucket used to keep outbound peers diverse

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

// =============================================================================
// Service Flags
// =============================================================================

bitflags! {
    /// Services advertised by a node in its version message
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ServiceFlags: u64 {
        /// Node stores and serves the full block chain
        const NODE_NETWORK = 1;
        /// Node takes part in stake-based block production
        const NODE_STAKING = 1 << 1;
    }
}

impl Default for ServiceFlags {
    fn default() -> Self {
        ServiceFlags::NODE_NETWORK
    }
}

// =============================================================================
// Networks
// =============================================================================

/// Transport network an address belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Unroutable,
    Ipv4,
    Ipv6,
}

impl Network {
    /// All networks an operator can restrict
    pub const ALL: [Network; 2] = [Network::Ipv4, Network::Ipv6];
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Unroutable => "unroutable",
            Network::Ipv4 => "ipv4",
            Network::Ipv6 => "ipv6",
        };
        f.write_str(name)
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ipv4" => Ok(Network::Ipv4),
            "ipv6" => Ok(Network::Ipv6),
            other => Err(format!("unknown network '{}'", other)),
        }
    }
}

// =============================================================================
// Network Groups
// =============================================================================

const GROUP_UNROUTABLE: u8 = 0;
const GROUP_IPV4: u8 = 1;
const GROUP_IPV6: u8 = 2;
const GROUP_LOCAL: u8 = 255;

/// Coarse address-prefix bucket (/16 for IPv4, /32 for most of IPv6)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetGroup(Vec<u8>);

impl fmt::Display for NetGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

fn ipv4_group(ip: Ipv4Addr) -> NetGroup {
    let o = ip.octets();
    NetGroup(vec![GROUP_IPV4, o[0], o[1]])
}

/// Compute the network group of an IP address
///
/// Tunnelled IPv4 (6to4, Teredo, IPv4-mapped) is grouped by the embedded IPv4
/// address so the same host cannot appear in two groups.
pub fn net_group(ip: &IpAddr) -> NetGroup {
    let ip = canonical_ip(*ip);

    if is_local_ip(&ip) {
        return NetGroup(vec![GROUP_LOCAL]);
    }
    if !is_routable_ip(&ip) {
        return NetGroup(vec![GROUP_UNROUTABLE]);
    }

    match ip {
        IpAddr::V4(v4) => ipv4_group(v4),
        IpAddr::V6(v6) => {
            let o = v6.octets();

            // 6to4 (RFC3964)
            if o[0] == 0x20 && o[1] == 0x02 {
                return ipv4_group(Ipv4Addr::new(o[2], o[3], o[4], o[5]));
            }

            // Teredo (RFC4380), client address stored inverted
            if o[..4] == [0x20, 0x01, 0x00, 0x00] {
                return ipv4_group(Ipv4Addr::new(
                    o[12] ^ 0xff,
                    o[13] ^ 0xff,
                    o[14] ^ 0xff,
                    o[15] ^ 0xff,
                ));
            }

            let mut group = vec![GROUP_IPV6];
            group.extend_from_slice(&o[..4]);

            // Hurricane Electric hands out /36s from 2001:470::/32
            if o[..4] == [0x20, 0x01, 0x04, 0x70] {
                group.push(o[4] & 0xf0);
            }

            NetGroup(group)
        }
    }
}

// =============================================================================
// IP Classification
// =============================================================================

/// Unwrap IPv4-mapped IPv6 addresses into plain IPv4
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

/// Loopback or "this network" addresses
pub fn is_local_ip(ip: &IpAddr) -> bool {
    match canonical_ip(*ip) {
        IpAddr::V4(v4) => v4.octets()[0] == 127 || v4.octets()[0] == 0,
        IpAddr::V6(v6) => v6 == Ipv6Addr::LOCALHOST,
    }
}

/// Address that can ever name a peer
pub fn is_valid_ip(ip: &IpAddr) -> bool {
    match canonical_ip(*ip) {
        IpAddr::V4(v4) => !v4.is_unspecified() && !v4.is_broadcast(),
        IpAddr::V6(v6) => {
            let s = v6.segments();
            // documentation prefix 2001:db8::/32
            !v6.is_unspecified() && !(s[0] == 0x2001 && s[1] == 0x0db8)
        }
    }
}

fn is_reserved_v4(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    ip.is_private()                                  // RFC1918
        || ip.is_link_local()                        // RFC3927
        || (o[0] == 100 && (o[1] & 0xc0) == 64)      // RFC6598
        || (o[0] == 198 && (o[1] & 0xfe) == 18)      // RFC2544
        || ip.is_documentation()                     // RFC5737
        || o[0] >= 240
}

fn is_reserved_v6(ip: Ipv6Addr) -> bool {
    let s = ip.segments();
    (s[0] & 0xfe00) == 0xfc00                         // RFC4193
        || (s[0] == 0xfe80 && s[1] == 0 && s[2] == 0 && s[3] == 0) // RFC4862
        || (s[0] == 0x2001 && (s[1] & 0xfff0) == 0x0010) // RFC4843
}

/// Address a remote node could reach over the public internet
pub fn is_routable_ip(ip: &IpAddr) -> bool {
    if !is_valid_ip(ip) || is_local_ip(ip) {
        return false;
    }
    match canonical_ip(*ip) {
        IpAddr::V4(v4) => !is_reserved_v4(v4),
        IpAddr::V6(v6) => !is_reserved_v6(v6),
    }
}

/// Network of an IP address
pub fn network_of(ip: &IpAddr) -> Network {
    if !is_routable_ip(ip) {
        return Network::Unroutable;
    }
    match canonical_ip(*ip) {
        IpAddr::V4(_) => Network::Ipv4,
        IpAddr::V6(_) => Network::Ipv6,
    }
}

/// Append `port` to a destination that does not carry one
///
/// Accepts "host", "host:port", bare IP literals and "[v6]:port".
pub fn with_default_port(dest: &str, port: u16) -> String {
    if dest.parse::<SocketAddr>().is_ok() {
        return dest.to_string();
    }
    if let Ok(ip) = dest.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        return SocketAddr::new(ip, port).to_string();
    }
    match dest.rsplit_once(':') {
        Some((_, p)) if p.parse::<u16>().is_ok() => dest.to_string(),
        _ => format!("{}:{}", dest, port),
    }
}

// =============================================================================
// Network Address
// =============================================================================

/// A peer address as gossiped and stored in the address book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetAddr {
    /// IP and port
    pub addr: SocketAddr,
    /// Advertised services
    pub services: ServiceFlags,
    /// Last time the address was seen alive (unix seconds)
    pub timestamp: i64,
}

impl NetAddr {
    /// Create an address stamped with the current time
    pub fn new(addr: SocketAddr, services: ServiceFlags) -> Self {
        Self {
            addr: SocketAddr::new(canonical_ip(addr.ip()), addr.port()),
            services,
            timestamp: crate::network::unix_time(),
        }
    }

    /// Parse from "ip:port" notation
    pub fn from_addr_str(s: &str, services: ServiceFlags) -> Option<Self> {
        s.parse::<SocketAddr>()
            .ok()
            .map(|addr| Self::new(addr, services))
    }

    /// "ip:port" form used as the address book key
    pub fn to_addr_string(&self) -> String {
        self.addr.to_string()
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn network(&self) -> Network {
        network_of(&self.addr.ip())
    }

    pub fn group(&self) -> NetGroup {
        net_group(&self.addr.ip())
    }

    pub fn is_valid(&self) -> bool {
        is_valid_ip(&self.addr.ip()) && self.addr.port() != 0
    }

    pub fn is_local(&self) -> bool {
        is_local_ip(&self.addr.ip())
    }

    pub fn is_routable(&self) -> bool {
        is_routable_ip(&self.addr.ip())
    }
}

impl From<SocketAddr> for NetAddr {
    fn from(addr: SocketAddr) -> Self {
        NetAddr::new(addr, ServiceFlags::NODE_NETWORK)
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_ipv4_same_slash16_shares_group() {
        assert_eq!(net_group(&ip("8.8.1.1")), net_group(&ip("8.8.200.3")));
        assert_ne!(net_group(&ip("8.8.1.1")), net_group(&ip("8.9.1.1")));
    }

    #[test]
    fn test_mapped_and_tunnelled_ipv4_use_embedded_group() {
        assert_eq!(net_group(&ip("::ffff:8.8.4.4")), net_group(&ip("8.8.1.1")));
        // 6to4 for 8.8.4.4
        assert_eq!(net_group(&ip("2002:0808:0404::1")), net_group(&ip("8.8.1.1")));
        // Teredo, client 8.8.4.4 stored inverted
        assert_eq!(
            net_group(&ip("2001:0:4136:e378:8000:63bf:f7f7:fbfb")),
            net_group(&ip("8.8.1.1"))
        );
    }

    #[test]
    fn test_ipv6_groups() {
        assert_eq!(
            net_group(&ip("2a01:4f8:1:2::1")),
            net_group(&ip("2a01:4f8:ffff::1"))
        );
        assert_ne!(
            net_group(&ip("2001:470:1000::1")),
            net_group(&ip("2001:470:2000::1"))
        );
    }

    #[test]
    fn test_local_and_unroutable() {
        assert!(is_local_ip(&ip("127.0.0.1")));
        assert!(is_local_ip(&ip("::1")));
        assert!(!is_routable_ip(&ip("10.1.2.3")));
        assert!(!is_routable_ip(&ip("192.168.1.1")));
        assert!(!is_routable_ip(&ip("100.64.0.1")));
        assert!(!is_routable_ip(&ip("fd00::1")));
        assert!(!is_routable_ip(&ip("fe80::1")));
        assert!(is_routable_ip(&ip("8.8.8.8")));
        assert!(is_routable_ip(&ip("2a01:4f8::1")));
        assert_eq!(network_of(&ip("10.0.0.1")), Network::Unroutable);
        assert_eq!(network_of(&ip("::ffff:1.2.3.4")), Network::Ipv4);
    }

    #[test]
    fn test_validity() {
        assert!(!is_valid_ip(&ip("0.0.0.0")));
        assert!(!is_valid_ip(&ip("255.255.255.255")));
        assert!(!is_valid_ip(&ip("2001:db8::1")));

        let addr = NetAddr::from_addr_str("1.2.3.4:0", ServiceFlags::NODE_NETWORK).unwrap();
        assert!(!addr.is_valid());
    }

    #[test]
    fn test_with_default_port() {
        assert_eq!(with_default_port("seed.example.org", 8333), "seed.example.org:8333");
        assert_eq!(with_default_port("seed.example.org:9000", 8333), "seed.example.org:9000");
        assert_eq!(with_default_port("1.2.3.4", 8333), "1.2.3.4:8333");
        assert_eq!(with_default_port("2a01:4f8::1", 8333), "[2a01:4f8::1]:8333");
        assert_eq!(with_default_port("[2a01:4f8::1]:9", 8333), "[2a01:4f8::1]:9");
    }

    #[test]
    fn test_network_parse() {
        assert_eq!("IPv4".parse::<Network>().unwrap(), Network::Ipv4);
        assert!("onion".parse::<Network>().is_err());
    }
}
