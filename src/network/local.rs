//! Our own addresses
//!
//! Scored table of the addresses this node believes it is reachable on,
//! collected from bound interfaces, UPnP, manual configuration and peers
//! reporting what they see. Answers "which of our addresses should we tell
//! peer X about", and tracks networks the operator has restricted.

use crate::network::address::{canonical_ip, network_of, NetAddr, Network};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use tokio::sync::{watch, RwLock};

/// How an address was learned; higher is more trustworthy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LocalScore {
    None = 0,
    /// Address of a local interface
    If = 1,
    /// Address we explicitly bound to
    Bind = 2,
    /// External address reported by a UPnP gateway
    Upnp = 3,
    /// Configured by the operator
    Manual = 4,
}

/// Score and port of a local address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalService {
    pub score: i32,
    pub port: u16,
}

#[derive(Debug, Default)]
struct LocalInner {
    hosts: HashMap<IpAddr, LocalService>,
    limited: HashSet<Network>,
}

/// Table of this node's own addresses
#[derive(Debug)]
pub struct LocalAddressTable {
    inner: RwLock<LocalInner>,
    /// Bumped on every score or membership change
    changes: watch::Sender<u64>,
    /// Accept discovered (non-manual) addresses
    discover: bool,
}

impl LocalAddressTable {
    pub fn new(discover: bool) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: RwLock::new(LocalInner::default()),
            changes,
            discover,
        }
    }

    /// Receiver notified whenever the table changes
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn notify(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }

    /// Register one of our addresses
    ///
    /// Re-adding a known address never lowers its score. Returns whether the
    /// address was accepted.
    pub async fn add(&self, addr: SocketAddr, score: LocalScore) -> bool {
        let ip = canonical_ip(addr.ip());
        let network = network_of(&ip);
        if network == Network::Unroutable {
            return false;
        }
        if !self.discover && score < LocalScore::Manual {
            return false;
        }

        let changed = {
            let mut inner = self.inner.write().await;
            if inner.limited.contains(&network) {
                return false;
            }

            let score = score as i32;
            let changed = match inner.hosts.get_mut(&ip) {
                None => {
                    inner.hosts.insert(
                        ip,
                        LocalService {
                            score,
                            port: addr.port(),
                        },
                    );
                    true
                }
                Some(info) if score >= info.score => {
                    info.score = score + 1;
                    info.port = addr.port();
                    true
                }
                Some(_) => false,
            };
            changed
        };

        if changed {
            log::info!("Local address {} (score {})", addr, score as i32);
            self.notify();
        }
        true
    }

    /// Register interface addresses, listening on `port`
    ///
    /// Returns how many were accepted; private and loopback interfaces are not.
    pub async fn add_interfaces<I>(&self, ips: I, port: u16) -> usize
    where
        I: IntoIterator<Item = IpAddr>,
    {
        let mut added = 0;
        for ip in ips {
            if self.add(SocketAddr::new(ip, port), LocalScore::If).await {
                added += 1;
            }
        }
        added
    }

    /// A peer reported seeing us at `ip`; bump its score if we know it
    pub async fn seen(&self, ip: &IpAddr) -> bool {
        let bumped = {
            let mut inner = self.inner.write().await;
            match inner.hosts.get_mut(&canonical_ip(*ip)) {
                Some(info) => {
                    info.score += 1;
                    true
                }
                None => false,
            }
        };
        if bumped {
            self.notify();
        }
        bumped
    }

    /// Forget a local address
    pub async fn remove(&self, ip: &IpAddr) -> bool {
        let removed = self
            .inner
            .write()
            .await
            .hosts
            .remove(&canonical_ip(*ip))
            .is_some();
        if removed {
            self.notify();
        }
        removed
    }

    /// Whether `ip` is one of our own addresses
    pub async fn is_local(&self, ip: &IpAddr) -> bool {
        self.inner
            .read()
            .await
            .hosts
            .contains_key(&canonical_ip(*ip))
    }

    /// Best address to advertise to `peer`
    pub async fn best_for(&self, peer: Option<&NetAddr>) -> Option<SocketAddr> {
        let peer_net = peer.map(|p| p.network());
        let inner = self.inner.read().await;

        inner
            .hosts
            .iter()
            .map(|(ip, info)| {
                let reach = reachability(network_of(ip), peer_net);
                (reach, info.score, *ip, info.port)
            })
            .filter(|(reach, ..)| *reach > 0)
            .max_by_key(|(reach, score, ..)| (*reach, *score))
            .map(|(_, _, ip, port)| SocketAddr::new(ip, port))
    }

    /// Restrict or allow outbound connections on a network
    pub async fn set_limited(&self, network: Network, limited: bool) {
        if network == Network::Unroutable {
            return;
        }
        let mut inner = self.inner.write().await;
        if limited {
            inner.limited.insert(network);
        } else {
            inner.limited.remove(&network);
        }
    }

    pub async fn is_limited(&self, network: Network) -> bool {
        self.inner.read().await.limited.contains(&network)
    }

    /// Snapshot of all local addresses and their scores
    pub async fn entries(&self) -> Vec<(IpAddr, LocalService)> {
        let inner = self.inner.read().await;
        let mut entries: Vec<_> = inner.hosts.iter().map(|(ip, s)| (*ip, *s)).collect();
        entries.sort_by_key(|(ip, _)| *ip);
        entries
    }
}

impl Default for LocalAddressTable {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Address of the interface that routes to the public internet
///
/// Connecting a UDP socket sends nothing; it only selects the route.
pub fn interface_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    }
}

/// How well a peer on `peer` can reach us on `local`; 0 means not at all
fn reachability(local: Network, peer: Option<Network>) -> i32 {
    match (peer.unwrap_or(Network::Unroutable), local) {
        (_, Network::Unroutable) => 0,
        (Network::Ipv4, Network::Ipv4) => 4,
        (Network::Ipv4, Network::Ipv6) => 1,
        (Network::Ipv6, Network::Ipv6) => 5,
        (Network::Ipv6, Network::Ipv4) => 4,
        (Network::Unroutable, Network::Ipv4) => 4,
        (Network::Unroutable, Network::Ipv6) => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sock(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_readd_only_raises_score() {
        let table = LocalAddressTable::new(true);
        assert!(table.add(sock("8.8.8.8:8333"), LocalScore::Upnp).await);
        assert!(table.add(sock("8.8.8.8:8333"), LocalScore::If).await);

        let entries = table.entries().await;
        assert_eq!(entries[0].1.score, LocalScore::Upnp as i32);

        table.add(sock("8.8.8.8:8333"), LocalScore::Manual).await;
        let entries = table.entries().await;
        assert_eq!(entries[0].1.score, LocalScore::Manual as i32 + 1);
    }

    #[tokio::test]
    async fn test_changes_notify_subscribers() {
        let table = LocalAddressTable::new(true);
        let mut rx = table.subscribe();

        table.add(sock("8.8.8.8:8333"), LocalScore::Bind).await;
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        // lower score leaves the table untouched
        table.add(sock("8.8.8.8:8333"), LocalScore::If).await;
        assert!(!rx.has_changed().unwrap());

        assert!(table.seen(&"8.8.8.8".parse().unwrap()).await);
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_unroutable_and_limited_rejected() {
        let table = LocalAddressTable::new(true);
        assert!(!table.add(sock("192.168.1.2:8333"), LocalScore::Manual).await);

        table.set_limited(Network::Ipv6, true).await;
        assert!(!table.add(sock("[2a01:4f8::1]:8333"), LocalScore::Manual).await);
        assert!(table.is_limited(Network::Ipv6).await);
    }

    #[tokio::test]
    async fn test_interfaces_registered_when_routable() {
        let table = LocalAddressTable::new(true);
        let ips = ["8.8.8.8", "192.168.1.2", "127.0.0.1"].map(|ip| ip.parse().unwrap());

        assert_eq!(table.add_interfaces(ips, 9333).await, 1);
        let entries = table.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.score, LocalScore::If as i32);
        assert_eq!(entries[0].1.port, 9333);

        let off = LocalAddressTable::new(false);
        assert_eq!(off.add_interfaces(["8.8.8.8".parse().unwrap()], 9333).await, 0);
    }

    #[test]
    fn test_interface_address_not_loopback() {
        // no route in sandboxed environments
        if let Some(ip) = interface_ipv4() {
            assert!(!ip.is_loopback());
        }
    }

    #[tokio::test]
    async fn test_discovery_disabled_accepts_manual_only() {
        let table = LocalAddressTable::new(false);
        assert!(!table.add(sock("8.8.8.8:8333"), LocalScore::Upnp).await);
        assert!(table.add(sock("8.8.8.8:8333"), LocalScore::Manual).await);
        assert!(table.is_local(&"8.8.8.8".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn test_best_for_prefers_peer_network() {
        let table = LocalAddressTable::new(true);
        table.add(sock("8.8.8.8:8333"), LocalScore::Manual).await;
        table.add(sock("[2a01:4f8::1]:8333"), LocalScore::If).await;

        let v6_peer = NetAddr::from(sock("[2a00:1450::1]:8333"));
        let v4_peer = NetAddr::from(sock("1.1.1.1:8333"));

        assert_eq!(
            table.best_for(Some(&v6_peer)).await,
            Some(sock("[2a01:4f8::1]:8333"))
        );
        assert_eq!(table.best_for(Some(&v4_peer)).await, Some(sock("8.8.8.8:8333")));
    }
}
