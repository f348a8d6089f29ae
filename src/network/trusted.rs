//! Connections to operator-configured and certified nodes
//!
//! Every pass resolves the add-node list and asks the certified registry for
//! its current members, drops the candidates we are already connected to,
//! and dials the rest, each with its own outbound slot. An add-node entry
//! that resolves to several addresses is satisfied by any one of them; the
//! address tried rotates between passes.

use crate::network::address::{with_default_port, NetAddr, ServiceFlags};
use crate::network::outbound::{acquire_slot, CONNECT_PACING};
use crate::network::peerset::PeerSet;
use crate::network::{sleep_or_shutdown, unix_time};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

/// Keeps trusted nodes connected
pub struct TrustedConnector {
    peers: Arc<PeerSet>,
    slots: Arc<Semaphore>,
    pacing: Duration,
    interval: Duration,
    round: usize,
}

impl TrustedConnector {
    pub fn new(peers: Arc<PeerSet>, slots: Arc<Semaphore>) -> Self {
        let interval = Duration::from_secs(peers.config().trusted_interval);
        Self {
            peers,
            slots,
            pacing: CONNECT_PACING,
            interval,
            round: 0,
        }
    }

    /// Override the pause between attempts
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        log::info!("Trusted connector started");
        loop {
            let done = if self.peers.config().name_proxy {
                self.pass_by_name(&mut shutdown).await
            } else {
                self.pass(&mut shutdown).await
            };
            if done || sleep_or_shutdown(&mut shutdown, self.interval).await {
                break;
            }
        }
        log::info!("Trusted connector stopped");
    }

    /// Resolve add-nodes and collect certified nodes
    ///
    /// Resolved add-node addresses join the always-admit set.
    pub async fn candidates(&self) -> Vec<Vec<SocketAddr>> {
        let config = self.peers.config();
        let mut groups = Vec::new();

        for node in &config.add_nodes {
            let target = with_default_port(node, config.default_port);
            let resolved: Vec<SocketAddr> = match target.parse::<SocketAddr>() {
                Ok(sock) => vec![sock],
                Err(_) if config.name_lookup => match tokio::net::lookup_host(target.as_str()).await {
                    Ok(addrs) => addrs.collect(),
                    Err(e) => {
                        log::warn!("Failed to resolve added node {}: {}", node, e);
                        Vec::new()
                    }
                },
                Err(_) => {
                    log::warn!("Added node {} needs a name lookup", node);
                    Vec::new()
                }
            };
            for sock in &resolved {
                self.peers.add_always_admit(sock.ip()).await;
            }
            if !resolved.is_empty() {
                groups.push(resolved);
            }
        }

        for sock in self.peers.registry().list_certified().await {
            groups.push(vec![sock]);
        }
        groups
    }

    /// One pass over the candidates; returns true if shutdown started
    pub async fn pass(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut groups = self.candidates().await;

        let connected: Vec<SocketAddr> = self
            .peers
            .snapshot()
            .await
            .iter()
            .map(|p| p.socket_addr())
            .collect();
        groups.retain(|group| {
            !group.iter().any(|sock| {
                let addr = NetAddr::new(*sock, ServiceFlags::NODE_NETWORK);
                connected.contains(&addr.addr)
            })
        });

        let round = self.round;
        self.round = self.round.wrapping_add(1);
        for group in groups {
            let Some(grant) = acquire_slot(&self.slots, shutdown).await else {
                return true;
            };
            let addr = NetAddr::new(group[round % group.len()], ServiceFlags::NODE_NETWORK);
            self.peers
                .open_connection(&addr, None, Some(grant), false, unix_time())
                .await;
            if sleep_or_shutdown(shutdown, self.pacing).await {
                return true;
            }
        }
        false
    }

    /// Name-proxy mode: hand every add-node name to the proxy unresolved
    pub async fn pass_by_name(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let config = self.peers.config();
        let placeholder = NetAddr::new(
            SocketAddr::from(([0, 0, 0, 0], config.default_port)),
            ServiceFlags::NODE_NETWORK,
        );
        for node in &config.add_nodes {
            let Some(grant) = acquire_slot(&self.slots, shutdown).await else {
                return true;
            };
            self.peers
                .open_connection(&placeholder, Some(node), Some(grant), false, unix_time())
                .await;
            if sleep_or_shutdown(shutdown, self.pacing).await {
                return true;
            }
        }
        false
    }
}
