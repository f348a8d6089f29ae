//! Node facade
//!
//! Builds every networking component from a [`NetConfig`], binds the
//! listeners and spawns the worker tasks. Everything stops when
//! [`Node::shutdown`] is called.

use crate::network::address::{with_default_port, Network, ServiceFlags};
use crate::network::addrman::AddrManager;
use crate::network::config::{ConfigError, NetConfig};
use crate::network::event_loop::SocketEventLoop;
use crate::network::local::{interface_ipv4, LocalScore};
use crate::network::message::{InvItem, InvType};
use crate::network::outbound::{OneShotQueue, OutboundConnector};
use crate::network::peer::PeerStats;
use crate::network::peerset::PeerSet;
use crate::network::processor::{MessageLoop, ProtocolHandler, ReceivedTx};
use crate::network::registry::{StaticRegistry, SyncStatus};
use crate::network::server::Server;
use crate::network::socket::{Listener, TcpDialer};
use crate::network::trusted::TrustedConnector;
use crate::network::{sleep_or_shutdown, unix_time, upnp};
use bytes::Bytes;
use serde::Serialize;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;

/// Capacity of the received-transaction channel
const TRANSACTION_QUEUE: usize = 1000;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Node status information
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub listening: Vec<SocketAddr>,
    pub peers: usize,
    pub inbound: usize,
    pub outbound: usize,
    pub draining: usize,
    pub banned: usize,
    pub known_addresses: usize,
    pub local_addresses: Vec<SocketAddr>,
    pub median_height: Option<i64>,
}

/// A running peer connection manager
pub struct Node {
    peers: Arc<PeerSet>,
    addrman: Arc<RwLock<AddrManager>>,
    handler: Arc<ProtocolHandler>,
    sync: Arc<SyncStatus>,
    slots: Arc<Semaphore>,
    one_shots: OneShotQueue,
    listening: Vec<SocketAddr>,
    transactions: Mutex<Option<mpsc::Receiver<ReceivedTx>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Build all components and start the worker tasks
    pub async fn start(config: NetConfig) -> Result<Self, NodeError> {
        config.validate()?;

        let addrman = Arc::new(RwLock::new(load_addresses(config.peers_file.as_ref())));
        let registry = Arc::new(StaticRegistry::new(resolve_certified(&config).await));
        let sync = Arc::new(SyncStatus::new(false));
        let dialer = Arc::new(TcpDialer::new(config.proxy));
        let peers = Arc::new(PeerSet::new(
            config.clone(),
            addrman.clone(),
            dialer,
            registry,
            sync.clone(),
        ));

        for network in &config.limited_networks {
            peers.local().set_limited(*network, true).await;
        }
        for addr in &config.external_addrs {
            peers.local().add(*addr, LocalScore::Manual).await;
        }

        let mut listeners: Vec<Arc<dyn Listener>> = Vec::new();
        let mut listening = Vec::new();
        if config.listen_enabled {
            for addr in &config.listen {
                let server = Server::bind(*addr)
                    .await
                    .map_err(|source| NodeError::Bind { addr: *addr, source })?;
                peers.local().add(server.addr(), LocalScore::Bind).await;
                listening.push(server.addr());
                listeners.push(Arc::new(server));
            }
            if config.discover {
                let port = listening.first().map_or(config.default_port, |a| a.port());
                let found = interface_ipv4().map(IpAddr::V4);
                peers.local().add_interfaces(found, port).await;
            }
        }

        let wake = Arc::new(Notify::new());
        let (tx_sender, tx_receiver) = mpsc::channel(TRANSACTION_QUEUE);
        let handler = Arc::new(ProtocolHandler::new(
            peers.clone(),
            ServiceFlags::NODE_NETWORK,
            tx_sender,
        ));
        let slots = Arc::new(Semaphore::new(config.effective_outbound_slots()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let outbound = OutboundConnector::new(peers.clone(), slots.clone());
        let one_shots = outbound.one_shots();

        let mut tasks = vec![
            tokio::spawn(
                SocketEventLoop::new(peers.clone(), listeners, wake.clone())
                    .run(shutdown_rx.clone()),
            ),
            tokio::spawn(
                MessageLoop::new(peers.clone(), handler.clone(), wake).run(shutdown_rx.clone()),
            ),
            tokio::spawn(handler.clone().run_advertiser(shutdown_rx.clone())),
            tokio::spawn(outbound.run(shutdown_rx.clone())),
            tokio::spawn(TrustedConnector::new(peers.clone(), slots.clone()).run(shutdown_rx.clone())),
            tokio::spawn(run_maintenance(
                peers.clone(),
                addrman.clone(),
                config.peers_file.clone(),
                Duration::from_secs(config.dump_interval),
                shutdown_rx.clone(),
            )),
        ];
        if config.upnp {
            if let Some(port) = listening.first().map(|a| a.port()) {
                tasks.push(tokio::spawn(upnp::run_port_mapping(
                    peers.clone(),
                    port,
                    shutdown_rx.clone(),
                )));
            }
        }

        log::info!(
            "Node started, listening on {:?}, {} outbound slots",
            listening,
            config.effective_outbound_slots()
        );

        Ok(Self {
            peers,
            addrman,
            handler,
            sync,
            slots,
            one_shots,
            listening,
            transactions: Mutex::new(Some(tx_receiver)),
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.peers
    }

    pub fn listening(&self) -> &[SocketAddr] {
        &self.listening
    }

    /// Announce a transaction and keep it available for `getdata`
    pub async fn relay_transaction(&self, payload: Bytes) -> InvItem {
        let item = InvItem::for_payload(InvType::Tx, &payload);
        self.peers
            .relay_transaction(item.clone(), payload, unix_time())
            .await;
        item
    }

    /// Queue a connection that closes after the address exchange
    pub async fn add_one_shot(&self, dest: impl Into<String>) {
        self.one_shots.lock().await.push_back(dest.into());
    }

    pub async fn peer_stats(&self) -> Vec<PeerStats> {
        self.peers.stats(unix_time()).await
    }

    pub async fn status(&self) -> NodeStatus {
        let now = unix_time();
        let (inbound, outbound) = self.peers.counts().await;
        NodeStatus {
            listening: self.listening.clone(),
            peers: inbound + outbound,
            inbound,
            outbound,
            draining: self.peers.draining_len().await,
            banned: self.peers.bans().entries(now).await.len(),
            known_addresses: self.addrman.read().await.size(),
            local_addresses: self
                .peers
                .local()
                .entries()
                .await
                .into_iter()
                .map(|(ip, service)| SocketAddr::new(ip, service.port))
                .collect(),
            median_height: self.peers.median_height().await,
        }
    }

    pub fn subscribe_peer_count(&self) -> watch::Receiver<usize> {
        self.peers.subscribe_peer_count()
    }

    /// Transactions received from peers; can be taken once
    pub async fn transactions(&self) -> Option<mpsc::Receiver<ReceivedTx>> {
        self.transactions.lock().await.take()
    }

    pub fn set_initial_sync(&self, syncing: bool) {
        self.sync.set_initial_sync(syncing);
    }

    /// Height announced in our version messages
    pub fn set_best_height(&self, height: i64) {
        self.handler.set_best_height(height);
    }

    /// Stop all workers and wait for them to finish
    pub async fn shutdown(&self) {
        log::info!("Node shutting down...");
        let _ = self.shutdown_tx.send(true);
        self.slots.close();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                log::error!("Worker task failed: {}", e);
            }
        }
        log::info!("Node stopped");
    }
}

fn load_addresses(path: Option<&PathBuf>) -> AddrManager {
    let mut addrman = AddrManager::new();
    if let Some(path) = path {
        if path.exists() {
            if let Err(e) = addrman.load(path) {
                log::warn!("Failed to load peers file {}: {}", path.display(), e);
            }
        }
    }
    addrman
}

async fn resolve_certified(config: &NetConfig) -> Vec<SocketAddr> {
    let mut nodes = Vec::new();
    for node in &config.certified_nodes {
        let target = with_default_port(node, config.default_port);
        if let Ok(addr) = target.parse::<SocketAddr>() {
            nodes.push(addr);
            continue;
        }
        if !config.name_lookup {
            log::warn!("Certified node {} needs a name lookup", node);
            continue;
        }
        let resolved = tokio::net::lookup_host(target.as_str()).await;
        match resolved {
            Ok(addrs) => nodes.extend(addrs),
            Err(e) => log::warn!("Failed to resolve certified node {}: {}", node, e),
        };
    }
    nodes
}

fn save_addresses(addrman: &AddrManager, path: &PathBuf) {
    if let Err(e) = addrman.save(path) {
        log::warn!("Failed to save peers file {}: {}", path.display(), e);
    }
}

/// Expire bans and dump the address book, once more on shutdown
async fn run_maintenance(
    peers: Arc<PeerSet>,
    addrman: Arc<RwLock<AddrManager>>,
    peers_file: Option<PathBuf>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let stopping = sleep_or_shutdown(&mut shutdown, interval).await;
        let expired = peers.bans().sweep(unix_time()).await;
        if expired > 0 {
            log::info!("Expired {} bans", expired);
        }
        if let Some(path) = &peers_file {
            save_addresses(&*addrman.read().await, path);
        }
        if stopping {
            break;
        }
    }
}

/// Parse `--onlynet` style values into the networks to limit
pub fn limited_except(only: &[Network]) -> Vec<Network> {
    if only.is_empty() {
        return Vec::new();
    }
    Network::ALL
        .iter()
        .filter(|n| !only.contains(n))
        .copied()
        .collect()
}
