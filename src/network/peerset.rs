//! The set of connected peers
//!
//! Owns every [`Peer`] from admission to free, together with the policy that
//! decides who gets in (capacity, bans, duplicates, our own addresses), who
//! gets punished (misbehaviour scoring) and who gets dropped (remodeling,
//! sweeping, draining).
//!
//! Lock order is set lock, then peer locks, then the ban list, relay cache and
//! local address table. Callers that need to touch peers for long take a
//! snapshot of counted references and work outside the set lock.

use crate::network::address::{canonical_ip, with_default_port, NetAddr, NetGroup};
use crate::network::addrman::AddressBook;
use crate::network::banlist::BanList;
use crate::network::config::NetConfig;
use crate::network::local::LocalAddressTable;
use crate::network::median::MedianFilter;
use crate::network::message::InvItem;
use crate::network::peer::{DisconnectReason, Peer, PeerError, PeerRef, PeerStats};
use crate::network::registry::{CertifiedNodeRegistry, ChainSyncState};
use crate::network::relay::RelayCache;
use crate::network::socket::{DialTarget, Dialer, PeerSocket};
use bytes::Bytes;
use rand::Rng;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, RwLock};

/// Only peers connected longer than this are considered for remodeling
pub const REMODEL_MIN_AGE: i64 = 60;

/// Active peers plus admission and eviction policy
pub struct PeerSet {
    config: NetConfig,
    peers: RwLock<Vec<Arc<Peer>>>,
    /// Removed peers waiting for their references and locks to clear
    draining: Mutex<Vec<Arc<Peer>>>,
    next_id: AtomicU64,
    last_remodel: AtomicI64,

    bans: BanList,
    relay: RelayCache,
    local: LocalAddressTable,
    heights: RwLock<MedianFilter>,
    always_admit: RwLock<HashSet<IpAddr>>,

    addrman: Arc<dyn AddressBook>,
    dialer: Arc<dyn Dialer>,
    registry: Arc<dyn CertifiedNodeRegistry>,
    sync: Arc<dyn ChainSyncState>,

    peer_count: watch::Sender<usize>,
}

impl PeerSet {
    pub fn new(
        config: NetConfig,
        addrman: Arc<dyn AddressBook>,
        dialer: Arc<dyn Dialer>,
        registry: Arc<dyn CertifiedNodeRegistry>,
        sync: Arc<dyn ChainSyncState>,
    ) -> Self {
        let (peer_count, _) = watch::channel(0);
        let local = LocalAddressTable::new(config.discover);
        Self {
            config,
            peers: RwLock::new(Vec::new()),
            draining: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            last_remodel: AtomicI64::new(0),
            bans: BanList::new(),
            relay: RelayCache::new(),
            local,
            heights: RwLock::new(MedianFilter::default()),
            always_admit: RwLock::new(HashSet::new()),
            addrman,
            dialer,
            registry,
            sync,
            peer_count,
        }
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn bans(&self) -> &BanList {
        &self.bans
    }

    pub fn relay(&self) -> &RelayCache {
        &self.relay
    }

    pub fn local(&self) -> &LocalAddressTable {
        &self.local
    }

    pub fn addrman(&self) -> &Arc<dyn AddressBook> {
        &self.addrman
    }

    pub fn registry(&self) -> &Arc<dyn CertifiedNodeRegistry> {
        &self.registry
    }

    pub fn is_initial_sync(&self) -> bool {
        self.sync.is_initial_sync()
    }

    /// Receiver notified whenever the active peer count changes
    pub fn subscribe_peer_count(&self) -> watch::Receiver<usize> {
        self.peer_count.subscribe()
    }

    fn publish_count(&self, count: usize) {
        self.peer_count.send_if_modified(|current| {
            let changed = *current != count;
            *current = count;
            changed
        });
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// (inbound, outbound) counts of active peers
    pub async fn counts(&self) -> (usize, usize) {
        let peers = self.peers.read().await;
        let inbound = peers.iter().filter(|p| p.is_inbound()).count();
        (inbound, peers.len() - inbound)
    }

    pub async fn draining_len(&self) -> usize {
        self.draining.lock().await.len()
    }

    pub async fn find_by_addr(&self, addr: &SocketAddr) -> Option<PeerRef> {
        let addr = SocketAddr::new(canonical_ip(addr.ip()), addr.port());
        let peers = self.peers.read().await;
        peers
            .iter()
            .find(|p| p.socket_addr() == addr)
            .map(|p| PeerRef::new(p.clone()))
    }

    pub async fn find_by_ip(&self, ip: &IpAddr) -> Option<PeerRef> {
        let ip = canonical_ip(*ip);
        let peers = self.peers.read().await;
        peers
            .iter()
            .find(|p| p.ip() == ip)
            .map(|p| PeerRef::new(p.clone()))
    }

    pub async fn find_by_name(&self, name: &str) -> Option<PeerRef> {
        let peers = self.peers.read().await;
        peers
            .iter()
            .find(|p| p.addr_name() == name)
            .map(|p| PeerRef::new(p.clone()))
    }

    /// Counted references to every active peer
    pub async fn snapshot(&self) -> Vec<PeerRef> {
        let peers = self.peers.read().await;
        peers.iter().map(|p| PeerRef::new(p.clone())).collect()
    }

    /// Network groups of current outbound peers
    pub async fn outbound_groups(&self) -> HashSet<NetGroup> {
        let peers = self.peers.read().await;
        peers
            .iter()
            .filter(|p| !p.is_inbound())
            .map(|p| p.addr().group())
            .collect()
    }

    pub async fn stats(&self, now: i64) -> Vec<PeerStats> {
        let mut stats = Vec::new();
        for peer in self.snapshot().await {
            stats.push(peer.stats(now).await);
        }
        stats
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Remote that bypasses inbound capacity and bans
    pub async fn add_always_admit(&self, ip: IpAddr) {
        self.always_admit.write().await.insert(canonical_ip(ip));
    }

    pub async fn is_always_admit(&self, ip: &IpAddr) -> bool {
        self.always_admit.read().await.contains(&canonical_ip(*ip))
    }

    /// One of our own addresses, or loopback
    pub async fn is_local(&self, addr: &NetAddr) -> bool {
        addr.is_local() || self.local.is_local(&addr.ip()).await
    }

    pub async fn is_banned(&self, ip: &IpAddr, now: i64) -> bool {
        self.bans.is_banned_at(ip, now).await
    }

    async fn insert(&self, peer: Arc<Peer>) {
        // membership reference, released when the peer is swept
        peer.add_ref();
        let count = {
            let mut peers = self.peers.write().await;
            peers.push(peer);
            peers.len()
        };
        self.publish_count(count);
    }

    /// Connect to `addr`, or to the name `dest` when given
    ///
    /// An existing peer for the address is reused with one more reference.
    /// `hold` keeps the peer referenced for that many seconds on top of the
    /// returned reference. No retries.
    pub async fn connect(
        &self,
        addr: &NetAddr,
        dest: Option<&str>,
        hold: Option<i64>,
        now: i64,
    ) -> Option<PeerRef> {
        if dest.is_none() {
            if self.is_local(addr).await {
                log::debug!("Refusing connection to local address {}", addr);
                return None;
            }
            if let Some(existing) = self.find_by_addr(&addr.addr).await {
                if let Some(hold) = hold {
                    existing.extend_release_time(now + hold);
                }
                return Some(existing);
            }
            if self.is_banned(&addr.ip(), now).await {
                log::debug!("Refusing connection to banned address {}", addr);
                return None;
            }
        }

        let target = match self.dial_target(addr, dest) {
            Ok(target) => target,
            Err(e) => {
                log::warn!("Cannot connect to {}: {}", dest.unwrap_or("?"), e);
                return None;
            }
        };

        log::debug!("Trying connection {}", target);
        let socket = match self
            .dialer
            .dial(&target, self.config.connect_timeout())
            .await
        {
            Ok(socket) => socket,
            Err(e) => {
                log::debug!("Connection to {} failed: {}", target, e);
                return None;
            }
        };

        let remote = self.resolved_addr(addr, &target, socket.as_ref());
        self.addrman.attempt(&remote.addr).await;

        let name = dest.map(|d| with_default_port(d, self.config.default_port));
        let peer = Arc::new(Peer::new(
            self.next_id(),
            Some(socket),
            remote.clone(),
            name.unwrap_or_default(),
            false,
            now,
        ));
        if let Some(hold) = hold {
            peer.extend_release_time(now + hold);
        }
        let handle = PeerRef::new(peer.clone());

        // another task may have connected to the same address meanwhile
        {
            let mut peers = self.peers.write().await;
            if let Some(existing) = peers.iter().find(|p| p.socket_addr() == remote.addr) {
                log::debug!("Dropping duplicate connection to {}", remote);
                return Some(PeerRef::new(existing.clone()));
            }
            peer.add_ref();
            peers.push(peer);
            let count = peers.len();
            drop(peers);
            self.publish_count(count);
        }

        log::info!("Connected to {}", handle.addr_name());
        Some(handle)
    }

    fn dial_target(&self, addr: &NetAddr, dest: Option<&str>) -> Result<DialTarget, PeerError> {
        let Some(dest) = dest else {
            return Ok(DialTarget::Addr(addr.addr));
        };
        let dest = with_default_port(dest, self.config.default_port);
        if let Ok(sock) = dest.parse::<SocketAddr>() {
            return Ok(DialTarget::Addr(sock));
        }
        if self.config.name_proxy || self.config.name_lookup {
            Ok(DialTarget::Name(dest))
        } else {
            Err(PeerError::UnsupportedAddress(format!(
                "{} needs a name lookup",
                dest
            )))
        }
    }

    fn resolved_addr(
        &self,
        addr: &NetAddr,
        target: &DialTarget,
        socket: &dyn PeerSocket,
    ) -> NetAddr {
        match target {
            DialTarget::Addr(sock) => NetAddr::new(*sock, addr.services),
            // through a proxy the socket only knows the proxy's address
            DialTarget::Name(_) if self.config.proxy.is_some() => addr.clone(),
            DialTarget::Name(_) => match socket.peer_addr() {
                Ok(sock) => NetAddr::new(sock, addr.services),
                Err(_) => addr.clone(),
            },
        }
    }

    /// Outbound connection on behalf of a connector
    ///
    /// Refuses addresses that are local, banned or already connected. The
    /// slot grant moves into the new peer and is returned when it is freed.
    pub async fn open_connection(
        &self,
        addr: &NetAddr,
        dest: Option<&str>,
        grant: Option<OwnedSemaphorePermit>,
        one_shot: bool,
        now: i64,
    ) -> bool {
        match dest {
            None => {
                if self.is_local(addr).await
                    || self.find_by_ip(&addr.ip()).await.is_some()
                    || self.is_banned(&addr.ip(), now).await
                    || self.find_by_name(&addr.to_addr_string()).await.is_some()
                {
                    return false;
                }
            }
            Some(dest) => {
                let name = with_default_port(dest, self.config.default_port);
                if self.find_by_name(&name).await.is_some() {
                    return false;
                }
            }
        }

        let Some(peer) = self.connect(addr, dest, None, now).await else {
            return false;
        };
        if let Some(grant) = grant {
            peer.set_grant(grant).await;
        }
        if one_shot {
            peer.set_one_shot();
        }
        true
    }

    /// Admit an accepted connection
    pub async fn accept_inbound(
        &self,
        socket: Arc<dyn PeerSocket>,
        remote: SocketAddr,
        now: i64,
    ) -> Result<Arc<Peer>, PeerError> {
        let addr = NetAddr::new(remote, Default::default());
        let admit = self.is_always_admit(&addr.ip()).await;

        if !admit && self.is_banned(&addr.ip(), now).await {
            log::debug!("Connection from {} dropped (banned)", addr);
            return Err(PeerError::Banned(addr.ip()));
        }

        let (inbound, _) = self.counts().await;
        let max_inbound = self.config.max_inbound();
        if !admit && inbound >= max_inbound {
            log::debug!("Connection from {} refused (inbound full)", addr);
            return Err(PeerError::InboundCapacity(max_inbound));
        }

        let peer = Arc::new(Peer::new(self.next_id(), Some(socket), addr, "", true, now));
        self.insert(peer.clone()).await;
        log::info!("Accepted connection {}", peer.addr_name());
        Ok(peer)
    }

    // =========================================================================
    // Punishment
    // =========================================================================

    /// Flag `peer` for disconnection
    pub fn disconnect(&self, peer: &Peer, reason: DisconnectReason) -> bool {
        peer.disconnect(reason)
    }

    /// Add `delta` to a peer's misbehaviour score
    ///
    /// Crossing the ban threshold bans the address, disconnects the peer and
    /// drops its chain height sample. Returns whether the peer was
    /// disconnected.
    pub async fn misbehaving(&self, peer: &Peer, delta: i32, now: i64) -> bool {
        if peer.addr().is_local() {
            log::warn!("Local node {} misbehaving (delta: {})!", peer.addr_name(), delta);
            return false;
        }

        let score = peer.add_misbehavior(delta);
        if score < self.config.ban_score {
            log::info!(
                "{}: misbehaving ({} -> {})",
                peer.addr_name(),
                score - delta.max(0),
                score
            );
            return false;
        }

        log::info!(
            "{}: misbehaving ({}), banning for {}s",
            peer.addr_name(),
            score,
            self.config.ban_duration
        );
        self.bans
            .ban_for(peer.ip(), self.config.ban_duration, now)
            .await;
        peer.disconnect(DisconnectReason::Misbehaving);
        if score - delta < self.config.ban_score {
            let height = peer.info().await.start_height;
            self.heights.write().await.remove_sample(height);
        }
        true
    }

    /// Record a peer's reported chain height
    pub async fn record_height(&self, height: i64) {
        self.heights.write().await.input(height);
    }

    /// Median chain height reported by peers
    pub async fn median_height(&self) -> Option<i64> {
        self.heights.read().await.median()
    }

    // =========================================================================
    // Relay
    // =========================================================================

    /// Cache a transaction and announce it to every peer
    pub async fn relay_transaction(&self, item: InvItem, payload: Bytes, now: i64) {
        self.relay.insert_at(item.clone(), payload, now).await;
        let peers = self.snapshot().await;
        let mut announced = 0;
        for peer in &peers {
            if peer.push_inventory(item.clone()).await {
                announced += 1;
            }
        }
        log::debug!("Relaying {} to {} peers", item, announced);
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Disconnect one unsecured peer when they crowd out secured ones
    ///
    /// Runs at most once per remodel interval. Returns the flagged peer.
    pub async fn maybe_remodel<R: Rng + Send>(&self, now: i64, rng: &mut R) -> Option<u64> {
        let last = self.last_remodel.load(Ordering::Acquire);
        if now - last < self.config.remodel_interval {
            return None;
        }
        self.last_remodel.store(now, Ordering::Release);

        let (total, secured, unsecured) = {
            let peers = self.peers.read().await;
            let eligible: Vec<&Arc<Peer>> = peers
                .iter()
                .filter(|p| now - p.time_connected() > REMODEL_MIN_AGE && !p.should_disconnect())
                .collect();
            let secured = eligible.iter().filter(|p| p.is_secured()).count();
            let unsecured: Vec<PeerRef> = eligible
                .iter()
                .filter(|p| !p.is_secured())
                .map(|p| PeerRef::new((*p).clone()))
                .collect();
            (eligible.len(), secured, unsecured)
        };

        if secured == 0
            || total <= self.config.remodel_min_connections
            || 2 * secured >= 3 * unsecured.len()
        {
            return None;
        }

        let victim = &unsecured[rng.gen_range(0..unsecured.len())];
        if self.sync.is_initial_sync() {
            log::debug!("Remodel skipped during initial sync");
            return None;
        }
        if self.registry.is_certified(&victim.ip()).await {
            log::debug!("Remodel spared certified node {}", victim.addr_name());
            return None;
        }

        log::info!(
            "Remodeling: {} secured, {} unsecured, dropping {}",
            secured,
            unsecured.len(),
            victim.addr_name()
        );
        victim.disconnect(DisconnectReason::Remodel);
        Some(victim.id())
    }

    /// Move disconnected and unused peers into the draining pool
    pub async fn sweep_disconnected(&self, now: i64) -> usize {
        let (removed, count) = {
            let mut peers = self.peers.write().await;
            let mut removed = Vec::new();
            peers.retain(|p| {
                let gone = p.should_disconnect() || (p.ref_count_at(now) <= 0 && p.buffers_empty());
                if gone {
                    removed.push(p.clone());
                }
                !gone
            });
            (removed, peers.len())
        };
        if removed.is_empty() {
            return 0;
        }

        for peer in &removed {
            peer.release();
            peer.close_socket().await;
            if !peer.is_inbound() {
                self.addrman.disconnected(&peer.socket_addr()).await;
            }
        }
        let n = removed.len();
        self.draining.lock().await.extend(removed);
        self.publish_count(count);
        n
    }

    /// Free draining peers that are unreferenced and not locked
    pub async fn drain(&self, now: i64) -> usize {
        let freed: Vec<Arc<Peer>> = {
            let mut pool = self.draining.lock().await;
            let mut freed = Vec::new();
            pool.retain(|p| {
                let free = p.ref_count_at(now) <= 0 && p.try_lock_all();
                if free {
                    freed.push(p.clone());
                }
                !free
            });
            freed
        };

        for peer in &freed {
            peer.release_grant().await;
            peer.mark_freed();
            log::debug!("{}: freed", peer.addr_name());
        }
        freed.len()
    }

    /// Flag every active peer
    pub async fn disconnect_all(&self, reason: DisconnectReason) {
        for peer in self.peers.read().await.iter() {
            peer.disconnect(reason);
        }
    }
}
