//! Message processing
//!
//! The processing loop visits every peer, parses whatever complete frames
//! sit in its receive buffer and writes replies into its send buffer. Both
//! buffers are only try-locked, so a busy peer is simply skipped until the
//! next pass. [`ProtocolHandler`] is the default processor: handshake,
//! keep-alive, address gossip, and inventory relay out of the relay cache.

use crate::network::address::{NetAddr, ServiceFlags};
use crate::network::message::{
    InvItem, InvType, Message, VersionMessage, MAX_ADDR_PER_MESSAGE, MAX_INV_PER_MESSAGE,
    MIN_PROTOCOL_VERSION,
};
use crate::network::peer::{DisconnectReason, PeerError, PeerRef, PeerState};
use crate::network::peerset::PeerSet;
use crate::network::server::MessageCodec;
use crate::network::unix_time;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio_util::codec::Decoder;

/// Idle wait between processing passes
pub const PROCESS_INTERVAL: Duration = Duration::from_millis(100);

/// Ping a peer we have not sent anything to for this long
pub const PING_INTERVAL: i64 = 30 * 60;

/// Gossiped addresses are relayed to this many peers
const ADDR_RELAY_FANOUT: usize = 2;

/// Penalty for oversized or malformed messages
const PENALTY_OVERSIZED: i32 = 20;
const PENALTY_MALFORMED: i32 = 10;
const PENALTY_OUT_OF_ORDER: i32 = 1;

/// Consumes received bytes and produces outgoing messages
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    /// Handle every complete message in `recv`, replying into `send`
    async fn process_messages(
        &self,
        peer: &PeerRef,
        recv: &mut BytesMut,
        send: &mut BytesMut,
        now: i64,
    ) -> Result<(), PeerError>;

    /// Periodic output: handshake start, pings, queued inventory, addresses
    async fn send_messages(
        &self,
        peer: &PeerRef,
        send: &mut BytesMut,
        trickle: bool,
        now: i64,
    ) -> Result<(), PeerError>;

    /// Called once per pass after every peer was visited
    async fn end_pass(&self, _peers: &[PeerRef]) {}
}

/// Transaction received from a peer, for the external validator
#[derive(Debug, Clone)]
pub struct ReceivedTx {
    pub item: InvItem,
    pub payload: Bytes,
    pub from: SocketAddr,
}

// =============================================================================
// Processing loop
// =============================================================================

/// Worker driving a [`MessageProcessor`] over all peers
pub struct MessageLoop {
    peers: Arc<PeerSet>,
    processor: Arc<dyn MessageProcessor>,
    wake: Arc<Notify>,
    rng: StdRng,
}

impl MessageLoop {
    pub fn new(
        peers: Arc<PeerSet>,
        processor: Arc<dyn MessageProcessor>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            peers,
            processor,
            wake,
            rng: StdRng::from_entropy(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        log::info!("Message processing started");
        while !*shutdown.borrow() {
            self.pass(unix_time()).await;
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(PROCESS_INTERVAL) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        log::info!("Message processing stopped");
    }

    /// Visit every peer once
    pub async fn pass(&mut self, now: i64) {
        let snapshot = self.peers.snapshot().await;
        if snapshot.is_empty() {
            return;
        }
        // one random peer per pass gets the address trickle
        let trickle = self.rng.gen_range(0..snapshot.len());
        let max_send = self.peers.config().max_send_buffer;

        for (index, peer) in snapshot.iter().enumerate() {
            if peer.should_disconnect() {
                continue;
            }

            if let Ok(mut recv) = peer.recv_buffer().try_lock() {
                if !recv.is_empty() {
                    if let Ok(mut send) = peer.send_buffer().try_lock() {
                        // stop reading while the remote is not draining our replies
                        if send.len() < max_send {
                            if let Err(e) = self
                                .processor
                                .process_messages(peer, &mut recv, &mut send, now)
                                .await
                            {
                                log::debug!("{}: processing failed: {}", peer.addr_name(), e);
                            }
                        }
                    }
                }
            }
            if peer.should_disconnect() {
                continue;
            }

            if let Ok(mut send) = peer.send_buffer().try_lock() {
                if let Err(e) = self
                    .processor
                    .send_messages(peer, &mut send, index == trickle, now)
                    .await
                {
                    log::debug!("{}: sending failed: {}", peer.addr_name(), e);
                }
            }
        }

        self.processor.end_pass(&snapshot).await;
    }
}

// =============================================================================
// Protocol handler
// =============================================================================

/// Default message processor
pub struct ProtocolHandler {
    peers: Arc<PeerSet>,
    services: ServiceFlags,
    /// Sent in our version messages to detect connections to ourselves
    nonce: u64,
    best_height: AtomicI64,
    transactions: mpsc::Sender<ReceivedTx>,
    /// Gossiped addresses waiting to be relayed, with their source
    pending_relay: Mutex<Vec<(NetAddr, SocketAddr)>>,
}

impl ProtocolHandler {
    pub fn new(
        peers: Arc<PeerSet>,
        services: ServiceFlags,
        transactions: mpsc::Sender<ReceivedTx>,
    ) -> Self {
        Self {
            peers,
            services,
            nonce: rand::thread_rng().gen_range(2..u64::MAX),
            best_height: AtomicI64::new(0),
            transactions,
            pending_relay: Mutex::new(Vec::new()),
        }
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn set_best_height(&self, height: i64) {
        self.best_height.store(height, Ordering::Relaxed);
    }

    pub fn best_height(&self) -> i64 {
        self.best_height.load(Ordering::Relaxed)
    }

    fn push(send: &mut BytesMut, msg: &Message) -> Result<(), PeerError> {
        MessageCodec::encode_message(msg, send)?;
        Ok(())
    }

    async fn push_version(&self, peer: &PeerRef, send: &mut BytesMut) -> Result<(), PeerError> {
        let addr_from = self.peers.local().best_for(Some(peer.addr())).await;
        let mut version = VersionMessage::new(
            self.services,
            peer.socket_addr(),
            addr_from,
            self.nonce,
            self.best_height(),
        );
        if !peer.is_inbound() {
            version.reconnect_token = self
                .peers
                .addrman()
                .reconnect_token(&peer.socket_addr())
                .await;
        }
        Self::push(send, &Message::Version(version))
    }

    /// Push our best local address to every established peer
    pub async fn advertise_local(&self) -> usize {
        let mut advertised = 0;
        for peer in self.peers.snapshot().await {
            if peer.should_disconnect() || peer.info().await.state != PeerState::Established {
                continue;
            }
            if let Some(local) = self.peers.local().best_for(Some(peer.addr())).await {
                let addr = NetAddr::new(local, self.services);
                if addr.is_routable() && peer.push_address(addr).await {
                    advertised += 1;
                }
            }
        }
        advertised
    }

    /// Re-advertise whenever the local address table changes
    pub async fn run_advertiser(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut changes = self.peers.local().subscribe();
        loop {
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let n = self.advertise_local().await;
                    log::debug!("Advertised local address to {} peers", n);
                }
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
    }

    async fn handle(
        &self,
        peer: &PeerRef,
        msg: Message,
        send: &mut BytesMut,
        now: i64,
    ) -> Result<(), PeerError> {
        let version_known = peer.info().await.version != 0;
        match msg {
            Message::Version(version) => {
                if version_known {
                    self.peers
                        .misbehaving(peer, PENALTY_OUT_OF_ORDER, now)
                        .await;
                    return Ok(());
                }
                self.handle_version(peer, version, send).await
            }
            _ if !version_known => {
                // version must come first
                self.peers
                    .misbehaving(peer, PENALTY_OUT_OF_ORDER, now)
                    .await;
                Ok(())
            }
            Message::VerAck => {
                peer.update_info(|info| info.state = PeerState::Established)
                    .await;
                Ok(())
            }
            Message::Ping(nonce) => Self::push(send, &Message::Pong(nonce)),
            Message::Pong(_) => Ok(()),
            Message::GetAddr => {
                let addrs = self
                    .peers
                    .addrman()
                    .get_addr(MAX_ADDR_PER_MESSAGE)
                    .await;
                if addrs.is_empty() {
                    return Ok(());
                }
                let mut inventory = peer.inventory().lock().await;
                for addr in &addrs {
                    inventory.add_known_addr(addr.addr);
                }
                drop(inventory);
                Self::push(send, &Message::Addr(addrs))
            }
            Message::Addr(addrs) => self.handle_addr(peer, addrs, now).await,
            Message::Inv(items) => {
                if items.len() > MAX_INV_PER_MESSAGE {
                    self.peers.misbehaving(peer, PENALTY_OVERSIZED, now).await;
                    return Ok(());
                }
                let mut wanted = Vec::new();
                {
                    let mut inventory = peer.inventory().lock().await;
                    for item in items {
                        inventory.add_known(item.clone());
                        wanted.push(item);
                    }
                }
                let mut requests = peer.requests().lock().await;
                for item in wanted {
                    if !self.peers.relay().contains(&item).await {
                        requests.ask_for(item, now);
                    }
                }
                Ok(())
            }
            Message::GetData(items) => {
                if items.len() > MAX_INV_PER_MESSAGE {
                    self.peers.misbehaving(peer, PENALTY_OVERSIZED, now).await;
                    return Ok(());
                }
                let mut missing = Vec::new();
                for item in items {
                    match self.peers.relay().get(&item).await {
                        Some(payload) => Self::push(
                            send,
                            &Message::Tx {
                                item,
                                payload: payload.to_vec(),
                            },
                        )?,
                        None => missing.push(item),
                    }
                }
                if !missing.is_empty() {
                    Self::push(send, &Message::NotFound(missing))?;
                }
                Ok(())
            }
            Message::NotFound(items) => {
                log::debug!("{}: {} items not found", peer.addr_name(), items.len());
                Ok(())
            }
            Message::Tx { item, payload } => {
                if item.inv_type != InvType::Tx
                    || InvItem::for_payload(InvType::Tx, &payload) != item
                {
                    self.peers.misbehaving(peer, PENALTY_MALFORMED, now).await;
                    return Ok(());
                }
                peer.inventory().lock().await.add_known(item.clone());
                let tx = ReceivedTx {
                    item,
                    payload: Bytes::from(payload),
                    from: peer.socket_addr(),
                };
                if let Err(e) = self.transactions.try_send(tx) {
                    log::warn!("Dropping transaction from {}: {}", peer.addr_name(), e);
                }
                Ok(())
            }
            Message::Token(token) => {
                if peer.is_inbound() {
                    log::debug!("{}: ignoring token from inbound peer", peer.addr_name());
                } else {
                    self.peers
                        .addrman()
                        .set_reconnect_token(&peer.socket_addr(), token)
                        .await;
                }
                Ok(())
            }
        }
    }

    async fn handle_version(
        &self,
        peer: &PeerRef,
        version: VersionMessage,
        send: &mut BytesMut,
    ) -> Result<(), PeerError> {
        if version.version < MIN_PROTOCOL_VERSION {
            log::info!(
                "{}: using obsolete version {}",
                peer.addr_name(),
                version.version
            );
            peer.disconnect(DisconnectReason::ObsoleteVersion);
            return Ok(());
        }
        if version.nonce == self.nonce {
            log::info!("Connected to self at {}, disconnecting", peer.addr_name());
            peer.disconnect(DisconnectReason::SelfConnection);
            return Ok(());
        }

        peer.update_info(|info| info.update_from_version(&version))
            .await;
        self.peers.record_height(version.start_height).await;
        if NetAddr::from(version.addr_recv).is_routable() {
            self.peers.local().seen(&version.addr_recv.ip()).await;
        }

        if peer.is_inbound() && peer.claim_version_send() {
            self.push_version(peer, send).await?;
        }
        Self::push(send, &Message::VerAck)?;

        let addrman = self.peers.addrman();
        let remote = peer.socket_addr();
        if peer.is_inbound() {
            let verified = match version.reconnect_token {
                Some(token) => addrman.verification_token(&remote).await == Some(token),
                None => false,
            } || self.peers.registry().is_certified(&peer.ip()).await;
            peer.set_verified(verified);

            let token: u64 = rand::random();
            addrman.set_verification_token(&remote, token).await;
            Self::push(send, &Message::Token(token))?;
        } else {
            if !self.peers.is_initial_sync() {
                if let Some(local) = self.peers.local().best_for(Some(peer.addr())).await {
                    let addr = NetAddr::new(local, self.services);
                    if addr.is_routable() {
                        peer.push_address(addr).await;
                    }
                }
            }
            Self::push(send, &Message::GetAddr)?;
            addrman.connected(&remote).await;
        }

        log::info!(
            "{}: version {}, height {}, us={}, inbound={}, verified={}",
            peer.addr_name(),
            version.version,
            version.start_height,
            version.addr_recv,
            peer.is_inbound(),
            peer.is_verified()
        );
        Ok(())
    }

    async fn handle_addr(
        &self,
        peer: &PeerRef,
        addrs: Vec<NetAddr>,
        now: i64,
    ) -> Result<(), PeerError> {
        if addrs.len() > MAX_ADDR_PER_MESSAGE {
            self.peers.misbehaving(peer, PENALTY_OVERSIZED, now).await;
            return Ok(());
        }

        let relay = addrs.len() <= 10;
        let mut accepted = 0;
        for mut addr in addrs {
            // clamp timestamps that are absurd or from the future
            if addr.timestamp <= 100_000_000 || addr.timestamp > now + 10 * 60 {
                addr.timestamp = now - 5 * 24 * 60 * 60;
            }
            peer.inventory().lock().await.add_known_addr(addr.addr);
            if self.peers.local().is_limited(addr.network()).await {
                continue;
            }
            if relay && addr.is_routable() && addr.timestamp > now - 10 * 60 {
                self.pending_relay
                    .lock()
                    .await
                    .push((addr.clone(), peer.socket_addr()));
            }
            if self.peers.addrman().add(addr, Some(peer.ip())).await {
                accepted += 1;
            }
        }
        log::debug!("{}: {} new addresses", peer.addr_name(), accepted);

        if peer.is_one_shot() {
            peer.disconnect(DisconnectReason::OneShot);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageProcessor for ProtocolHandler {
    async fn process_messages(
        &self,
        peer: &PeerRef,
        recv: &mut BytesMut,
        send: &mut BytesMut,
        now: i64,
    ) -> Result<(), PeerError> {
        let mut codec = MessageCodec;
        loop {
            let msg = match codec.decode(recv) {
                Ok(Some(msg)) => msg,
                Ok(None) => return Ok(()),
                Err(e) => {
                    log::info!("{}: bad frame: {}", peer.addr_name(), e);
                    recv.clear();
                    self.peers.misbehaving(peer, PENALTY_MALFORMED, now).await;
                    peer.disconnect(DisconnectReason::ProtocolViolation);
                    return Err(PeerError::InvalidFrame(e.to_string()));
                }
            };
            log::debug!("{}: received {}", peer.addr_name(), msg.type_name());
            self.handle(peer, msg, send, now).await?;
            if peer.should_disconnect() {
                return Ok(());
            }
        }
    }

    async fn send_messages(
        &self,
        peer: &PeerRef,
        send: &mut BytesMut,
        trickle: bool,
        now: i64,
    ) -> Result<(), PeerError> {
        if !peer.is_inbound() && peer.claim_version_send() {
            self.push_version(peer, send).await?;
        }
        if peer.info().await.version == 0 {
            return Ok(());
        }

        let last_send = peer.last_send();
        if last_send != 0 && now - last_send > PING_INTERVAL && send.is_empty() {
            Self::push(send, &Message::Ping(rand::random()))?;
        }

        let (addrs, items) = {
            let mut inventory = peer.inventory().lock().await;
            let addrs = if trickle {
                inventory.take_addrs()
            } else {
                Vec::new()
            };
            (addrs, inventory.take_to_send())
        };
        for chunk in addrs.chunks(MAX_ADDR_PER_MESSAGE) {
            Self::push(send, &Message::Addr(chunk.to_vec()))?;
        }
        for chunk in items.chunks(MAX_INV_PER_MESSAGE) {
            Self::push(send, &Message::Inv(chunk.to_vec()))?;
        }

        let due = peer.requests().lock().await.due(now, MAX_INV_PER_MESSAGE);
        if !due.is_empty() {
            Self::push(send, &Message::GetData(due))?;
        }
        Ok(())
    }

    async fn end_pass(&self, peers: &[PeerRef]) {
        let pending = std::mem::take(&mut *self.pending_relay.lock().await);
        if pending.is_empty() {
            return;
        }
        for (addr, source) in pending {
            let targets: Vec<&PeerRef> = {
                let eligible: Vec<&PeerRef> = peers
                    .iter()
                    .filter(|p| p.socket_addr() != source && !p.should_disconnect())
                    .collect();
                let mut rng = rand::thread_rng();
                eligible
                    .choose_multiple(&mut rng, ADDR_RELAY_FANOUT)
                    .copied()
                    .collect()
            };
            for target in targets {
                target.push_address(addr.clone()).await;
            }
        }
    }
}
