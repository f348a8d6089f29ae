//! Peer state
//!
//! One [`Peer`] exists for every connected or draining endpoint. The socket
//! event loop moves bytes between the socket and the peer's buffers, the
//! message processor parses and answers, and the peer set decides when a peer
//! is gone for good.
//!
//! Each peer carries four locks (send buffer, receive buffer, request queue,
//! inventory). A peer is only freed once its reference count is zero and all
//! four can be taken without waiting.

use crate::network::address::{NetAddr, ServiceFlags};
use crate::network::message::{InvItem, Message, VersionMessage};
use crate::network::server::MessageCodec;
use crate::network::socket::PeerSocket;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock};

/// A new peer must exchange traffic within this many seconds
pub const INITIAL_MESSAGE_TIMEOUT: i64 = 60;

/// Silence in either direction for this long drops the peer
pub const INACTIVITY_TIMEOUT: i64 = 90 * 60;

/// Known-inventory set is reset past this size
pub const MAX_KNOWN_INVENTORY: usize = 50_000;

/// Known-address set is reset past this size
pub const MAX_KNOWN_ADDRESSES: usize = 5_000;

pub type PeerId = u64;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection to {0} timed out")]
    Timeout(String),
    #[error("Address {0} is banned")]
    Banned(IpAddr),
    #[error("Inbound capacity reached ({0} peers)")]
    InboundCapacity(usize),
    #[error("Unsupported address: {0}")]
    UnsupportedAddress(String),
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

/// Why a peer was flagged for disconnection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    Requested,
    Closed,
    SocketError,
    FloodControl,
    NoInitialMessage,
    SendTimeout,
    RecvTimeout,
    Remodel,
    Misbehaving,
    SelfConnection,
    ObsoleteVersion,
    ProtocolViolation,
    OneShot,
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::Requested => "requested",
            DisconnectReason::Closed => "connection closed",
            DisconnectReason::SocketError => "socket error",
            DisconnectReason::FloodControl => "receive flood control",
            DisconnectReason::NoInitialMessage => "no message in first 60 seconds",
            DisconnectReason::SendTimeout => "socket sending timeout",
            DisconnectReason::RecvTimeout => "socket receive timeout",
            DisconnectReason::Remodel => "remodeling",
            DisconnectReason::Misbehaving => "misbehaving",
            DisconnectReason::SelfConnection => "connected to self",
            DisconnectReason::ObsoleteVersion => "obsolete version",
            DisconnectReason::ProtocolViolation => "protocol violation",
            DisconnectReason::OneShot => "one-shot complete",
            DisconnectReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PeerState {
    #[default]
    Handshaking,
    Established,
}

/// What the remote told us about itself
#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
    pub state: PeerState,
    pub version: u32,
    pub services: ServiceFlags,
    pub user_agent: String,
    pub start_height: i64,
    /// Our address as the remote sees it
    pub addr_local: Option<SocketAddr>,
}

impl PeerInfo {
    pub fn update_from_version(&mut self, version: &VersionMessage) {
        self.version = version.version;
        self.services = version.services;
        self.user_agent = version.user_agent.clone();
        self.start_height = version.start_height;
        self.addr_local = Some(version.addr_recv);
    }
}

/// Inventory and addresses known to, or queued for, the remote
#[derive(Debug, Default)]
pub struct InventoryState {
    known: HashSet<InvItem>,
    to_send: Vec<InvItem>,
    known_addrs: HashSet<SocketAddr>,
    addrs_to_send: Vec<NetAddr>,
}

impl InventoryState {
    /// Remember that the remote has `item`
    pub fn add_known(&mut self, item: InvItem) -> bool {
        if self.known.len() >= MAX_KNOWN_INVENTORY {
            self.known.clear();
        }
        self.known.insert(item)
    }

    pub fn knows(&self, item: &InvItem) -> bool {
        self.known.contains(item)
    }

    /// Queue an announcement unless the remote already has it
    pub fn push(&mut self, item: InvItem) -> bool {
        if self.known.contains(&item) || self.to_send.contains(&item) {
            return false;
        }
        self.to_send.push(item);
        true
    }

    /// Take queued announcements, marking them known
    pub fn take_to_send(&mut self) -> Vec<InvItem> {
        let items = std::mem::take(&mut self.to_send);
        for item in &items {
            self.add_known(item.clone());
        }
        items
    }

    pub fn add_known_addr(&mut self, addr: SocketAddr) -> bool {
        if self.known_addrs.len() >= MAX_KNOWN_ADDRESSES {
            self.known_addrs.clear();
        }
        self.known_addrs.insert(addr)
    }

    /// Queue an address for gossip unless the remote already has it
    pub fn push_addr(&mut self, addr: NetAddr) -> bool {
        if self.known_addrs.contains(&addr.addr) {
            return false;
        }
        self.addrs_to_send.push(addr);
        true
    }

    /// Take queued addresses, marking them known
    pub fn take_addrs(&mut self) -> Vec<NetAddr> {
        let addrs = std::mem::take(&mut self.addrs_to_send);
        for addr in &addrs {
            self.add_known_addr(addr.addr);
        }
        addrs
    }

    pub fn pending_addrs(&self) -> usize {
        self.addrs_to_send.len()
    }
}

/// Content we want from the remote, ordered by when to ask
#[derive(Debug, Default)]
pub struct RequestQueue {
    scheduled: BTreeSet<(i64, InvItem)>,
    asked: HashSet<InvItem>,
}

impl RequestQueue {
    /// Schedule a request for `item` at time `at`; each item is asked once
    pub fn ask_for(&mut self, item: InvItem, at: i64) -> bool {
        if self.asked.len() >= MAX_KNOWN_INVENTORY {
            self.asked.clear();
        }
        if !self.asked.insert(item.clone()) {
            return false;
        }
        self.scheduled.insert((at, item));
        true
    }

    /// Pop up to `max` requests that are due at `now`
    pub fn due(&mut self, now: i64, max: usize) -> Vec<InvItem> {
        let mut items = Vec::new();
        while items.len() < max {
            match self.scheduled.first() {
                Some((at, _)) if *at <= now => {
                    if let Some((_, item)) = self.scheduled.pop_first() {
                        items.push(item);
                    }
                }
                _ => break,
            }
        }
        items
    }

    pub fn len(&self) -> usize {
        self.scheduled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }
}

/// Serializable snapshot of one peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStats {
    pub id: PeerId,
    pub addr: String,
    pub addr_name: String,
    pub services: u64,
    pub last_send: i64,
    pub last_recv: i64,
    pub conn_time: i64,
    pub uptime: i64,
    pub version: u32,
    pub user_agent: String,
    pub inbound: bool,
    pub start_height: i64,
    pub misbehavior: i32,
    pub verified: bool,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

// =============================================================================
// Peer
// =============================================================================

/// One remote endpoint
pub struct Peer {
    id: PeerId,
    addr: NetAddr,
    /// Destination name we dialed, or the address string
    addr_name: String,
    inbound: bool,
    time_connected: i64,

    socket: Mutex<Option<Arc<dyn PeerSocket>>>,
    send: Mutex<BytesMut>,
    recv: Mutex<BytesMut>,
    requests: Mutex<RequestQueue>,
    inventory: Mutex<InventoryState>,
    info: RwLock<PeerInfo>,
    grant: Mutex<Option<OwnedSemaphorePermit>>,

    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
    last_send: AtomicI64,
    last_recv: AtomicI64,
    last_send_empty: AtomicI64,

    misbehavior: AtomicI32,
    verified: AtomicBool,
    one_shot: AtomicBool,
    version_sent: AtomicBool,
    freed: AtomicBool,
    disconnect: OnceLock<DisconnectReason>,

    ref_count: AtomicI32,
    release_time: AtomicI64,
}

impl Peer {
    pub fn new(
        id: PeerId,
        socket: Option<Arc<dyn PeerSocket>>,
        addr: NetAddr,
        addr_name: impl Into<String>,
        inbound: bool,
        now: i64,
    ) -> Self {
        let addr_name = addr_name.into();
        let addr_name = if addr_name.is_empty() {
            addr.to_addr_string()
        } else {
            addr_name
        };
        Self {
            id,
            addr,
            addr_name,
            inbound,
            time_connected: now,
            socket: Mutex::new(socket),
            send: Mutex::new(BytesMut::new()),
            recv: Mutex::new(BytesMut::new()),
            requests: Mutex::new(RequestQueue::default()),
            inventory: Mutex::new(InventoryState::default()),
            info: RwLock::new(PeerInfo::default()),
            grant: Mutex::new(None),
            bytes_sent: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
            last_send: AtomicI64::new(0),
            last_recv: AtomicI64::new(0),
            last_send_empty: AtomicI64::new(now),
            misbehavior: AtomicI32::new(0),
            verified: AtomicBool::new(false),
            one_shot: AtomicBool::new(false),
            version_sent: AtomicBool::new(false),
            freed: AtomicBool::new(false),
            disconnect: OnceLock::new(),
            ref_count: AtomicI32::new(0),
            release_time: AtomicI64::new(0),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> &NetAddr {
        &self.addr
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.addr.addr
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn addr_name(&self) -> &str {
        &self.addr_name
    }

    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    pub fn time_connected(&self) -> i64 {
        self.time_connected
    }

    // -------------------------------------------------------------------------
    // Socket
    // -------------------------------------------------------------------------

    pub async fn socket(&self) -> Option<Arc<dyn PeerSocket>> {
        self.socket.lock().await.clone()
    }

    /// Drop our handle on the socket; returns whether one was open
    pub async fn close_socket(&self) -> bool {
        let closed = self.socket.lock().await.take().is_some();
        if closed {
            log::debug!("{}: socket closed", self.addr_name);
        }
        closed
    }

    // -------------------------------------------------------------------------
    // Locks
    // -------------------------------------------------------------------------

    pub fn send_buffer(&self) -> &Mutex<BytesMut> {
        &self.send
    }

    pub fn recv_buffer(&self) -> &Mutex<BytesMut> {
        &self.recv
    }

    pub fn requests(&self) -> &Mutex<RequestQueue> {
        &self.requests
    }

    pub fn inventory(&self) -> &Mutex<InventoryState> {
        &self.inventory
    }

    /// Whether all four peer locks are free right now
    pub fn try_lock_all(&self) -> bool {
        let send = self.send.try_lock();
        let recv = self.recv.try_lock();
        let requests = self.requests.try_lock();
        let inventory = self.inventory.try_lock();
        send.is_ok() && recv.is_ok() && requests.is_ok() && inventory.is_ok()
    }

    /// Both buffers empty; a buffer whose lock is busy counts as non-empty
    pub fn buffers_empty(&self) -> bool {
        let send_empty = self.send.try_lock().map(|b| b.is_empty()).unwrap_or(false);
        let recv_empty = self.recv.try_lock().map(|b| b.is_empty()).unwrap_or(false);
        send_empty && recv_empty
    }

    /// Frame `msg` onto the send buffer
    pub async fn push_message(&self, msg: &Message) -> Result<(), PeerError> {
        let mut send = self.send.lock().await;
        MessageCodec::encode_message(msg, &mut send)?;
        log::debug!("{}: queued {}", self.addr_name, msg.type_name());
        Ok(())
    }

    /// Queue an inventory announcement for the next flush
    pub async fn push_inventory(&self, item: InvItem) -> bool {
        self.inventory.lock().await.push(item)
    }

    /// Queue an address for the next gossip round
    pub async fn push_address(&self, addr: NetAddr) -> bool {
        self.inventory.lock().await.push_addr(addr)
    }

    /// Schedule a `getdata` for `item` at `now`
    pub async fn ask_for(&self, item: InvItem, now: i64) -> bool {
        self.requests.lock().await.ask_for(item, now)
    }

    // -------------------------------------------------------------------------
    // Counters
    // -------------------------------------------------------------------------

    pub fn record_recv(&self, bytes: usize, now: i64) {
        self.bytes_recv.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_recv.store(now, Ordering::Relaxed);
    }

    pub fn record_send(&self, bytes: usize, now: i64) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_send.store(now, Ordering::Relaxed);
    }

    /// The send buffer was observed empty at `now`
    pub fn mark_send_empty(&self, now: i64) {
        self.last_send_empty.store(now, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_recv(&self) -> u64 {
        self.bytes_recv.load(Ordering::Relaxed)
    }

    pub fn last_send(&self) -> i64 {
        self.last_send.load(Ordering::Relaxed)
    }

    pub fn last_recv(&self) -> i64 {
        self.last_recv.load(Ordering::Relaxed)
    }

    pub fn last_send_empty(&self) -> i64 {
        self.last_send_empty.load(Ordering::Relaxed)
    }

    /// Inactivity rule the peer currently violates, if any
    pub fn inactivity(&self, now: i64) -> Option<DisconnectReason> {
        if now - self.time_connected <= INITIAL_MESSAGE_TIMEOUT {
            return None;
        }
        let last_send = self.last_send();
        let last_recv = self.last_recv();
        if last_send == 0 || last_recv == 0 {
            return Some(DisconnectReason::NoInitialMessage);
        }
        if now - last_send > INACTIVITY_TIMEOUT
            && now - self.last_send_empty() > INACTIVITY_TIMEOUT
        {
            return Some(DisconnectReason::SendTimeout);
        }
        if now - last_recv > INACTIVITY_TIMEOUT {
            return Some(DisconnectReason::RecvTimeout);
        }
        None
    }

    // -------------------------------------------------------------------------
    // Scoring and flags
    // -------------------------------------------------------------------------

    /// Add to the misbehaviour score; returns the new score
    pub fn add_misbehavior(&self, delta: i32) -> i32 {
        let delta = delta.max(0);
        self.misbehavior.fetch_add(delta, Ordering::AcqRel).saturating_add(delta)
    }

    pub fn misbehavior(&self) -> i32 {
        self.misbehavior.load(Ordering::Acquire)
    }

    pub fn set_verified(&self, verified: bool) {
        self.verified.store(verified, Ordering::Release);
    }

    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::Acquire)
    }

    /// Outbound peers and verified inbound peers
    pub fn is_secured(&self) -> bool {
        !self.inbound || self.is_verified()
    }

    pub fn set_one_shot(&self) {
        self.one_shot.store(true, Ordering::Release);
    }

    pub fn is_one_shot(&self) -> bool {
        self.one_shot.load(Ordering::Acquire)
    }

    /// Claim the right to send our version message; true only once
    pub fn claim_version_send(&self) -> bool {
        !self.version_sent.swap(true, Ordering::AcqRel)
    }

    /// Flag for disconnection; returns false if already flagged
    pub fn disconnect(&self, reason: DisconnectReason) -> bool {
        let flagged = self.disconnect.set(reason).is_ok();
        if flagged {
            log::info!("{}: disconnecting ({})", self.addr_name, reason);
        }
        flagged
    }

    pub fn should_disconnect(&self) -> bool {
        self.disconnect.get().is_some()
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.disconnect.get().copied()
    }

    pub async fn info(&self) -> PeerInfo {
        self.info.read().await.clone()
    }

    pub async fn update_info<F: FnOnce(&mut PeerInfo)>(&self, f: F) {
        f(&mut *self.info.write().await);
    }

    // -------------------------------------------------------------------------
    // Reference counting
    // -------------------------------------------------------------------------

    pub fn add_ref(&self) -> i32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn release(&self) -> i32 {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Keep the peer alive until at least `until`
    pub fn extend_release_time(&self, until: i64) {
        self.release_time.fetch_max(until, Ordering::AcqRel);
    }

    /// Effective reference count at `now`
    pub fn ref_count_at(&self, now: i64) -> i32 {
        let count = self.ref_count.load(Ordering::Acquire).max(0);
        if now < self.release_time.load(Ordering::Acquire) {
            count + 1
        } else {
            count
        }
    }

    pub fn mark_freed(&self) {
        self.freed.store(true, Ordering::Release);
    }

    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    // -------------------------------------------------------------------------
    // Outbound slot
    // -------------------------------------------------------------------------

    /// Hold an outbound slot for the peer's lifetime
    pub async fn set_grant(&self, permit: OwnedSemaphorePermit) {
        *self.grant.lock().await = Some(permit);
    }

    pub async fn has_grant(&self) -> bool {
        self.grant.lock().await.is_some()
    }

    /// Return the outbound slot, if held
    pub async fn release_grant(&self) -> bool {
        self.grant.lock().await.take().is_some()
    }

    pub async fn stats(&self, now: i64) -> PeerStats {
        let info = self.info.read().await;
        PeerStats {
            id: self.id,
            addr: self.addr.to_addr_string(),
            addr_name: self.addr_name.clone(),
            services: info.services.bits(),
            last_send: self.last_send(),
            last_recv: self.last_recv(),
            conn_time: self.time_connected,
            uptime: now - self.time_connected,
            version: info.version,
            user_agent: info.user_agent.clone(),
            inbound: self.inbound,
            start_height: info.start_height,
            misbehavior: self.misbehavior(),
            verified: self.is_verified(),
            bytes_sent: self.bytes_sent(),
            bytes_recv: self.bytes_recv(),
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addr", &self.addr_name)
            .field("inbound", &self.inbound)
            .field("ref_count", &self.ref_count.load(Ordering::Relaxed))
            .field("disconnect", &self.disconnect.get())
            .finish()
    }
}

/// Counted reference to a peer, released on drop
pub struct PeerRef(Arc<Peer>);

impl PeerRef {
    pub fn new(peer: Arc<Peer>) -> Self {
        peer.add_ref();
        Self(peer)
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.0
    }
}

impl Clone for PeerRef {
    fn clone(&self) -> Self {
        Self::new(self.0.clone())
    }
}

impl Deref for PeerRef {
    type Target = Peer;

    fn deref(&self) -> &Peer {
        &self.0
    }
}

impl Drop for PeerRef {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl fmt::Debug for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
