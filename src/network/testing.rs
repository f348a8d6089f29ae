//! In-memory sockets and collaborators for tests

use crate::network::addrman::{AddrCandidate, AddressBook};
use crate::network::address::{NetAddr, ServiceFlags};
use crate::network::config::NetConfig;
use crate::network::peer::PeerError;
use crate::network::peerset::PeerSet;
use crate::network::registry::{StaticRegistry, SyncStatus};
use crate::network::socket::{DialTarget, Dialer, Listener, PeerSocket};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{Interest, Ready};
use tokio::sync::mpsc;

pub fn sock(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

pub fn net(s: &str) -> NetAddr {
    NetAddr::new(sock(s), ServiceFlags::NODE_NETWORK)
}

/// Socket backed by two in-memory queues
#[derive(Debug)]
pub struct MockSocket {
    addr: SocketAddr,
    incoming: Mutex<VecDeque<u8>>,
    written: Mutex<Vec<u8>>,
    closed: AtomicBool,
    broken: AtomicBool,
    unpollable: AtomicBool,
}

impl MockSocket {
    pub fn new(addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            addr,
            incoming: Mutex::new(VecDeque::new()),
            written: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            unpollable: AtomicBool::new(false),
        })
    }

    /// Bytes the remote sends us
    pub fn feed(&self, bytes: &[u8]) {
        self.incoming.lock().unwrap().extend(bytes);
    }

    /// Remote closes its end; reads return 0 once drained
    pub fn close_remote(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Every further read and write fails with a reset
    pub fn break_connection(&self) {
        self.broken.store(true, Ordering::Release);
    }

    /// Every further readiness wait fails with a reset
    pub fn fail_readiness(&self) {
        self.unpollable.store(true, Ordering::Release);
    }

    /// Take everything written so far
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut *self.written.lock().unwrap())
    }

    fn readable(&self) -> bool {
        self.closed.load(Ordering::Acquire)
            || self.broken.load(Ordering::Acquire)
            || !self.incoming.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl PeerSocket for MockSocket {
    async fn ready(&self, interest: Interest) -> io::Result<Ready> {
        if self.unpollable.load(Ordering::Acquire) {
            return Err(io::ErrorKind::ConnectionReset.into());
        }
        let mut ready = Ready::EMPTY;
        if interest.is_readable() && self.readable() {
            ready |= Ready::READABLE;
        }
        if interest.is_writable() {
            ready |= Ready::WRITABLE;
        }
        if ready.is_empty() {
            std::future::pending::<()>().await;
        }
        Ok(ready)
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.broken.load(Ordering::Acquire) {
            return Err(io::ErrorKind::ConnectionReset.into());
        }
        let mut incoming = self.incoming.lock().unwrap();
        if incoming.is_empty() {
            if self.closed.load(Ordering::Acquire) {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(incoming.len());
        for (slot, byte) in buf.iter_mut().zip(incoming.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.broken.load(Ordering::Acquire) {
            return Err(io::ErrorKind::ConnectionReset.into());
        }
        self.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

/// Dialer that hands out mock sockets and records every attempt
#[derive(Debug, Default)]
pub struct MockDialer {
    refused: Mutex<HashSet<String>>,
    dialed: Mutex<Vec<DialTarget>>,
    sockets: Mutex<HashMap<String, Arc<MockSocket>>>,
    /// Address reported for name dials
    resolve_to: Mutex<HashMap<String, SocketAddr>>,
}

impl MockDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refuse(&self, target: &str) {
        self.refused.lock().unwrap().insert(target.to_string());
    }

    pub fn resolve(&self, name: &str, addr: SocketAddr) {
        self.resolve_to.lock().unwrap().insert(name.to_string(), addr);
    }

    pub fn dialed(&self) -> Vec<DialTarget> {
        self.dialed.lock().unwrap().clone()
    }

    pub fn dial_count(&self) -> usize {
        self.dialed.lock().unwrap().len()
    }

    /// Socket created for `target`, if it was dialed
    pub fn socket(&self, target: &str) -> Option<Arc<MockSocket>> {
        self.sockets.lock().unwrap().get(target).cloned()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(
        &self,
        target: &DialTarget,
        _timeout: Duration,
    ) -> Result<Arc<dyn PeerSocket>, PeerError> {
        let key = target.to_string();
        self.dialed.lock().unwrap().push(target.clone());
        if self.refused.lock().unwrap().contains(&key) {
            return Err(PeerError::ConnectionFailed(format!("{} refused", key)));
        }
        let addr = match target {
            DialTarget::Addr(addr) => *addr,
            DialTarget::Name(name) => self
                .resolve_to
                .lock()
                .unwrap()
                .get(name)
                .copied()
                .ok_or_else(|| PeerError::ConnectionFailed(format!("cannot resolve {}", name)))?,
        };
        let socket = MockSocket::new(addr);
        self.sockets.lock().unwrap().insert(key, socket.clone());
        Ok(socket)
    }
}

/// Listener fed through a channel
pub struct MockListener {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<MockSocket>>>,
    addr: SocketAddr,
}

impl MockListener {
    pub fn new(addr: SocketAddr) -> (Self, mpsc::UnboundedSender<Arc<MockSocket>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx: tokio::sync::Mutex::new(rx),
                addr,
            },
            tx,
        )
    }
}

#[async_trait]
impl Listener for MockListener {
    async fn accept(&self) -> io::Result<(Arc<dyn PeerSocket>, SocketAddr)> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(socket) => {
                let addr = socket.peer_addr()?;
                Ok((socket, addr))
            }
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

/// Address book returning a fixed candidate list in rotation
#[derive(Debug, Default)]
pub struct MockAddressBook {
    candidates: Mutex<Vec<AddrCandidate>>,
    cursor: AtomicUsize,
    pub attempts: Mutex<Vec<SocketAddr>>,
    pub connected: Mutex<Vec<SocketAddr>>,
    pub added: Mutex<Vec<NetAddr>>,
    biases: Mutex<Vec<u32>>,
    reconnect: Mutex<HashMap<IpAddr, u64>>,
    verification: Mutex<HashMap<IpAddr, u64>>,
}

impl MockAddressBook {
    pub fn new(candidates: Vec<AddrCandidate>) -> Arc<Self> {
        Arc::new(Self {
            candidates: Mutex::new(candidates),
            ..Default::default()
        })
    }

    pub fn with_addrs(addrs: &[&str]) -> Arc<Self> {
        Self::new(
            addrs
                .iter()
                .map(|a| AddrCandidate {
                    addr: net(a),
                    last_try: None,
                })
                .collect(),
        )
    }

    pub fn biases(&self) -> Vec<u32> {
        self.biases.lock().unwrap().clone()
    }
}

#[async_trait]
impl AddressBook for MockAddressBook {
    async fn select(&self, bias: u32) -> Option<AddrCandidate> {
        self.biases.lock().unwrap().push(bias);
        let candidates = self.candidates.lock().unwrap();
        if candidates.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[i].clone())
    }

    async fn attempt(&self, addr: &SocketAddr) {
        self.attempts.lock().unwrap().push(*addr);
    }

    async fn connected(&self, addr: &SocketAddr) {
        self.connected.lock().unwrap().push(*addr);
    }

    async fn disconnected(&self, _addr: &SocketAddr) {}

    async fn add(&self, addr: NetAddr, _source: Option<IpAddr>) -> bool {
        self.added.lock().unwrap().push(addr);
        true
    }

    async fn size(&self) -> usize {
        self.candidates.lock().unwrap().len()
    }

    async fn get_addr(&self, max: usize) -> Vec<NetAddr> {
        let candidates = self.candidates.lock().unwrap();
        candidates.iter().take(max).map(|c| c.addr.clone()).collect()
    }

    async fn reconnect_token(&self, addr: &SocketAddr) -> Option<u64> {
        self.reconnect.lock().unwrap().get(&addr.ip()).copied()
    }

    async fn set_reconnect_token(&self, addr: &SocketAddr, token: u64) {
        self.reconnect.lock().unwrap().insert(addr.ip(), token);
    }

    async fn verification_token(&self, addr: &SocketAddr) -> Option<u64> {
        self.verification.lock().unwrap().get(&addr.ip()).copied()
    }

    async fn set_verification_token(&self, addr: &SocketAddr, token: u64) {
        self.verification.lock().unwrap().insert(addr.ip(), token);
    }
}

/// Everything a peer set test needs, with handles kept for inspection
pub struct Harness {
    pub peers: Arc<PeerSet>,
    pub dialer: Arc<MockDialer>,
    pub book: Arc<MockAddressBook>,
    pub registry: Arc<StaticRegistry>,
    pub sync: Arc<SyncStatus>,
}

impl Harness {
    pub fn new(config: NetConfig) -> Self {
        Self::with_book(config, MockAddressBook::new(Vec::new()))
    }

    pub fn with_book(config: NetConfig, book: Arc<MockAddressBook>) -> Self {
        let dialer = MockDialer::new();
        let registry = Arc::new(StaticRegistry::default());
        let sync = Arc::new(SyncStatus::default());
        let peers = Arc::new(PeerSet::new(
            config,
            book.clone(),
            dialer.clone(),
            registry.clone(),
            sync.clone(),
        ));
        Self {
            peers,
            dialer,
            book,
            registry,
            sync,
        }
    }
}
