//! Address Manager (AddrMan) for peer discovery
//!
//! Bitcoin-style address manager that maintains:
//! - New addresses: Recently heard but not yet connected
//! - Tried addresses: Successfully connected peers
//!
//! Uses bucketed storage for eclipse attack resistance. The connection
//! manager only talks to it through the [`AddressBook`] trait.

use crate::network::address::{net_group, NetAddr};
use crate::network::message::MAX_ADDR_PER_MESSAGE;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use thiserror::Error;
use tokio::sync::RwLock;

// =============================================================================
// Constants
// =============================================================================

/// Number of buckets for new addresses
const NEW_BUCKET_COUNT: usize = 256;

/// Number of entries per new bucket
const NEW_BUCKET_SIZE: usize = 64;

/// Number of buckets for tried addresses
const TRIED_BUCKET_COUNT: usize = 64;

/// Number of entries per tried bucket
const TRIED_BUCKET_SIZE: usize = 64;

/// Minimum gap between two "last seen" refreshes of a connected address
const CONNECTED_UPDATE_INTERVAL: i64 = 20 * 60;

const DAY: i64 = 24 * 60 * 60;

/// Addresses unseen for this long are dropped from gossip and selection
const HORIZON: i64 = 30 * DAY;

/// Attempts without any success before an address is given up
const RETRIES: u32 = 3;

/// Failures allowed after the last success, once that success is a week old
const MAX_FAILURES: u32 = 10;
const MIN_FAIL_AGE: i64 = 7 * DAY;

/// Addresses from one source group spread over this many new buckets
const NEW_BUCKETS_PER_SOURCE_GROUP: u64 = 32;

/// An address spreads over this many tried buckets
const TRIED_BUCKETS_PER_GROUP: u64 = 8;

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum AddrStoreError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

// =============================================================================
// Address Book contract
// =============================================================================

/// An address proposed for an outbound connection
#[derive(Debug, Clone, PartialEq)]
pub struct AddrCandidate {
    pub addr: NetAddr,
    /// Last connection attempt (unix seconds)
    pub last_try: Option<i64>,
}

/// Store of known peer addresses, as seen by the connection manager
#[async_trait]
pub trait AddressBook: Send + Sync {
    /// Pick an address to connect to; `bias` is the percentage weight given
    /// to addresses we connected to successfully before
    async fn select(&self, bias: u32) -> Option<AddrCandidate>;

    /// We are about to dial `addr`
    async fn attempt(&self, addr: &SocketAddr);

    /// `addr` completed a handshake with us
    async fn connected(&self, addr: &SocketAddr);

    /// Connection to `addr` ended
    async fn disconnected(&self, addr: &SocketAddr);

    /// Learn about `addr` from `source`; returns whether it was new
    async fn add(&self, addr: NetAddr, source: Option<IpAddr>) -> bool;

    /// Number of known addresses
    async fn size(&self) -> usize;

    /// Random sample of addresses to gossip
    async fn get_addr(&self, max: usize) -> Vec<NetAddr>;

    /// Token to present when reconnecting to `addr`
    async fn reconnect_token(&self, addr: &SocketAddr) -> Option<u64>;

    /// Remember a token `addr` issued to us
    async fn set_reconnect_token(&self, addr: &SocketAddr, token: u64);

    /// Token we issued to `addr` and expect back on reconnection
    async fn verification_token(&self, addr: &SocketAddr) -> Option<u64>;

    /// Remember the token we issued to `addr`
    async fn set_verification_token(&self, addr: &SocketAddr, token: u64);
}

// =============================================================================
// Address Entry
// =============================================================================

/// Extended address entry with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddrEntry {
    /// The network address
    pub addr: NetAddr,
    /// Source peer that told us about this address
    pub source: Option<IpAddr>,
    /// Number of connection attempts since the last success
    pub attempts: u32,
    /// Number of successful connections
    pub successes: u32,
    /// Last successful connection time (unix seconds)
    pub last_success: Option<i64>,
    /// Last connection attempt time (unix seconds)
    pub last_attempt: Option<i64>,
    /// Is this address in the tried table?
    pub in_tried: bool,
    /// Reference count (how many sources reported this)
    pub ref_count: u32,
}

impl AddrEntry {
    pub fn new(addr: NetAddr, source: Option<IpAddr>) -> Self {
        Self {
            addr,
            source,
            attempts: 0,
            successes: 0,
            last_success: None,
            last_attempt: None,
            in_tried: false,
            ref_count: 1,
        }
    }

    /// Not worth selecting or gossiping any more
    pub fn is_terrible(&self, now: i64) -> bool {
        // never drop an address tried in the last minute
        if self.last_attempt.is_some_and(|t| now - t < 60) {
            return false;
        }
        if self.addr.timestamp > now + 10 * 60 || now - self.addr.timestamp > HORIZON {
            return true;
        }
        match self.last_success {
            None => self.attempts >= RETRIES,
            Some(success) => now - success > MIN_FAIL_AGE && self.attempts >= MAX_FAILURES,
        }
    }

    /// Relative selection weight
    pub fn chance(&self, now: i64) -> f64 {
        let mut chance = 1.0;
        // deprioritise very recent attempts
        if self.last_attempt.is_some_and(|t| now - t < 10 * 60) {
            chance *= 0.01;
        }
        chance * 0.66_f64.powi(self.attempts.min(8) as i32)
    }

    /// Record a connection attempt
    pub fn attempt(&mut self, now: i64) {
        self.attempts += 1;
        self.last_attempt = Some(now);
    }

    /// Record a successful connection
    pub fn good(&mut self, now: i64) {
        self.successes += 1;
        self.last_success = Some(now);
        self.attempts = 0; // Reset failure count on success
    }
}

/// On-disk form of the address manager
#[derive(Debug, Default, Serialize, Deserialize)]
struct PeersFile {
    entries: Vec<AddrEntry>,
    reconnect_tokens: HashMap<String, u64>,
    verification_tokens: HashMap<String, u64>,
}

// =============================================================================
// Address Manager
// =============================================================================

/// Bitcoin-style address manager for peer discovery
#[derive(Debug)]
pub struct AddrManager {
    /// Map from address string to entry
    by_addr: HashMap<String, AddrEntry>,

    /// New table buckets (recently heard addresses)
    new_table: Vec<Vec<String>>,

    /// Tried table buckets (successfully connected addresses)
    tried_table: Vec<Vec<String>>,

    /// Addresses we're currently connected to
    connected: HashSet<String>,

    /// Tokens peers issued to us, keyed by their IP
    reconnect_tokens: HashMap<String, u64>,

    /// Tokens we issued to peers, keyed by their IP
    verification_tokens: HashMap<String, u64>,

    /// Random key for bucket assignment
    key: u64,
}

impl AddrManager {
    /// Create a new address manager
    pub fn new() -> Self {
        Self {
            by_addr: HashMap::new(),
            new_table: vec![Vec::with_capacity(NEW_BUCKET_SIZE); NEW_BUCKET_COUNT],
            tried_table: vec![Vec::with_capacity(TRIED_BUCKET_SIZE); TRIED_BUCKET_COUNT],
            connected: HashSet::new(),
            reconnect_tokens: HashMap::new(),
            verification_tokens: HashMap::new(),
            key: rand::thread_rng().gen(),
        }
    }

    /// Get number of addresses
    pub fn size(&self) -> usize {
        self.by_addr.len()
    }

    /// Get number of new addresses
    pub fn new_count(&self) -> usize {
        self.by_addr.values().filter(|e| !e.in_tried).count()
    }

    /// Get number of tried addresses
    pub fn tried_count(&self) -> usize {
        self.by_addr.values().filter(|e| e.in_tried).count()
    }

    /// Add a new address
    pub fn add(&mut self, addr: NetAddr, source: Option<IpAddr>) -> bool {
        let key = addr.to_addr_string();

        // Don't add unroutable addresses
        if !addr.is_routable() {
            return false;
        }

        // Check if already exists
        if let Some(entry) = self.by_addr.get_mut(&key) {
            entry.ref_count += 1;
            entry.addr.services |= addr.services;
            // Update timestamp if newer
            if addr.timestamp > entry.addr.timestamp {
                entry.addr.timestamp = addr.timestamp;
            }
            return false;
        }

        self.insert_entry(key, AddrEntry::new(addr, source));
        true
    }

    /// Mark address as good (successful connection)
    pub fn good(&mut self, addr: &str, now: i64) {
        if let Some(entry) = self.by_addr.get_mut(addr) {
            entry.good(now);

            // Move to tried table if not already there
            if !entry.in_tried {
                self.make_tried(addr);
            }
        }
    }

    /// Mark address as attempted
    pub fn attempt(&mut self, addr: &str, now: i64) {
        if let Some(entry) = self.by_addr.get_mut(addr) {
            entry.attempt(now);
        }
    }

    /// Mark address as connected
    pub fn connected(&mut self, addr: &str, now: i64) {
        self.connected.insert(addr.to_string());
        if let Some(entry) = self.by_addr.get_mut(addr) {
            if now - entry.addr.timestamp > CONNECTED_UPDATE_INTERVAL {
                entry.addr.timestamp = now;
            }
        }
    }

    /// Mark address as disconnected
    pub fn disconnected(&mut self, addr: &str) {
        self.connected.remove(addr);
    }

    /// Select an address to connect to
    ///
    /// `tried_bias` is the percentage chance of drawing from the tried table
    /// when both tables have candidates.
    pub fn select(&self, tried_bias: u32) -> Option<AddrCandidate> {
        self.select_at(tried_bias, crate::network::unix_time())
    }

    pub fn select_at(&self, tried_bias: u32, now: i64) -> Option<AddrCandidate> {
        let mut rng = rand::thread_rng();

        let new_count = self.new_count();
        let tried_count = self.tried_count();

        // Decide whether to pick from new or tried table
        let use_tried = if tried_count == 0 {
            false
        } else if new_count == 0 {
            true
        } else {
            rng.gen_range(0..100) < tried_bias.min(100)
        };

        // Collect eligible addresses
        let eligible: Vec<_> = self
            .by_addr
            .iter()
            .filter(|(k, e)| {
                !self.connected.contains(*k) && !e.is_terrible(now) && e.in_tried == use_tried
            })
            .map(|(_, e)| e)
            .collect();

        if eligible.is_empty() {
            return None;
        }

        // Weighted random selection based on chance
        let total_weight: f64 = eligible.iter().map(|e| e.chance(now)).sum();
        let mut target = rng.gen::<f64>() * total_weight;

        let chosen = eligible
            .iter()
            .find(|e| {
                target -= e.chance(now);
                target <= 0.0
            })
            .or_else(|| eligible.first())?;

        Some(AddrCandidate {
            addr: chosen.addr.clone(),
            last_try: chosen.last_attempt,
        })
    }

    /// Random sample of live addresses for a `getaddr` reply
    pub fn get_addr(&self, count: usize) -> Vec<NetAddr> {
        let now = crate::network::unix_time();
        let mut addrs: Vec<NetAddr> = self
            .by_addr
            .values()
            .filter(|e| !e.is_terrible(now))
            .map(|e| e.addr.clone())
            .collect();
        addrs.shuffle(&mut rand::thread_rng());
        addrs.truncate(count.min(MAX_ADDR_PER_MESSAGE));
        addrs
    }

    pub fn reconnect_token(&self, ip: &IpAddr) -> Option<u64> {
        self.reconnect_tokens.get(&ip.to_string()).copied()
    }

    pub fn set_reconnect_token(&mut self, ip: IpAddr, token: u64) {
        self.reconnect_tokens.insert(ip.to_string(), token);
    }

    pub fn verification_token(&self, ip: &IpAddr) -> Option<u64> {
        self.verification_tokens.get(&ip.to_string()).copied()
    }

    pub fn set_verification_token(&mut self, ip: IpAddr, token: u64) {
        self.verification_tokens.insert(ip.to_string(), token);
    }

    /// Write the address table to `path` as JSON
    pub fn save(&self, path: &Path) -> Result<(), AddrStoreError> {
        let file = PeersFile {
            entries: self.by_addr.values().cloned().collect(),
            reconnect_tokens: self.reconnect_tokens.clone(),
            verification_tokens: self.verification_tokens.clone(),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write to a temp file first so a crash never leaves half a file
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&file)?)?;
        fs::rename(&tmp, path)?;

        log::debug!("Saved {} addresses to {}", file.entries.len(), path.display());
        Ok(())
    }

    /// Load addresses previously written by [`AddrManager::save`]
    pub fn load(&mut self, path: &Path) -> Result<usize, AddrStoreError> {
        let data = fs::read(path)?;
        let file: PeersFile = serde_json::from_slice(&data)?;

        let mut loaded = 0;
        for entry in file.entries {
            let key = entry.addr.to_addr_string();
            if !entry.addr.is_routable() || self.by_addr.contains_key(&key) {
                continue;
            }
            let in_tried = entry.in_tried;
            self.insert_entry(key.clone(), AddrEntry { in_tried: false, ..entry });
            if in_tried {
                self.make_tried(&key);
            }
            loaded += 1;
        }
        self.reconnect_tokens.extend(file.reconnect_tokens);
        self.verification_tokens.extend(file.verification_tokens);

        log::info!("Loaded {} addresses from {}", loaded, path.display());
        Ok(loaded)
    }

    // =========================================================================
    // Private helpers
    // =========================================================================

    fn insert_entry(&mut self, key: String, entry: AddrEntry) {
        let bucket = self.new_bucket(&entry.addr, entry.source);
        self.by_addr.insert(key.clone(), entry);
        if self.new_table[bucket].len() < NEW_BUCKET_SIZE {
            self.new_table[bucket].push(key);
        }
    }

    /// New bucket: a source group only reaches a few buckets, so a single
    /// peer cannot flood the table
    fn new_bucket(&self, addr: &NetAddr, source: Option<IpAddr>) -> usize {
        let source_group = source.map(|ip| net_group(&ip).to_string()).unwrap_or_default();
        let slot = self.keyed_hash(&[addr.group().to_string().as_bytes(), source_group.as_bytes()])
            % NEW_BUCKETS_PER_SOURCE_GROUP;
        let bucket = self.keyed_hash(&[source_group.as_bytes(), &slot.to_le_bytes()]);
        (bucket % NEW_BUCKET_COUNT as u64) as usize
    }

    /// Tried bucket: addresses of one group share a few buckets
    fn tried_bucket(&self, addr: &NetAddr) -> usize {
        let group = addr.group().to_string();
        let slot = self.keyed_hash(&[addr.to_addr_string().as_bytes()]) % TRIED_BUCKETS_PER_GROUP;
        let bucket = self.keyed_hash(&[group.as_bytes(), &slot.to_le_bytes()]);
        (bucket % TRIED_BUCKET_COUNT as u64) as usize
    }

    fn keyed_hash(&self, parts: &[&[u8]]) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.key.to_le_bytes());
        for part in parts {
            hasher.update((part.len() as u32).to_le_bytes());
            hasher.update(part);
        }
        let digest = hasher.finalize();
        let mut first = [0u8; 8];
        first.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(first)
    }

    /// Move an entry from the new table into the tried table
    fn make_tried(&mut self, key: &str) {
        let Some(entry) = self.by_addr.get_mut(key) else {
            return;
        };
        if entry.in_tried {
            return;
        }
        entry.in_tried = true;
        let addr = entry.addr.clone();

        for bucket in &mut self.new_table {
            bucket.retain(|k| k != key);
        }
        let bucket = self.tried_bucket(&addr);
        if self.tried_table[bucket].len() < TRIED_BUCKET_SIZE {
            self.tried_table[bucket].push(key.to_string());
        }
    }
}

impl Default for AddrManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AddressBook for RwLock<AddrManager> {
    async fn select(&self, bias: u32) -> Option<AddrCandidate> {
        self.read().await.select(bias)
    }

    async fn attempt(&self, addr: &SocketAddr) {
        let now = crate::network::unix_time();
        self.write().await.attempt(&addr.to_string(), now);
    }

    async fn connected(&self, addr: &SocketAddr) {
        let now = crate::network::unix_time();
        let mut mgr = self.write().await;
        let key = addr.to_string();
        mgr.connected(&key, now);
        mgr.good(&key, now);
    }

    async fn disconnected(&self, addr: &SocketAddr) {
        self.write().await.disconnected(&addr.to_string());
    }

    async fn add(&self, addr: NetAddr, source: Option<IpAddr>) -> bool {
        self.write().await.add(addr, source)
    }

    async fn size(&self) -> usize {
        self.read().await.size()
    }

    async fn get_addr(&self, max: usize) -> Vec<NetAddr> {
        self.read().await.get_addr(max)
    }

    async fn reconnect_token(&self, addr: &SocketAddr) -> Option<u64> {
        self.read().await.reconnect_token(&addr.ip())
    }

    async fn set_reconnect_token(&self, addr: &SocketAddr, token: u64) {
        self.write().await.set_reconnect_token(addr.ip(), token);
    }

    async fn verification_token(&self, addr: &SocketAddr) -> Option<u64> {
        self.read().await.verification_token(&addr.ip())
    }

    async fn set_verification_token(&self, addr: &SocketAddr, token: u64) {
        self.write().await.set_verification_token(addr.ip(), token);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::address::ServiceFlags;

    fn net(s: &str) -> NetAddr {
        NetAddr::from_addr_str(s, ServiceFlags::NODE_NETWORK).unwrap()
    }

    #[test]
    fn test_add_address() {
        let mut mgr = AddrManager::new();

        let addr = net("8.8.8.8:8333");
        assert!(mgr.add(addr.clone(), None));

        // Adding same address again should return false
        assert!(!mgr.add(addr, None));

        assert_eq!(mgr.size(), 1);
        assert_eq!(mgr.new_count(), 1);
        assert_eq!(mgr.tried_count(), 0);
    }

    #[test]
    fn test_unroutable_rejected() {
        let mut mgr = AddrManager::new();

        assert!(!mgr.add(net("127.0.0.1:8333"), None));
        assert!(!mgr.add(net("10.0.0.1:8333"), None));

        assert_eq!(mgr.size(), 0);
    }

    #[test]
    fn test_good_moves_to_tried() {
        let mut mgr = AddrManager::new();

        mgr.add(net("8.8.8.8:8333"), None);
        mgr.good("8.8.8.8:8333", 1_000);

        assert_eq!(mgr.new_count(), 0);
        assert_eq!(mgr.tried_count(), 1);
    }

    #[test]
    fn test_select_reports_last_try() {
        let mut mgr = AddrManager::new();

        mgr.add(net("1.1.1.1:8333"), None);
        mgr.attempt("1.1.1.1:8333", 5_000);

        let selected = mgr.select(50).unwrap();
        assert_eq!(selected.addr.to_addr_string(), "1.1.1.1:8333");
        assert_eq!(selected.last_try, Some(5_000));
    }

    #[test]
    fn test_select_skips_connected() {
        let mut mgr = AddrManager::new();

        mgr.add(net("1.1.1.1:8333"), None);
        mgr.connected("1.1.1.1:8333", 1_000);

        assert!(mgr.select(50).is_none());
        mgr.disconnected("1.1.1.1:8333");
        assert!(mgr.select(50).is_some());
    }

    #[test]
    fn test_full_bias_prefers_tried() {
        let mut mgr = AddrManager::new();

        mgr.add(net("1.1.1.1:8333"), None);
        mgr.add(net("8.8.8.8:8333"), None);
        mgr.good("8.8.8.8:8333", 1_000);

        for _ in 0..20 {
            let selected = mgr.select(100).unwrap();
            assert_eq!(selected.addr.to_addr_string(), "8.8.8.8:8333");
        }
        for _ in 0..20 {
            let selected = mgr.select(0).unwrap();
            assert_eq!(selected.addr.to_addr_string(), "1.1.1.1:8333");
        }
    }

    #[test]
    fn test_one_source_reaches_few_new_buckets() {
        let mut mgr = AddrManager::new();
        let source: IpAddr = "9.9.9.9".parse().unwrap();

        for a in 1..=50u8 {
            for b in 1..=10u8 {
                mgr.add(net(&format!("{}.{}.1.1:8333", a, b)), Some(source));
            }
        }
        let used = mgr.new_table.iter().filter(|b| !b.is_empty()).count();
        assert!(used <= NEW_BUCKETS_PER_SOURCE_GROUP as usize);
    }

    #[test]
    fn test_terrible_addresses() {
        let now = 1_700_000_000;
        let mut entry = AddrEntry::new(net("8.8.8.8:8333"), None);
        entry.addr.timestamp = now;
        assert!(!entry.is_terrible(now));

        for _ in 0..RETRIES {
            entry.attempt(now - 120);
        }
        assert!(entry.is_terrible(now));
        // just tried, keep it for now
        assert!(!entry.is_terrible(now - 100));

        let mut stale = AddrEntry::new(net("8.8.4.4:8333"), None);
        stale.addr.timestamp = now - HORIZON - 1;
        assert!(stale.is_terrible(now));
    }

    #[test]
    fn test_get_addr() {
        let mut mgr = AddrManager::new();

        for i in 1..10 {
            mgr.add(net(&format!("8.8.8.{}:8333", i)), None);
        }

        let addrs = mgr.get_addr(5);
        assert_eq!(addrs.len(), 5);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");

        let mut mgr = AddrManager::new();
        mgr.add(net("1.1.1.1:8333"), None);
        mgr.add(net("8.8.8.8:8333"), None);
        mgr.good("8.8.8.8:8333", 1_000);
        mgr.set_verification_token("8.8.8.8".parse().unwrap(), 42);
        mgr.save(&path).unwrap();

        let mut restored = AddrManager::new();
        assert_eq!(restored.load(&path).unwrap(), 2);
        assert_eq!(restored.tried_count(), 1);
        assert_eq!(restored.new_count(), 1);
        assert_eq!(
            restored.verification_token(&"8.8.8.8".parse().unwrap()),
            Some(42)
        );
    }

    #[tokio::test]
    async fn test_address_book_tokens_keyed_by_ip() {
        let book = RwLock::new(AddrManager::new());
        let first: SocketAddr = "8.8.8.8:50000".parse().unwrap();
        let second: SocketAddr = "8.8.8.8:50001".parse().unwrap();

        book.set_verification_token(&first, 7).await;
        assert_eq!(book.verification_token(&second).await, Some(7));
        assert_eq!(book.reconnect_token(&second).await, None);
    }
}
