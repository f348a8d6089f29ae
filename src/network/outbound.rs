//! Outbound connection strategy
//!
//! Keeps the outbound slots filled from the address book, one peer per
//! network group, preferring addresses on the default port that have not
//! been tried recently. Also serves one-shot destinations (connect, swap
//! addresses, disconnect) and the fixed connect-only mode.

use crate::network::address::{with_default_port, NetAddr, ServiceFlags};
use crate::network::peerset::PeerSet;
use crate::network::{sleep_or_shutdown, unix_time};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};

/// Address book draws per iteration before giving up
pub const MAX_SELECT_TRIES: u32 = 100;

/// Addresses tried this recently are skipped early in an iteration
pub const RECENT_TRY_WINDOW: i64 = 600;

/// Draws after which recently tried addresses are accepted
pub const RECENT_TRY_THRESHOLD: u32 = 30;

/// Draws after which non-default ports are accepted
pub const NON_DEFAULT_PORT_THRESHOLD: u32 = 50;

/// Pause between connection attempts
pub const CONNECT_PACING: Duration = Duration::from_millis(500);

/// Seconds between DNS seed lookups while the address book stays empty
const SEED_RETRY: i64 = 60;

/// Wait for an outbound slot, or `None` once shutdown starts
pub(crate) async fn acquire_slot(
    slots: &Arc<Semaphore>,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<OwnedSemaphorePermit> {
    if *shutdown.borrow() {
        return None;
    }
    tokio::select! {
        permit = slots.clone().acquire_owned() => permit.ok(),
        _ = shutdown.changed() => None,
    }
}

/// Destinations to connect to once, exchange addresses with, and drop
pub type OneShotQueue = Arc<Mutex<VecDeque<String>>>;

/// Fills outbound slots from the address book
pub struct OutboundConnector {
    peers: Arc<PeerSet>,
    slots: Arc<Semaphore>,
    one_shots: OneShotQueue,
    pacing: Duration,
    last_seed: Option<i64>,
}

impl OutboundConnector {
    pub fn new(peers: Arc<PeerSet>, slots: Arc<Semaphore>) -> Self {
        Self {
            peers,
            slots,
            one_shots: Arc::new(Mutex::new(VecDeque::new())),
            pacing: CONNECT_PACING,
            last_seed: None,
        }
    }

    /// Override the pause between attempts
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn one_shots(&self) -> OneShotQueue {
        self.one_shots.clone()
    }

    pub async fn add_one_shot(&self, dest: impl Into<String>) {
        self.one_shots.lock().await.push_back(dest.into());
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        log::info!("Outbound connector started");
        if !self.peers.config().connect_only.is_empty() {
            self.run_connect_only(shutdown).await;
            return;
        }

        loop {
            self.process_one_shot(unix_time()).await;
            if sleep_or_shutdown(&mut shutdown, self.pacing).await {
                break;
            }
            let Some(grant) = acquire_slot(&self.slots, &mut shutdown).await else {
                break;
            };
            if *shutdown.borrow() {
                break;
            }

            let now = unix_time();
            self.seed_if_empty(now).await;
            self.connect_next(grant, now).await;
        }
        log::info!("Outbound connector stopped");
    }

    async fn run_connect_only(&mut self, mut shutdown: watch::Receiver<bool>) {
        let dests = self.peers.config().connect_only.clone();
        log::info!("Connecting only to {} configured nodes", dests.len());
        loop {
            self.process_one_shot(unix_time()).await;
            for dest in &dests {
                self.connect_dest(dest, None, false, unix_time()).await;
                if sleep_or_shutdown(&mut shutdown, self.pacing).await {
                    return;
                }
            }
            if sleep_or_shutdown(&mut shutdown, self.pacing).await {
                return;
            }
        }
    }

    /// Connect to a destination given as "host[:port]"
    async fn connect_dest(
        &self,
        dest: &str,
        grant: Option<OwnedSemaphorePermit>,
        one_shot: bool,
        now: i64,
    ) -> bool {
        let port = self.peers.config().default_port;
        let target = with_default_port(dest, port);
        match target.parse::<SocketAddr>() {
            Ok(sock) => {
                let addr = NetAddr::new(sock, ServiceFlags::NODE_NETWORK);
                self.peers
                    .open_connection(&addr, None, grant, one_shot, now)
                    .await
            }
            Err(_) => {
                let placeholder = NetAddr::new(
                    SocketAddr::from(([0, 0, 0, 0], port)),
                    ServiceFlags::NODE_NETWORK,
                );
                self.peers
                    .open_connection(&placeholder, Some(dest), grant, one_shot, now)
                    .await
            }
        }
    }

    /// Serve one queued one-shot destination if a slot is free
    ///
    /// The destination goes back on the queue when no slot is free or the
    /// connection fails.
    pub async fn process_one_shot(&self, now: i64) -> bool {
        let Some(dest) = self.one_shots.lock().await.pop_front() else {
            return false;
        };
        let connected = match self.slots.clone().try_acquire_owned() {
            Ok(grant) => self.connect_dest(&dest, Some(grant), true, now).await,
            Err(_) => false,
        };
        if !connected {
            self.one_shots.lock().await.push_back(dest);
        }
        connected
    }

    /// Resolve the DNS seeds when the address book is empty
    pub async fn seed_if_empty(&mut self, now: i64) -> usize {
        let config = self.peers.config();
        if config.dns_seeds.is_empty() || self.peers.addrman().size().await > 0 {
            return 0;
        }
        if self.last_seed.is_some_and(|t| now - t < SEED_RETRY) {
            return 0;
        }
        self.last_seed = Some(now);
        if !config.name_lookup {
            log::warn!("Address book empty and name lookups disabled, not seeding");
            return 0;
        }

        let mut added = 0;
        for seed in &config.dns_seeds {
            let target = with_default_port(seed, config.default_port);
            log::info!("Resolving DNS seed: {}", target);
            let resolved = tokio::net::lookup_host(target.as_str()).await;
            match resolved {
                Ok(addrs) => {
                    for sock in addrs {
                        let addr = NetAddr::new(sock, ServiceFlags::NODE_NETWORK);
                        if self.peers.addrman().add(addr, None).await {
                            added += 1;
                        }
                    }
                }
                Err(e) => log::warn!("Failed to resolve DNS seed {}: {}", seed, e),
            };
        }
        log::info!("{} addresses found from DNS seeds", added);
        added
    }

    /// Draw an acceptable address from the book
    pub async fn select_candidate(&self, now: i64) -> Option<NetAddr> {
        let groups = self.peers.outbound_groups().await;
        let (_, outbound) = self.peers.counts().await;
        let bias = 10 + outbound.min(8) as u32 * 10;
        let default_port = self.peers.config().default_port;

        for tries in 1..=MAX_SELECT_TRIES {
            tokio::task::yield_now().await;
            let candidate = self.peers.addrman().select(bias).await?;
            let addr = candidate.addr;

            if !addr.is_valid()
                || groups.contains(&addr.group())
                || self.peers.is_local(&addr).await
                || self.peers.local().is_limited(addr.network()).await
            {
                continue;
            }
            if candidate
                .last_try
                .is_some_and(|t| now - t < RECENT_TRY_WINDOW)
                && tries < RECENT_TRY_THRESHOLD
            {
                continue;
            }
            if addr.port() != default_port && tries < NON_DEFAULT_PORT_THRESHOLD {
                continue;
            }
            return Some(addr);
        }
        None
    }

    /// Pick a candidate and connect, handing it the slot grant
    pub async fn connect_next(&self, grant: OwnedSemaphorePermit, now: i64) -> bool {
        match self.select_candidate(now).await {
            Some(addr) => {
                self.peers
                    .open_connection(&addr, None, Some(grant), false, now)
                    .await
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::addrman::AddrCandidate;
    use crate::network::address::Network;
    use crate::network::config::NetConfig;
    use crate::network::testing::{net, Harness, MockAddressBook};

    const NOW: i64 = 1_700_000_000;

    fn connector(h: &Harness, slots: usize) -> OutboundConnector {
        OutboundConnector::new(h.peers.clone(), Arc::new(Semaphore::new(slots)))
            .with_pacing(Duration::ZERO)
    }

    async fn fill(c: &OutboundConnector, rounds: usize) {
        for _ in 0..rounds {
            if let Ok(grant) = c.slots.clone().try_acquire_owned() {
                c.connect_next(grant, NOW).await;
            }
        }
    }

    #[tokio::test]
    async fn test_one_connection_per_group() {
        let book = MockAddressBook::with_addrs(&[
            "1.2.0.1:8333",
            "1.2.0.2:8333",
            "1.2.3.3:8333",
            "1.2.4.4:8333",
            "1.2.5.5:8333",
        ]);
        let h = Harness::with_book(NetConfig::default(), book);
        let c = connector(&h, 8);

        fill(&c, 5).await;
        assert_eq!(h.peers.counts().await, (0, 1));
        assert_eq!(c.slots.available_permits(), 7);
    }

    #[tokio::test]
    async fn test_distinct_groups_all_connected() {
        let book = MockAddressBook::with_addrs(&["1.2.0.1:8333", "3.4.0.1:8333", "5.6.0.1:8333"]);
        let h = Harness::with_book(NetConfig::default(), book);
        let c = connector(&h, 8);

        fill(&c, 3).await;
        assert_eq!(h.peers.counts().await, (0, 3));
        assert_eq!(h.peers.outbound_groups().await.len(), 3);
    }

    #[tokio::test]
    async fn test_bias_grows_with_outbound_count() {
        let book = MockAddressBook::with_addrs(&["1.2.0.1:8333", "3.4.0.1:8333"]);
        let h = Harness::with_book(NetConfig::default(), book.clone());
        let c = connector(&h, 8);

        fill(&c, 2).await;
        assert_eq!(book.biases(), vec![10, 20]);
    }

    #[tokio::test]
    async fn test_non_default_port_needs_fifty_draws() {
        let book = MockAddressBook::with_addrs(&["1.2.0.1:9999"]);
        let h = Harness::with_book(NetConfig::default(), book.clone());
        let c = connector(&h, 8);

        assert_eq!(c.select_candidate(NOW).await, Some(net("1.2.0.1:9999")));
        assert_eq!(book.biases().len(), NON_DEFAULT_PORT_THRESHOLD as usize);
    }

    #[tokio::test]
    async fn test_recently_tried_needs_thirty_draws() {
        let book = MockAddressBook::new(vec![AddrCandidate {
            addr: net("1.2.0.1:8333"),
            last_try: Some(NOW - 10),
        }]);
        let h = Harness::with_book(NetConfig::default(), book.clone());
        let c = connector(&h, 8);

        assert!(c.select_candidate(NOW).await.is_some());
        assert_eq!(book.biases().len(), RECENT_TRY_THRESHOLD as usize);
    }

    #[tokio::test]
    async fn test_gives_up_after_hundred_draws() {
        let book = MockAddressBook::with_addrs(&["127.0.0.1:8333"]);
        let h = Harness::with_book(NetConfig::default(), book.clone());
        let c = connector(&h, 8);

        assert!(c.select_candidate(NOW).await.is_none());
        assert_eq!(book.biases().len(), MAX_SELECT_TRIES as usize);
    }

    #[tokio::test]
    async fn test_limited_network_skipped() {
        let book = MockAddressBook::with_addrs(&["1.2.0.1:8333"]);
        let h = Harness::with_book(NetConfig::default(), book);
        h.peers.local().set_limited(Network::Ipv4, true).await;
        let c = connector(&h, 8);
        assert!(c.select_candidate(NOW).await.is_none());
    }

    #[tokio::test]
    async fn test_empty_book_abandons() {
        let h = Harness::new(NetConfig::default());
        let c = connector(&h, 8);
        let grant = c.slots.clone().try_acquire_owned().unwrap();
        assert!(!c.connect_next(grant, NOW).await);
        assert_eq!(c.slots.available_permits(), 8);
    }

    #[tokio::test]
    async fn test_one_shot_requeued_without_slot() {
        let h = Harness::new(NetConfig::default());
        let c = connector(&h, 1);
        c.add_one_shot("9.9.9.9").await;

        let held = c.slots.clone().try_acquire_owned().unwrap();
        assert!(!c.process_one_shot(NOW).await);
        assert_eq!(c.one_shots().lock().await.len(), 1);

        drop(held);
        assert!(c.process_one_shot(NOW).await);
        assert!(c.one_shots().lock().await.is_empty());
        let peer = h.peers.find_by_addr(&"9.9.9.9:8333".parse().unwrap()).await.unwrap();
        assert!(peer.is_one_shot());
        assert!(peer.has_grant().await);
    }

    #[tokio::test]
    async fn test_dns_seeds_fill_empty_book() {
        let config = NetConfig {
            dns_seeds: vec!["8.8.8.8".into()],
            ..Default::default()
        };
        let h = Harness::new(config);
        let mut c = connector(&h, 8);

        assert_eq!(c.seed_if_empty(NOW).await, 1);
        assert_eq!(h.book.added.lock().unwrap()[0].addr, "8.8.8.8:8333".parse().unwrap());
        // book is still empty for the mock, but the retry window holds
        assert_eq!(c.seed_if_empty(NOW + 1).await, 0);
    }

    #[tokio::test]
    async fn test_connect_only_mode() {
        let config = NetConfig {
            connect_only: vec!["4.4.4.4".into(), "5.5.5.5:7000".into()],
            ..Default::default()
        };
        let h = Harness::new(config);
        let c = connector(&h, 8);
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(c.run(rx));
        for _ in 0..100 {
            if h.peers.len().await == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        task.await.unwrap();

        assert!(h.peers.find_by_addr(&"4.4.4.4:8333".parse().unwrap()).await.is_some());
        assert!(h.peers.find_by_addr(&"5.5.5.5:7000".parse().unwrap()).await.is_some());
    }

    #[tokio::test]
    async fn test_run_stops_when_slots_closed() {
        let h = Harness::new(NetConfig::default());
        let slots = Arc::new(Semaphore::new(0));
        let c = OutboundConnector::new(h.peers.clone(), slots.clone()).with_pacing(Duration::ZERO);
        let (_tx, rx) = watch::channel(false);

        let task = tokio::spawn(c.run(rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        slots.close();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
