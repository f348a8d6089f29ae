//! Banned address tracking
//!
//! Maps an IP address to the time its ban expires. Expiry is lazy: an entry
//! whose time has passed simply stops counting as banned, `sweep` only frees
//! the memory.

use std::collections::HashMap;
use std::net::IpAddr;
use tokio::sync::RwLock;

use crate::network::address::canonical_ip;

/// In-memory ban list, guarded by its own lock
#[derive(Debug, Default)]
pub struct BanList {
    entries: RwLock<HashMap<IpAddr, i64>>,
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ban `ip` until `until` (unix seconds)
    ///
    /// An existing ban that lasts longer is left untouched.
    pub async fn ban(&self, ip: IpAddr, until: i64) {
        let mut entries = self.entries.write().await;
        let expiry = entries.entry(canonical_ip(ip)).or_insert(until);
        if *expiry < until {
            *expiry = until;
        }
    }

    /// Ban `ip` for `duration` seconds starting at `now`
    pub async fn ban_for(&self, ip: IpAddr, duration: i64, now: i64) -> i64 {
        let until = now.saturating_add(duration);
        self.ban(ip, until).await;
        log::info!("Banned {} until {}", ip, until);
        until
    }

    /// Whether `ip` is banned at time `now`
    pub async fn is_banned_at(&self, ip: &IpAddr, now: i64) -> bool {
        let entries = self.entries.read().await;
        entries
            .get(&canonical_ip(*ip))
            .is_some_and(|expiry| *expiry > now)
    }

    /// Whether `ip` is banned right now
    pub async fn is_banned(&self, ip: &IpAddr) -> bool {
        self.is_banned_at(ip, crate::network::unix_time()).await
    }

    /// Expiry recorded for `ip`, even if already in the past
    pub async fn expiry(&self, ip: &IpAddr) -> Option<i64> {
        self.entries.read().await.get(&canonical_ip(*ip)).copied()
    }

    /// Lift a ban; returns whether an entry existed
    pub async fn unban(&self, ip: &IpAddr) -> bool {
        self.entries
            .write()
            .await
            .remove(&canonical_ip(*ip))
            .is_some()
    }

    /// Drop entries that expired at or before `now`
    pub async fn sweep(&self, now: i64) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, expiry| *expiry > now);
        before - entries.len()
    }

    /// Active bans at `now`, sorted by address
    pub async fn entries(&self, now: i64) -> Vec<(IpAddr, i64)> {
        let entries = self.entries.read().await;
        let mut active: Vec<_> = entries
            .iter()
            .filter(|(_, expiry)| **expiry > now)
            .map(|(ip, expiry)| (*ip, *expiry))
            .collect();
        active.sort();
        active
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
