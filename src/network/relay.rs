//! Relay cache of recently broadcast content
//!
//! Keeps the serialized payload of everything we announced during the last
//! 15 minutes so `GetData` requests can be answered without going back to
//! the producer. Expiry is checked opportunistically on every new relay.

use crate::network::message::InvItem;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

/// Lifetime of a relayed payload (15 minutes)
pub const RELAY_TTL_SECS: i64 = 15 * 60;

#[derive(Debug, Default)]
struct RelayInner {
    payloads: HashMap<InvItem, Bytes>,
    /// Insertion order with each entry's expiry time
    expirations: VecDeque<(i64, InvItem)>,
}

/// Time-bounded cache keyed by content identifier
#[derive(Debug)]
pub struct RelayCache {
    inner: RwLock<RelayInner>,
    ttl: i64,
}

impl RelayCache {
    pub fn new() -> Self {
        Self::with_ttl(RELAY_TTL_SECS)
    }

    pub fn with_ttl(ttl: i64) -> Self {
        Self {
            inner: RwLock::new(RelayInner::default()),
            ttl,
        }
    }

    /// Insert or refresh `item` at time `now`
    ///
    /// Expired entries are evicted first, oldest insertion first. Returns
    /// `true` when the item was not cached before.
    pub async fn insert_at(&self, item: InvItem, payload: Bytes, now: i64) -> bool {
        let mut inner = self.inner.write().await;

        Self::evict_expired(&mut inner, now);

        match inner.payloads.insert(item.clone(), payload) {
            // keep the newest serialization, the original expiry stays queued
            Some(_) => false,
            None => {
                inner.expirations.push_back((now + self.ttl, item));
                true
            }
        }
    }

    /// Insert or refresh `item` now
    pub async fn insert(&self, item: InvItem, payload: Bytes) -> bool {
        self.insert_at(item, payload, crate::network::unix_time())
            .await
    }

    /// Cached payload for `item`, if still present
    pub async fn get(&self, item: &InvItem) -> Option<Bytes> {
        self.inner.read().await.payloads.get(item).cloned()
    }

    pub async fn contains(&self, item: &InvItem) -> bool {
        self.inner.read().await.payloads.contains_key(item)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.payloads.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.payloads.is_empty()
    }

    fn evict_expired(inner: &mut RelayInner, now: i64) {
        while let Some((expiry, _)) = inner.expirations.front() {
            if *expiry > now {
                break;
            }
            if let Some((_, item)) = inner.expirations.pop_front() {
                inner.payloads.remove(&item);
            }
        }
    }
}

impl Default for RelayCache {
    fn default() -> Self {
        Self::new()
    }
}
