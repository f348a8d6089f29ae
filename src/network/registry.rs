//! Collaborators the connection manager consults but does not own
//!
//! Which nodes are certified, and whether the chain is still in its initial
//! sync, are decided elsewhere in the node. The peer set only asks.

use async_trait::async_trait;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use crate::network::address::canonical_ip;

/// Registry of certified nodes
#[async_trait]
pub trait CertifiedNodeRegistry: Send + Sync {
    async fn is_certified(&self, ip: &IpAddr) -> bool;

    /// Addresses of all certified nodes, for the trusted connector
    async fn list_certified(&self) -> Vec<SocketAddr>;
}

/// Chain synchronisation progress
pub trait ChainSyncState: Send + Sync {
    fn is_initial_sync(&self) -> bool;
}

/// Certified nodes from a fixed list, replaceable at runtime
#[derive(Debug, Default)]
pub struct StaticRegistry {
    nodes: RwLock<Vec<SocketAddr>>,
}

impl StaticRegistry {
    pub fn new(nodes: Vec<SocketAddr>) -> Self {
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    pub async fn replace(&self, nodes: Vec<SocketAddr>) {
        *self.nodes.write().await = nodes;
    }
}

#[async_trait]
impl CertifiedNodeRegistry for StaticRegistry {
    async fn is_certified(&self, ip: &IpAddr) -> bool {
        let ip = canonical_ip(*ip);
        self.nodes
            .read()
            .await
            .iter()
            .any(|addr| canonical_ip(addr.ip()) == ip)
    }

    async fn list_certified(&self) -> Vec<SocketAddr> {
        let nodes = self.nodes.read().await;
        let mut seen = HashSet::new();
        nodes.iter().filter(|a| seen.insert(**a)).copied().collect()
    }
}

/// Initial-sync flag set by the chain side of the node
#[derive(Debug)]
pub struct SyncStatus {
    initial_sync: AtomicBool,
}

impl SyncStatus {
    pub fn new(initial_sync: bool) -> Self {
        Self {
            initial_sync: AtomicBool::new(initial_sync),
        }
    }

    pub fn set_initial_sync(&self, syncing: bool) {
        let was = self.initial_sync.swap(syncing, Ordering::AcqRel);
        if was && !syncing {
            log::info!("Initial sync complete");
        }
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ChainSyncState for SyncStatus {
    fn is_initial_sync(&self) -> bool {
        self.initial_sync.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_registry_matches_by_ip() {
        let registry = StaticRegistry::new(vec!["8.8.8.8:8333".parse().unwrap()]);
        assert!(registry.is_certified(&"8.8.8.8".parse().unwrap()).await);
        assert!(registry.is_certified(&"::ffff:8.8.8.8".parse().unwrap()).await);
        assert!(!registry.is_certified(&"8.8.4.4".parse().unwrap()).await);

        registry.replace(Vec::new()).await;
        assert!(registry.list_certified().await.is_empty());
    }

    #[test]
    fn test_sync_status() {
        let status = SyncStatus::new(true);
        assert!(status.is_initial_sync());
        status.set_initial_sync(false);
        assert!(!status.is_initial_sync());
    }
}
