//! P2P connection management
//!
//! Maintains the set of peer connections of a node: admission of inbound
//! peers, outbound connection selection, the socket event loop, misbehaviour
//! scoring and bans, remodelling of the peer set, and the transaction relay
//! cache.
//!
//! # Features
//! - Single-task socket multiplexing with flood control and inactivity timeouts
//! - Outbound selection with one connection per network group
//! - Added, certified and one-shot connections
//! - Reference-counted peers drained only when unused and unlocked
//! - Reconnect tokens and periodic remodelling of unverified inbound peers
//! - Local address discovery and UPnP port mapping

pub mod address;
pub mod addrman;
pub mod banlist;
pub mod config;
pub mod event_loop;
pub mod local;
pub mod median;
pub mod message;
pub mod node;
pub mod outbound;
pub mod peer;
pub mod peerset;
pub mod processor;
pub mod registry;
pub mod relay;
pub mod server;
pub mod socket;
pub mod trusted;
pub mod upnp;

#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;
use tokio::sync::watch;

pub use address::{NetAddr, NetGroup, Network, ServiceFlags};
pub use addrman::{AddrCandidate, AddrManager, AddressBook};
pub use banlist::BanList;
pub use config::{ConfigError, NetConfig};
pub use event_loop::SocketEventLoop;
pub use local::{LocalAddressTable, LocalScore};
pub use message::{InvItem, InvType, Message, VersionMessage, MAGIC, PROTOCOL_VERSION};
pub use node::{Node, NodeError, NodeStatus};
pub use outbound::OutboundConnector;
pub use peer::{DisconnectReason, Peer, PeerError, PeerRef, PeerStats};
pub use peerset::PeerSet;
pub use processor::{MessageLoop, MessageProcessor, ProtocolHandler, ReceivedTx};
pub use registry::{CertifiedNodeRegistry, ChainSyncState, StaticRegistry, SyncStatus};
pub use relay::RelayCache;
pub use server::{MessageCodec, Server};
pub use socket::{Dialer, Listener, PeerSocket, TcpDialer};
pub use trusted::TrustedConnector;

/// Current unix time in seconds
pub fn unix_time() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Sleep for `duration` unless shutdown starts first
///
/// Returns true once shutdown has been requested.
pub async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sleep_returns_false_without_shutdown() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(!sleep_or_shutdown(&mut rx, Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_sleep() {
        let (tx, mut rx) = watch::channel(false);
        let sleeper =
            tokio::spawn(async move { sleep_or_shutdown(&mut rx, Duration::from_secs(60)).await });
        tx.send(true).unwrap();
        let stopped = tokio::time::timeout(Duration::from_secs(5), sleeper)
            .await
            .unwrap()
            .unwrap();
        assert!(stopped);
    }

    #[tokio::test]
    async fn test_dropped_sender_counts_as_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        assert!(sleep_or_shutdown(&mut rx, Duration::from_secs(60)).await);
    }
}
