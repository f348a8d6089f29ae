//! Mini-Node: peer connection manager for a proof-of-stake mini-blockchain
//!
//! This crate maintains the peer-to-peer connections of a node:
//! - Inbound admission with capacity limits, bans and an always-admit list
//! - Outbound selection spread across network groups
//! - Added, certified and one-shot connections
//! - A single socket event loop with flood control and inactivity timeouts
//! - Misbehaviour scoring, bans and periodic remodelling of inbound peers
//! - A transaction relay cache answering `getdata` requests
//!
//! # Example
//!
//! ```rust,no_run
//! use mini_node::network::{NetConfig, Node};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let node = Node::start(NetConfig::default()).await?;
//! let item = node.relay_transaction(bytes::Bytes::from_static(b"tx")).await;
//! println!("Relaying {}", item);
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod network;

// Re-export commonly used types
pub use network::{NetConfig, Node, NodeError, NodeStatus, PeerSet};
