//! Socket event loop
//!
//! A single task multiplexes the listening sockets and every peer socket.
//! Each iteration sweeps and drains dead peers, remodels, waits briefly for
//! readiness, accepts, moves bytes between sockets and peer buffers, and
//! finally enforces the inactivity rules. Nothing here ever blocks on one
//! peer: buffers are only touched when their lock is free, and all socket
//! calls are non-blocking.

use crate::network::peer::{DisconnectReason, PeerRef};
use crate::network::peerset::PeerSet;
use crate::network::socket::{is_transient, Listener, PeerSocket};
use crate::network::unix_time;
use bytes::Buf;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{Interest, Ready};
use tokio::sync::{watch, Notify};

/// Upper bound on one readiness wait
pub const SELECT_TIMEOUT: Duration = Duration::from_millis(50);

/// Bytes read from one peer per iteration
pub const READ_CHUNK: usize = 64 * 1024;

enum Event {
    Accept(io::Result<(Arc<dyn PeerSocket>, SocketAddr)>),
    Peer(usize, io::Result<Ready>),
}

/// Drives all peer sockets
pub struct SocketEventLoop {
    peers: Arc<PeerSet>,
    listeners: Vec<Arc<dyn Listener>>,
    /// Woken whenever new bytes land in a receive buffer
    messages: Arc<Notify>,
    rng: StdRng,
    read_buf: Vec<u8>,
}

impl SocketEventLoop {
    pub fn new(
        peers: Arc<PeerSet>,
        listeners: Vec<Arc<dyn Listener>>,
        messages: Arc<Notify>,
    ) -> Self {
        Self {
            peers,
            listeners,
            messages,
            rng: StdRng::from_entropy(),
            read_buf: vec![0u8; READ_CHUNK],
        }
    }

    /// Run until `shutdown` flips, then drain once more
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        log::info!("Socket event loop started");
        while !*shutdown.borrow_and_update() {
            self.iteration(unix_time()).await;
        }

        let now = unix_time();
        self.peers.disconnect_all(DisconnectReason::Shutdown).await;
        self.peers.sweep_disconnected(now).await;
        let freed = self.peers.drain(now).await;
        log::info!(
            "Socket event loop stopped ({} peers freed, {} still draining)",
            freed,
            self.peers.draining_len().await
        );
    }

    /// One pass over every socket
    pub async fn iteration(&mut self, now: i64) {
        let swept = self.peers.sweep_disconnected(now).await;
        if swept > 0 {
            log::debug!("Swept {} disconnected peers", swept);
        }
        self.peers.drain(now).await;
        self.peers.maybe_remodel(now, &mut self.rng).await;

        let snapshot = self.peers.snapshot().await;
        let events = self.wait(&snapshot).await;

        let mut received = false;
        for event in events {
            match event {
                Event::Accept(Ok((socket, remote))) => {
                    if let Err(e) = self.peers.accept_inbound(socket, remote, now).await {
                        log::debug!("Rejected inbound {}: {}", remote, e);
                    }
                }
                Event::Accept(Err(e)) => {
                    log::warn!("Socket error accept failed: {}", e);
                }
                Event::Peer(index, Ok(ready)) => {
                    if let Some(peer) = snapshot.get(index) {
                        received |= self.service(peer, ready, now).await;
                    }
                }
                Event::Peer(index, Err(e)) => {
                    if let Some(peer) = snapshot.get(index) {
                        log::debug!("{}: socket wait error {}", peer.addr_name(), e);
                        peer.disconnect(DisconnectReason::SocketError);
                    }
                }
            }
        }
        if received {
            self.messages.notify_one();
        }

        for peer in &snapshot {
            check_activity(peer, now);
        }
    }

    /// Wait up to [`SELECT_TIMEOUT`] for any socket, then collect all that
    /// are ready
    async fn wait(&self, snapshot: &[PeerRef]) -> Vec<Event> {
        let mut waits: FuturesUnordered<BoxFuture<'_, Event>> = FuturesUnordered::new();

        for listener in &self.listeners {
            let listener = listener.clone();
            waits.push(async move { Event::Accept(listener.accept().await) }.boxed());
        }

        for (index, peer) in snapshot.iter().enumerate() {
            if peer.should_disconnect() {
                continue;
            }
            let Some(socket) = peer.socket().await else {
                continue;
            };
            // a locked buffer cannot take bytes this pass
            let receiving = peer.recv_buffer().try_lock().is_ok();
            let sending = peer
                .send_buffer()
                .try_lock()
                .map(|b| !b.is_empty())
                .unwrap_or(false);
            let interest = match (receiving, sending) {
                (true, true) => Interest::READABLE.add(Interest::WRITABLE),
                (true, false) => Interest::READABLE,
                (false, true) => Interest::WRITABLE,
                (false, false) => continue,
            };
            waits.push(async move { Event::Peer(index, socket.ready(interest).await) }.boxed());
        }

        if waits.is_empty() {
            tokio::time::sleep(SELECT_TIMEOUT).await;
            return Vec::new();
        }

        let mut events = Vec::new();
        if let Ok(Some(event)) = tokio::time::timeout(SELECT_TIMEOUT, waits.next()).await {
            events.push(event);
            while let Some(Some(event)) = waits.next().now_or_never() {
                events.push(event);
            }
        }
        events
    }

    /// Move bytes for one ready peer; returns whether anything was received
    async fn service(&mut self, peer: &PeerRef, ready: Ready, now: i64) -> bool {
        if peer.should_disconnect() {
            return false;
        }
        let Some(socket) = peer.socket().await else {
            return false;
        };

        let mut received = false;
        if ready.is_readable() || ready.is_read_closed() {
            received = self.receive(peer, socket.as_ref(), now);
        }
        if ready.is_writable() && !peer.should_disconnect() {
            send(peer, socket.as_ref(), now);
        }
        received
    }

    fn receive(&mut self, peer: &PeerRef, socket: &dyn PeerSocket, now: i64) -> bool {
        let Ok(mut recv) = peer.recv_buffer().try_lock() else {
            return false;
        };

        let ceiling = self.peers.config().max_receive_buffer;
        if recv.len() > ceiling {
            log::info!(
                "{}: socket recv flood control disconnect ({} bytes)",
                peer.addr_name(),
                recv.len()
            );
            peer.disconnect(DisconnectReason::FloodControl);
            return false;
        }

        match socket.try_read(&mut self.read_buf) {
            Ok(0) => {
                log::debug!("{}: socket closed", peer.addr_name());
                peer.disconnect(DisconnectReason::Closed);
                false
            }
            Ok(n) => {
                recv.extend_from_slice(&self.read_buf[..n]);
                peer.record_recv(n, now);
                true
            }
            Err(e) if is_transient(e.kind()) => false,
            Err(e) => {
                log::debug!("{}: socket recv error {}", peer.addr_name(), e);
                peer.disconnect(DisconnectReason::SocketError);
                false
            }
        }
    }
}

/// Write as much of the send buffer as the socket takes
fn send(peer: &PeerRef, socket: &dyn PeerSocket, now: i64) {
    let Ok(mut buf) = peer.send_buffer().try_lock() else {
        return;
    };
    while !buf.is_empty() {
        match socket.try_write(&buf) {
            Ok(0) => break,
            Ok(n) => {
                buf.advance(n);
                peer.record_send(n, now);
            }
            Err(e) if is_transient(e.kind()) => break,
            Err(e) => {
                log::debug!("{}: socket send error {}", peer.addr_name(), e);
                peer.disconnect(DisconnectReason::SocketError);
                break;
            }
        }
    }
}

/// Note an empty send buffer, then apply the inactivity rules
fn check_activity(peer: &PeerRef, now: i64) {
    if peer.should_disconnect() {
        return;
    }
    if let Ok(buf) = peer.send_buffer().try_lock() {
        if buf.is_empty() {
            peer.mark_send_empty(now);
        }
    }
    if let Some(reason) = peer.inactivity(now) {
        peer.disconnect(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::config::NetConfig;
    use crate::network::message::Message;
    use crate::network::peer::Peer;
    use crate::network::server::MessageCodec;
    use crate::network::testing::{net, sock, Harness, MockListener, MockSocket};
    use bytes::BytesMut;
    use tokio_util::codec::Decoder;

    const NOW: i64 = 1_700_000_000;

    fn event_loop(h: &Harness) -> SocketEventLoop {
        SocketEventLoop::new(h.peers.clone(), Vec::new(), Arc::new(Notify::new()))
    }

    async fn inbound(h: &Harness, addr: &str, at: i64) -> (Arc<Peer>, Arc<MockSocket>) {
        let socket = MockSocket::new(sock(addr));
        let peer = h
            .peers
            .accept_inbound(socket.clone(), sock(addr), at)
            .await
            .unwrap();
        (peer, socket)
    }

    #[tokio::test]
    async fn test_bytes_move_between_socket_and_buffers() {
        let h = Harness::new(NetConfig::default());
        let mut el = event_loop(&h);
        let (peer, socket) = inbound(&h, "1.2.3.4:5000", NOW).await;

        socket.feed(b"hello");
        peer.push_message(&Message::Ping(9)).await.unwrap();
        el.iteration(NOW + 1).await;

        assert_eq!(&peer.recv_buffer().lock().await[..], b"hello");
        assert_eq!(peer.bytes_recv(), 5);
        assert_eq!(peer.last_recv(), NOW + 1);

        let mut written = BytesMut::from(&socket.take_written()[..]);
        let msg = MessageCodec.decode(&mut written).unwrap().unwrap();
        assert!(matches!(msg, Message::Ping(9)));
        assert_eq!(peer.last_send(), NOW + 1);
        assert!(peer.send_buffer().lock().await.is_empty());
        assert_eq!(peer.last_send_empty(), NOW + 1);
    }

    #[tokio::test]
    async fn test_flood_ceiling_disconnects() {
        let config = NetConfig {
            max_receive_buffer: 4,
            ..Default::default()
        };
        let h = Harness::new(config);
        let mut el = event_loop(&h);
        let (peer, socket) = inbound(&h, "1.2.3.4:5000", NOW).await;

        socket.feed(b"0123456789");
        el.iteration(NOW).await;
        assert!(!peer.should_disconnect());

        socket.feed(b"more");
        el.iteration(NOW).await;
        assert_eq!(peer.disconnect_reason(), Some(DisconnectReason::FloodControl));
    }

    #[tokio::test]
    async fn test_remote_close_and_errors_evict_only_that_peer() {
        let h = Harness::new(NetConfig::default());
        let mut el = event_loop(&h);
        let (closed, closed_socket) = inbound(&h, "1.1.1.1:5000", NOW).await;
        let (broken, broken_socket) = inbound(&h, "2.2.2.2:5000", NOW).await;
        let (healthy, _) = inbound(&h, "3.3.3.3:5000", NOW).await;

        closed_socket.close_remote();
        broken_socket.break_connection();
        el.iteration(NOW).await;

        assert_eq!(closed.disconnect_reason(), Some(DisconnectReason::Closed));
        assert_eq!(broken.disconnect_reason(), Some(DisconnectReason::SocketError));
        assert!(!healthy.should_disconnect());

        el.iteration(NOW).await;
        assert_eq!(h.peers.len().await, 1);
        assert!(closed.is_freed() && broken.is_freed());
    }

    #[tokio::test]
    async fn test_readiness_error_evicts_peer() {
        let h = Harness::new(NetConfig::default());
        let mut el = event_loop(&h);
        let (peer, socket) = inbound(&h, "1.2.3.4:5000", NOW).await;
        let (healthy, _) = inbound(&h, "3.3.3.3:5000", NOW).await;

        socket.fail_readiness();
        el.iteration(NOW).await;
        assert_eq!(peer.disconnect_reason(), Some(DisconnectReason::SocketError));
        assert!(!healthy.should_disconnect());

        el.iteration(NOW).await;
        assert!(h.peers.find_by_addr(&sock("1.2.3.4:5000")).await.is_none());
    }

    #[tokio::test]
    async fn test_locked_receive_buffer_not_polled() {
        let h = Harness::new(NetConfig::default());
        let mut el = event_loop(&h);
        let (peer, socket) = inbound(&h, "1.2.3.4:5000", NOW).await;

        socket.feed(b"pending");
        let held = peer.recv_buffer().lock().await;
        let started = std::time::Instant::now();
        el.iteration(NOW).await;
        assert!(started.elapsed() >= SELECT_TIMEOUT / 2);
        assert!(held.is_empty());
        drop(held);

        el.iteration(NOW).await;
        assert_eq!(&peer.recv_buffer().lock().await[..], b"pending");
    }

    #[tokio::test]
    async fn test_silent_peer_evicted_after_61_seconds() {
        let h = Harness::new(NetConfig::default());
        let mut el = event_loop(&h);
        let (peer, _socket) = inbound(&h, "1.2.3.4:5000", NOW - 61).await;

        el.iteration(NOW).await;
        assert_eq!(peer.disconnect_reason(), Some(DisconnectReason::NoInitialMessage));

        el.iteration(NOW).await;
        assert!(h.peers.find_by_addr(&sock("1.2.3.4:5000")).await.is_none());
    }

    #[tokio::test]
    async fn test_accepts_from_listener() {
        let h = Harness::new(NetConfig::default());
        let (listener, tx) = MockListener::new(sock("0.0.0.0:8333"));
        let mut el = SocketEventLoop::new(
            h.peers.clone(),
            vec![Arc::new(listener)],
            Arc::new(Notify::new()),
        );

        tx.send(MockSocket::new(sock("5.5.5.5:6000"))).unwrap();
        el.iteration(NOW).await;

        let peer = h.peers.find_by_addr(&sock("5.5.5.5:6000")).await.unwrap();
        assert!(peer.is_inbound());
    }

    #[tokio::test]
    async fn test_received_bytes_wake_processor() {
        let h = Harness::new(NetConfig::default());
        let notify = Arc::new(Notify::new());
        let mut el = SocketEventLoop::new(h.peers.clone(), Vec::new(), notify.clone());
        let (_peer, socket) = inbound(&h, "1.2.3.4:5000", NOW).await;

        socket.feed(b"x");
        el.iteration(NOW).await;
        tokio::time::timeout(Duration::from_secs(1), notify.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_everything() {
        let h = Harness::new(NetConfig::default());
        let el = event_loop(&h);
        let (peer, _) = inbound(&h, "1.2.3.4:5000", NOW).await;
        let outbound = h.peers.connect(&net("2.2.2.2:8333"), None, None, NOW).await.unwrap();
        drop(outbound);

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(el.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        assert!(h.peers.is_empty().await);
        assert!(peer.is_freed());
    }
}
