//! UPnP NAT traversal
//!
//! Maps the listening port on the gateway and registers the gateway's
//! external address in the local address table with the `Upnp` score, so it
//! is advertised to peers. The mapping is renewed until shutdown and removed
//! afterwards.

use crate::network::local::{interface_ipv4, LocalScore};
use crate::network::peerset::PeerSet;
use crate::network::sleep_or_shutdown;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

// =============================================================================
// Constants
// =============================================================================

/// Port mapping lease duration (1 hour)
const PORT_MAPPING_LEASE: u32 = 3600;

/// How often to renew the port mapping (20 minutes)
const RENEWAL_INTERVAL: Duration = Duration::from_secs(20 * 60);

/// Description for the port mapping
const MAPPING_DESCRIPTION: &str = "mini-node";

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum UpnpError {
    #[error("UPnP gateway not found: {0}")]
    GatewayNotFound(String),
    #[error("Failed to get external IP: {0}")]
    ExternalIp(String),
    #[error("Failed to add port mapping: {0}")]
    PortMapping(String),
    #[error("No IPv4 interface address")]
    NoInterfaceAddress,
    #[error("UPnP task failed: {0}")]
    Task(String),
}

// =============================================================================
// Port mapping
// =============================================================================

/// Map `port` on the gateway, returning the external address
async fn map_port(port: u16) -> Result<SocketAddr, UpnpError> {
    let internal = interface_ipv4().ok_or(UpnpError::NoInterfaceAddress)?;
    let local_addr = SocketAddr::V4(SocketAddrV4::new(internal, port));

    // igd-next is blocking
    tokio::task::spawn_blocking(move || {
        use igd_next::{search_gateway, PortMappingProtocol};

        let gateway = search_gateway(Default::default())
            .map_err(|e| UpnpError::GatewayNotFound(e.to_string()))?;
        let external = gateway
            .get_external_ip()
            .map_err(|e| UpnpError::ExternalIp(e.to_string()))?;
        gateway
            .add_port(
                PortMappingProtocol::TCP,
                port,
                local_addr,
                PORT_MAPPING_LEASE,
                MAPPING_DESCRIPTION,
            )
            .map_err(|e| UpnpError::PortMapping(e.to_string()))?;
        Ok(SocketAddr::new(external, port))
    })
    .await
    .map_err(|e| UpnpError::Task(e.to_string()))?
}

async fn unmap_port(port: u16) {
    let _ = tokio::task::spawn_blocking(move || {
        use igd_next::{search_gateway, PortMappingProtocol};

        if let Ok(gateway) = search_gateway(Default::default()) {
            match gateway.remove_port(PortMappingProtocol::TCP, port) {
                Ok(()) => log::info!("Removed UPnP port mapping for port {}", port),
                Err(e) => log::warn!("Failed to remove UPnP port mapping: {}", e),
            }
        }
    })
    .await;
}

/// Keep `port` mapped until shutdown
pub async fn run_port_mapping(
    peers: Arc<PeerSet>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut external: Option<SocketAddr> = None;
    while !*shutdown.borrow() {
        match map_port(port).await {
            Ok(addr) => {
                if external != Some(addr) {
                    log::info!("UPnP port mapping: {} -> port {}", addr, port);
                    if let Some(old) = external {
                        peers.local().remove(&old.ip()).await;
                    }
                    peers.local().add(addr, LocalScore::Upnp).await;
                    external = Some(addr);
                } else {
                    log::debug!("Renewed UPnP port mapping {}", addr);
                }
            }
            Err(e) => log::warn!("UPnP port mapping failed: {}", e),
        }
        if sleep_or_shutdown(&mut shutdown, RENEWAL_INTERVAL).await {
            break;
        }
    }

    if let Some(addr) = external {
        peers.local().remove(&addr.ip()).await;
        unmap_port(port).await;
    }
}

// =============================================================================
// Tests
// =============================================================================
