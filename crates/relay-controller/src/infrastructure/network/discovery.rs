//! UDP broadcast-based discovery: announce broadcaster and register listener.
//!
//! The controller binds one UDP socket on the discovery port (default 3000)
//! and uses it for both directions of the exchange:
//!
//! 1. Every `announce_interval` it broadcasts an `announce` frame carrying
//!    its identity and control port, so targets on the LAN learn where the
//!    WebSocket control channel lives without configuration.
//! 2. It receives raw `register` frames broadcast by targets that have not
//!    yet opened a session, and surfaces them as [`DiscoveryEvent`]s.
//!
//! Discovery yields *address candidates only*.  Pairing and authorization
//! are enforced exclusively at the control server, no matter how the address
//! was learned.  Discovered-but-unregistered peers are tracked in
//! [`DiscoveredPeers`], a short-lived expiring set kept deliberately
//! separate from the device registry.
//!
//! The socket work runs as a blocking loop on a dedicated named thread with
//! a 500 ms read timeout, so the loop can interleave broadcasting, pruning,
//! and the shutdown-flag check without async plumbing.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use relay_core::{
    AnnouncePayload, DeviceInfo, DeviceType, Envelope, MessageKind, RegisterPayload, Sender,
    CONTROLLER_DISCOVERY_PORT, TARGET_DISCOVERY_PORT,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Error type for discovery service operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to bind discovery socket on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to enable broadcast: {0}")]
    Broadcast(std::io::Error),
}

/// Configuration for the discovery service.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Port this socket binds; targets broadcast `register` frames here.
    pub discovery_port: u16,
    /// Port targets listen on; `announce` broadcasts are sent there.
    pub announce_port: u16,
    /// TCP control port advertised in every announce.
    pub control_port: u16,
    pub announce_interval: Duration,
    /// Age beyond which a discovered-but-unregistered peer is forgotten.
    pub peer_ttl: Duration,
    /// Identity advertised in the announce payload.
    pub controller: DeviceInfo,
}

impl DiscoveryConfig {
    pub fn new(controller: DeviceInfo, control_port: u16) -> Self {
        Self {
            discovery_port: CONTROLLER_DISCOVERY_PORT,
            announce_port: TARGET_DISCOVERY_PORT,
            control_port,
            announce_interval: Duration::from_secs(5),
            peer_ttl: Duration::from_secs(180),
            controller,
        }
    }
}

/// A target seen on the discovery socket before it opened a session.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub device: DeviceInfo,
    pub addr: SocketAddr,
    pub seen: Instant,
}

/// An event produced when a target broadcasts its presence.
#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    pub device: DeviceInfo,
    pub addr: SocketAddr,
}

// ── Expiring peer set ─────────────────────────────────────────────────────────

/// Short-lived set of discovered peers, distinct from the device registry.
///
/// Methods take `now` explicitly so expiry is testable without sleeping.
#[derive(Debug)]
pub struct DiscoveredPeers {
    peers: HashMap<String, DiscoveredPeer>,
    ttl: Duration,
}

impl DiscoveredPeers {
    pub fn new(ttl: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            ttl,
        }
    }

    /// Records (or refreshes) a peer sighting.
    pub fn insert(&mut self, device: DeviceInfo, addr: SocketAddr, now: Instant) {
        self.peers.insert(
            device.id.clone(),
            DiscoveredPeer { device, addr, seen: now },
        );
    }

    /// Drops peers unseen for longer than the TTL; returns how many remain.
    pub fn prune(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        self.peers
            .retain(|_, p| now.duration_since(p.seen) <= ttl);
        self.peers.len()
    }

    /// Snapshot of current address candidates.
    pub fn candidates(&self) -> Vec<DiscoveredPeer> {
        self.peers.values().cloned().collect()
    }
}

// ── Service ───────────────────────────────────────────────────────────────────

/// Binds the discovery socket and spawns the background thread.
///
/// Returns a receiver from which the application layer reads
/// [`DiscoveryEvent`]s.
///
/// # Errors
///
/// Returns [`DiscoveryError`] if the socket cannot be bound or switched to
/// broadcast mode.
pub fn start_discovery(
    config: DiscoveryConfig,
    running: Arc<AtomicBool>,
) -> Result<mpsc::Receiver<DiscoveryEvent>, DiscoveryError> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.discovery_port));
    let socket =
        UdpSocket::bind(addr).map_err(|source| DiscoveryError::BindFailed { addr, source })?;
    socket.set_broadcast(true).map_err(DiscoveryError::Broadcast)?;
    socket
        .set_read_timeout(Some(Duration::from_millis(500)))
        .ok();

    let (tx, rx) = mpsc::channel(64);

    std::thread::Builder::new()
        .name("relay-discovery".to_string())
        .spawn(move || {
            discovery_loop(socket, config, tx, running);
        })
        .expect("failed to spawn discovery thread");

    info!("discovery socket listening on UDP {addr}");
    Ok(rx)
}

/// The main loop executed on the discovery thread.
fn discovery_loop(
    socket: UdpSocket,
    config: DiscoveryConfig,
    tx: mpsc::Sender<DiscoveryEvent>,
    running: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; 8192];
    let mut peers = DiscoveredPeers::new(config.peer_ttl);
    // Force an immediate announce on startup.
    let mut last_announce = Instant::now() - config.announce_interval;

    while running.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now.duration_since(last_announce) >= config.announce_interval {
            send_announce(&socket, &config);
            last_announce = now;
        }
        peers.prune(now);

        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if is_timeout_error(&e) => continue,
            Err(e) => {
                error!("discovery recv error: {e}");
                continue;
            }
        };

        let Ok(text) = std::str::from_utf8(&buf[..len]) else {
            debug!("non-UTF-8 discovery datagram from {src}");
            continue;
        };

        match relay_core::decode_envelope(text) {
            Ok(envelope) if envelope.kind == MessageKind::Register => {
                let payload: RegisterPayload = match envelope.payload() {
                    Ok(p) => p,
                    Err(e) => {
                        debug!("bad register broadcast from {src}: {e}");
                        continue;
                    }
                };
                debug!(
                    device_id = %payload.device.id,
                    name = %payload.device.name,
                    "target announced itself via broadcast from {src}"
                );
                peers.insert(payload.device.clone(), src, Instant::now());
                let event = DiscoveryEvent {
                    device: payload.device,
                    addr: src,
                };
                if tx.blocking_send(event).is_err() {
                    // Receiver dropped; application is shutting down.
                    break;
                }
            }
            Ok(envelope) => {
                // The controller's own announce echoes back on some stacks;
                // drop it quietly, warn about anything else.
                if envelope.kind != MessageKind::Announce {
                    warn!(
                        kind = %envelope.kind,
                        "unexpected message on discovery port from {src}"
                    );
                }
            }
            Err(e) => {
                debug!("failed to decode discovery datagram from {src}: {e}");
            }
        }
    }

    info!("discovery loop stopped");
}

/// Broadcasts one `announce` frame to the LAN.
fn send_announce(socket: &UdpSocket, config: &DiscoveryConfig) {
    let payload = AnnouncePayload {
        controller: config.controller.clone(),
        discovery_port: config.discovery_port,
        control_port: config.control_port,
    };
    let data = match serde_json::to_value(&payload) {
        Ok(v) => v,
        Err(e) => {
            error!("failed to serialize announce: {e}");
            return;
        }
    };
    let envelope = Envelope::new(
        MessageKind::Announce,
        Sender {
            id: config.controller.id.clone(),
            device_type: DeviceType::Controller,
        },
        data,
    );
    let dest = SocketAddr::from((Ipv4Addr::BROADCAST, config.announce_port));
    if let Err(e) = socket.send_to(envelope.encode().as_bytes(), dest) {
        warn!("failed to broadcast announce to {dest}: {e}");
    }
}

/// Returns `true` for OS timeout / would-block errors that should be retried.
fn is_timeout_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────
