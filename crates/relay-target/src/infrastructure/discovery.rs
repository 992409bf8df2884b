//! Discovery probe: find a controller on the LAN without configuration.
//!
//! Two complementary mechanisms, both plain blocking UDP (call them through
//! `spawn_blocking` from async code):
//!
//! - [`await_announce`] listens on the announce port for a controller
//!   `announce` broadcast and yields the address candidate it advertises.
//! - [`broadcast_register`] sends one raw `register` frame to the
//!   controller's discovery port, so a controller that is already listening
//!   learns about this target before any session is opened.
//!
//! Either way the result is an address candidate only; registration and
//! pairing still run over the control channel.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use relay_core::{
    AnnouncePayload, DeviceInfo, DeviceType, Envelope, MessageKind, RegisterPayload, Sender,
    CONTROLLER_DISCOVERY_PORT,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Error type for discovery operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to bind discovery socket on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("no controller announce received within {0:?}")]
    Timeout(Duration),
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
}

/// An address candidate learned from a controller `announce`.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerCandidate {
    pub controller: DeviceInfo,
    /// Address the broadcast arrived from.
    pub source: IpAddr,
    /// TCP port of the controller's control channel.
    pub control_port: u16,
}

/// Blocks until a controller `announce` arrives on `port`, or the timeout
/// elapses.
///
/// Datagrams that are not valid `announce` frames are skipped.  The returned
/// candidate prefers the datagram's source address over the self-reported
/// one: the source is what actually routed.
///
/// # Errors
///
/// [`DiscoveryError::Timeout`] when nothing valid arrives in time,
/// [`DiscoveryError::BindFailed`] when the port is taken.
pub fn await_announce(port: u16, timeout: Duration) -> Result<ControllerCandidate, DiscoveryError> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let socket =
        UdpSocket::bind(addr).map_err(|source| DiscoveryError::BindFailed { addr, source })?;
    socket.set_read_timeout(Some(Duration::from_millis(500)))?;

    info!("waiting for controller announce on UDP {addr}");
    let deadline = Instant::now() + timeout;
    let mut buf = vec![0u8; 8192];

    while Instant::now() < deadline {
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if is_timeout_error(&e) => continue,
            Err(e) => return Err(DiscoveryError::Socket(e)),
        };

        let Ok(text) = std::str::from_utf8(&buf[..len]) else {
            debug!("non-UTF-8 discovery datagram from {src}");
            continue;
        };
        match relay_core::decode_envelope(text) {
            Ok(envelope) if envelope.kind == MessageKind::Announce => {
                match envelope.payload::<AnnouncePayload>() {
                    Ok(payload) => {
                        info!(
                            controller = %payload.controller.name,
                            source = %src.ip(),
                            control_port = payload.control_port,
                            "controller announce received"
                        );
                        return Ok(ControllerCandidate {
                            controller: payload.controller,
                            source: src.ip(),
                            control_port: payload.control_port,
                        });
                    }
                    Err(e) => debug!("bad announce payload from {src}: {e}"),
                }
            }
            Ok(envelope) => {
                debug!(kind = %envelope.kind, "ignoring non-announce datagram from {src}");
            }
            Err(e) => {
                debug!("undecodable discovery datagram from {src}: {e}");
            }
        }
    }

    Err(DiscoveryError::Timeout(timeout))
}

/// Broadcasts one `register` frame to the controller discovery port.
///
/// Best effort: a controller that is listening records the sighting; nobody
/// listening is not an error the caller can act on, so send failures are
/// only logged.
pub fn broadcast_register(device: &DeviceInfo) -> Result<(), DiscoveryError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(DiscoveryError::Socket)?;
    socket.set_broadcast(true)?;

    let payload = RegisterPayload {
        device: device.clone(),
    };
    let data = serde_json::to_value(&payload)
        .map_err(|e| DiscoveryError::Socket(std::io::Error::other(e)))?;
    let envelope = Envelope::new(
        MessageKind::Register,
        Sender {
            id: device.id.clone(),
            device_type: DeviceType::Target,
        },
        data,
    );

    let dest = SocketAddr::from((Ipv4Addr::BROADCAST, CONTROLLER_DISCOVERY_PORT));
    if let Err(e) = socket.send_to(envelope.encode().as_bytes(), dest) {
        warn!("failed to broadcast register to {dest}: {e}");
    }
    Ok(())
}

fn is_timeout_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::CommandType;

    fn target() -> DeviceInfo {
        DeviceInfo {
            id: "t1".to_string(),
            name: "target-t1".to_string(),
            ip: "127.0.0.1".parse().unwrap(),
            mac: None,
            device_type: DeviceType::Target,
            supported_commands: vec![CommandType::ArrowLeft],
        }
    }

    #[test]
    fn test_await_announce_times_out_when_nothing_arrives() {
        // Port 0: the OS picks a free port, so nothing will ever arrive.
        let result = await_announce(0, Duration::from_millis(50));
        assert!(matches!(result, Err(DiscoveryError::Timeout(_))));
    }

    #[test]
    fn test_await_announce_yields_candidate_from_broadcast() {
        // Bind the listener first on an OS-assigned port.
        let probe = UdpSocket::bind("127.0.0.1:0").expect("bind probe");
        let listen_port = probe.local_addr().unwrap().port();
        drop(probe);

        let controller = DeviceInfo {
            id: "c1".to_string(),
            name: "controller".to_string(),
            ip: "127.0.0.1".parse().unwrap(),
            mac: None,
            device_type: DeviceType::Controller,
            supported_commands: Vec::new(),
        };
        let payload = AnnouncePayload {
            controller: controller.clone(),
            discovery_port: 3000,
            control_port: 9999,
        };
        let envelope = Envelope::new(
            MessageKind::Announce,
            Sender {
                id: "c1".to_string(),
                device_type: DeviceType::Controller,
            },
            serde_json::to_value(&payload).unwrap(),
        );

        // Announce from another thread once the listener is up.
        let sender = std::thread::spawn(move || {
            let socket = UdpSocket::bind("127.0.0.1:0").expect("bind sender");
            // Give await_announce a moment to bind.
            std::thread::sleep(Duration::from_millis(100));
            socket
                .send_to(
                    envelope.encode().as_bytes(),
                    ("127.0.0.1", listen_port),
                )
                .expect("send announce");
        });

        let candidate =
            await_announce(listen_port, Duration::from_secs(5)).expect("announce arrives");
        sender.join().unwrap();

        assert_eq!(candidate.control_port, 9999);
        assert_eq!(candidate.controller.id, "c1");
        assert_eq!(candidate.source, "127.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_broadcast_register_sends_without_error() {
        // No controller is listening; the call must still succeed.
        broadcast_register(&target()).expect("broadcast is best effort");
    }
}
