//! Best-effort local address resolution.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Resolves the local LAN IPv4 address by opening a connected UDP socket.
///
/// No packet is sent; connecting a UDP socket only selects the outbound
/// interface, whose address is then read back.  Falls back to the loopback
/// address when the host has no route.
pub fn local_ipv4() -> IpAddr {
    let fallback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let Ok(socket) = UdpSocket::bind("0.0.0.0:0") else {
        return fallback;
    };
    if socket.connect("192.0.2.1:80").is_err() {
        return fallback;
    }
    socket.local_addr().map(|a| a.ip()).unwrap_or(fallback)
}
