//! Port probing for the chat listener and the discovery channel.
//!
//! Both probes scan upward from the preferred port, trying up to
//! `PORT_SCAN_ATTEMPTS` candidates when fallback is allowed and only the
//! preferred port when it is not. The UDP probe sets the same reuse flags
//! as client discovery listeners, so a client already listening on the
//! port does not make it look busy.

use log::debug;
use shared::PORT_SCAN_ATTEMPTS;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, TcpListener};

/// Finds a free TCP port for the chat listener.
pub fn find_available_port(host: &str, start: u16, allow_fallback: bool) -> Option<u16> {
    scan(start, allow_fallback, |port| tcp_bindable(host, port))
}

/// Finds a usable UDP port for discovery broadcasts.
pub fn find_available_discovery_port(start: u16, allow_fallback: bool) -> Option<u16> {
    scan(start, allow_fallback, udp_bindable)
}

fn scan(start: u16, allow_fallback: bool, probe: impl Fn(u16) -> bool) -> Option<u16> {
    let attempts = if allow_fallback { PORT_SCAN_ATTEMPTS } else { 1 };
    (0..attempts)
        .filter_map(|offset| start.checked_add(offset))
        .find(|&port| probe(port))
}

fn tcp_bindable(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

fn udp_bindable(port: u16) -> bool {
    let Ok(socket) = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)) else {
        return false;
    };
    if socket.set_reuse_address(true).is_err() {
        debug!("SO_REUSEADDR unavailable for discovery probe");
    }
    #[cfg(not(target_os = "windows"))]
    if socket.set_reuse_port(true).is_err() {
        debug!("SO_REUSEPORT unavailable for discovery probe");
    }
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into()).is_ok()
}
