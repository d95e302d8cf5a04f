//! Periodic UDP presence beacon.
//!
//! Announces the chat port to the local network every beacon interval so
//! clients can find the server without configuration. The advertised
//! address is probed again on every tick, so a host whose LAN address
//! changes mid-run announces the new one without a restart. A failed
//! send is logged and the next tick tries again.

use log::{debug, info};
use shared::{encode, EncodeError, Envelope};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

pub struct Beacon {
    target: SocketAddr,
    server_port: u16,
    interval: Duration,
}

impl Beacon {
    /// Builds the beacon for a resolved chat port.
    ///
    /// `broadcast_addr` is normally the limited broadcast address; tests
    /// point it at loopback.
    pub fn new(
        broadcast_addr: IpAddr,
        discovery_port: u16,
        server_port: u16,
        interval: Duration,
    ) -> Self {
        Self {
            target: SocketAddr::new(broadcast_addr, discovery_port),
            server_port,
            interval,
        }
    }

    /// Broadcasts the announcement until the token fires.
    pub async fn run(self, shutdown: CancellationToken) -> std::io::Result<()> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;
        info!(
            "Discovery beacon announcing to {} every {:?}",
            self.target, self.interval
        );

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Discovery beacon stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let frame = match announcement(self.server_port, local_ip()) {
                        Ok(frame) => frame,
                        Err(e) => {
                            debug!("Skipping beacon tick: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = socket.send_to(&frame, self.target).await {
                        debug!("Discovery broadcast failed: {}", e);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Encodes one announcement carrying the address probed at tick time.
///
/// The advertised `ip` is omitted when no probe result is available;
/// receivers then fall back to the datagram source address.
fn announcement(server_port: u16, ip: Option<IpAddr>) -> Result<Vec<u8>, EncodeError> {
    encode(&Envelope::Discovery {
        port: server_port,
        ip: ip.map(|ip| ip.to_string()),
    })
}

/// Best-effort primary local IPv4 address.
///
/// Connecting a UDP socket performs a route lookup without sending any
/// traffic; the socket's local address is the interface the OS would use
/// for outbound LAN traffic. Returns `None` on hosts with no usable route.
pub fn local_ip() -> Option<IpAddr> {
    let probe = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    probe.connect("8.8.8.8:80").ok()?;
    probe.local_addr().ok().map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::decode;

    #[test]
    fn test_announcement_carries_probed_address() {
        let ip: IpAddr = "192.0.2.5".parse().unwrap();
        let frame = announcement(9100, Some(ip)).unwrap();

        let decoded = decode(std::str::from_utf8(&frame).unwrap());
        assert_eq!(
            decoded,
            Some(Envelope::Discovery {
                port: 9100,
                ip: Some("192.0.2.5".to_string()),
            })
        );
    }

    #[test]
    fn test_announcement_omits_unresolved_address() {
        let frame = announcement(9100, None).unwrap();

        let decoded = decode(std::str::from_utf8(&frame).unwrap());
        assert_eq!(
            decoded,
            Some(Envelope::Discovery {
                port: 9100,
                ip: None,
            })
        );
    }
}
