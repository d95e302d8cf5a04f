//! Discovery and liveness tests
//!
//! These tests exercise the UDP presence beacon, the client's discovery
//! state machine, and the liveness monitor over real loopback sockets.

use client::config::Config;
use client::discovery::{DiscoveryService, DiscoveryState};
use client::monitor::LivenessMonitor;
use client::session::Session;
use server::acceptor::{self, Acceptor};
use server::avatars::{AvatarProvider, FixedAvatars};
use server::beacon::{local_ip, Beacon};
use server::registry::Registry;
use server::router::Router;
use shared::{decode, encode, Envelope, MAX_DATAGRAM_BYTES};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

/// BEACON TESTS
mod beacon_tests {
    use super::*;

    /// Tests that the beacon announces the chat port on its interval
    #[tokio::test]
    async fn beacon_announces_on_schedule() {
        let listener = UdpSocket::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind the listener");
        let discovery_port = listener.local_addr().expect("No listener address").port();

        let beacon = Beacon::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            discovery_port,
            9123,
            Duration::from_millis(50),
        );

        let shutdown = CancellationToken::new();
        let beacon_task = tokio::spawn(beacon.run(shutdown.clone()));

        // Two announcements prove the ticker keeps firing.
        for _ in 0..2 {
            let mut buf = [0u8; MAX_DATAGRAM_BYTES];
            let (n, _) = timeout(Duration::from_secs(2), listener.recv_from(&mut buf))
                .await
                .expect("Timed out waiting for an announcement")
                .expect("Receive failed");

            let text = String::from_utf8_lossy(&buf[..n]).to_string();
            match decode(&text) {
                Some(Envelope::Discovery { port, ip }) => {
                    assert_eq!(port, 9123);
                    // The advertised address tracks the live probe.
                    assert_eq!(ip, local_ip().map(|addr| addr.to_string()));
                }
                other => panic!("expected an announcement, got {other:?}"),
            }
        }

        shutdown.cancel();
        let _ = beacon_task.await;
    }
}

/// RESOLUTION TESTS
mod resolution_tests {
    use super::*;

    /// Tests that a search resolves from a broadcast announcement
    #[tokio::test]
    async fn search_resolves_from_a_beacon() {
        let discovery_port = free_udp_port().await;
        let service = Arc::new(DiscoveryService::new(search_config(discovery_port)));
        let shutdown = CancellationToken::new();
        service.clone().spawn(shutdown.clone());

        let feed = spawn_beacon_feed(
            discovery_port,
            Envelope::Discovery {
                port: 9200,
                ip: Some("192.0.2.9".to_string()),
            },
            shutdown.clone(),
        );

        wait_until("the beacon to resolve", || {
            service.state() == DiscoveryState::Discovered
        })
        .await;
        assert_eq!(
            service.server_addr(),
            Some(("192.0.2.9".to_string(), 9200))
        );

        shutdown.cancel();
        let _ = feed.await;
    }

    /// Tests that the datagram source backfills a missing address field
    #[tokio::test]
    async fn beacon_source_backfills_missing_ip() {
        let discovery_port = free_udp_port().await;
        let service = Arc::new(DiscoveryService::new(search_config(discovery_port)));
        let shutdown = CancellationToken::new();
        service.clone().spawn(shutdown.clone());

        let feed = spawn_beacon_feed(
            discovery_port,
            Envelope::Discovery {
                port: 9200,
                ip: None,
            },
            shutdown.clone(),
        );

        wait_until("the beacon to resolve", || {
            service.state() == DiscoveryState::Discovered
        })
        .await;
        assert_eq!(
            service.server_addr(),
            Some(("127.0.0.1".to_string(), 9200))
        );

        shutdown.cancel();
        let _ = feed.await;
    }

    /// Tests that announcements without a usable port are ignored
    #[tokio::test]
    async fn zero_port_beacons_are_ignored() {
        let discovery_port = free_udp_port().await;
        let service = Arc::new(DiscoveryService::new(search_config(discovery_port)));
        let shutdown = CancellationToken::new();
        service.clone().spawn(shutdown.clone());

        let junk = spawn_beacon_feed(
            discovery_port,
            Envelope::Discovery { port: 0, ip: None },
            shutdown.clone(),
        );

        sleep(Duration::from_millis(300)).await;
        assert_eq!(service.server_addr(), None, "a dead announcement resolved");

        let feed = spawn_beacon_feed(
            discovery_port,
            Envelope::Discovery {
                port: 9200,
                ip: None,
            },
            shutdown.clone(),
        );
        wait_until("the valid beacon to resolve", || {
            service.state() == DiscoveryState::Discovered
        })
        .await;

        shutdown.cancel();
        let _ = junk.await;
        let _ = feed.await;
    }

    /// Tests that the localhost fallback fires once per search episode
    #[tokio::test]
    async fn fallback_fires_exactly_once_per_search() {
        let discovery_port = free_udp_port().await;
        let config = Config {
            pass_timeout: Duration::from_millis(100),
            force_timeout: Duration::from_millis(200),
            localhost_fallback: true,
            default_server_port: 9321,
            ..search_config(discovery_port)
        };
        let service = Arc::new(DiscoveryService::new(config));
        let shutdown = CancellationToken::new();
        service.clone().spawn(shutdown.clone());

        wait_until("the fallback to fire", || {
            service.state() == DiscoveryState::FailedFallback
        })
        .await;
        assert_eq!(
            service.server_addr(),
            Some(("127.0.0.1".to_string(), 9321))
        );

        // The search has ceased; the verdict holds.
        sleep(Duration::from_millis(300)).await;
        assert_eq!(service.state(), DiscoveryState::FailedFallback);

        // A restart opens a fresh episode with a fresh fallback budget.
        service.restart_discovery();
        wait_until("the fallback to fire again", || {
            service.state() == DiscoveryState::FailedFallback
        })
        .await;

        shutdown.cancel();
    }

    /// Tests that a silent network keeps the search alive when fallback
    /// is disallowed
    #[tokio::test]
    async fn search_continues_when_fallback_disallowed() {
        let discovery_port = free_udp_port().await;
        let config = Config {
            pass_timeout: Duration::from_millis(50),
            force_timeout: Duration::from_millis(100),
            localhost_fallback: false,
            ..search_config(discovery_port)
        };
        let service = Arc::new(DiscoveryService::new(config));
        let shutdown = CancellationToken::new();
        service.clone().spawn(shutdown.clone());

        sleep(Duration::from_millis(500)).await;
        assert_eq!(service.state(), DiscoveryState::Searching);
        assert_eq!(service.server_addr(), None);

        shutdown.cancel();
    }
}

/// LIVENESS TESTS
mod liveness_tests {
    use super::*;

    /// Tests that a server death flips the flag and restarts the search
    #[tokio::test]
    async fn server_death_restarts_discovery() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind the probe target");
        let server_port = listener.local_addr().expect("No listener address").port();

        // Hold accepted probes open until the task is aborted.
        let hold = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => held.push(stream),
                    Err(_) => return,
                }
            }
        });

        let discovery_port = free_udp_port().await;
        let service = Arc::new(DiscoveryService::new(search_config(discovery_port)));
        let shutdown = CancellationToken::new();
        service.clone().spawn(shutdown.clone());

        let feed_stop = CancellationToken::new();
        let feed = spawn_beacon_feed(
            discovery_port,
            Envelope::Discovery {
                port: server_port,
                ip: Some("127.0.0.1".to_string()),
            },
            feed_stop.clone(),
        );
        wait_until("the beacon to resolve", || {
            service.state() == DiscoveryState::Discovered
        })
        .await;
        feed_stop.cancel();
        let _ = feed.await;

        let monitor = Arc::new(LivenessMonitor::new(service.clone()));
        monitor.clone().spawn(shutdown.clone());
        wait_until("the monitor to come online", || monitor.is_online()).await;

        // Kill the server; the held probe sockets close with it.
        hold.abort();

        wait_until("the monitor to notice the death", || !monitor.is_online()).await;
        wait_until("discovery to resume searching", || {
            service.state() == DiscoveryState::Searching
        })
        .await;
        assert_eq!(service.server_addr(), None);

        shutdown.cancel();
    }

    /// Tests discovery, connection, and chat against a live server
    #[tokio::test]
    async fn full_discovery_against_live_server() {
        let registry = Arc::new(Registry::new());
        let avatars: Arc<dyn AvatarProvider> = Arc::new(FixedAvatars::empty());
        let router = Arc::new(Router::new(registry.clone(), avatars.clone()));
        let acceptor = Arc::new(Acceptor::new(registry, router, avatars));

        let listener = acceptor::bind("127.0.0.1", 0)
            .await
            .expect("Failed to bind the chat server");
        let server_port = listener.local_addr().expect("No listener address").port();

        let shutdown = CancellationToken::new();
        tokio::spawn(acceptor.run(listener, shutdown.clone()));

        let discovery_port = free_udp_port().await;
        let beacon = Beacon::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            discovery_port,
            server_port,
            Duration::from_millis(50),
        );
        tokio::spawn(beacon.run(shutdown.clone()));

        let service = Arc::new(DiscoveryService::new(search_config(discovery_port)));
        service.clone().spawn(shutdown.clone());

        wait_until("discovery to find the server", || {
            service.state() == DiscoveryState::Discovered
        })
        .await;
        let (host, port) = service.server_addr().expect("Resolved without an address");
        assert_eq!(port, server_port);
        assert!(!host.is_empty());

        // The advertised host may be a LAN address; loopback reaches the
        // same listener either way.
        let session = Session::connect("127.0.0.1", port, "scout")
            .await
            .expect("Failed to connect to the discovered server");
        assert_eq!(session.username(), "scout");

        shutdown.cancel();
    }
}

// HELPER FUNCTIONS

/// A discovery config aimed at one loopback port, tuned for fast tests.
fn search_config(discovery_port: u16) -> Config {
    Config {
        discovery_port,
        port_span: 1,
        pass_timeout: Duration::from_millis(100),
        retry_interval: Duration::from_millis(10),
        force_timeout: Duration::from_secs(30),
        localhost_fallback: false,
        env_override: None,
        default_server_port: shared::DEFAULT_SERVER_PORT,
    }
}

/// Picks a UDP port that was free a moment ago.
async fn free_udp_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("Failed to probe for a free port");
    socket.local_addr().expect("No probe address").port()
}

/// Repeats an announcement to the discovery port until stopped.
fn spawn_beacon_feed(port: u16, envelope: Envelope, stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let socket = match UdpSocket::bind("127.0.0.1:0").await {
            Ok(socket) => socket,
            Err(_) => return,
        };
        let frame = encode(&envelope).expect("Failed to encode the announcement");
        while !stop.is_cancelled() {
            let _ = socket.send_to(&frame, ("127.0.0.1", port)).await;
            sleep(Duration::from_millis(25)).await;
        }
    })
}

/// Polls a condition until it holds, failing the test after three seconds.
async fn wait_until(description: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("Timed out waiting for {description}");
}
