//! Server discovery: where is the chat server on this network?
//!
//! A single `DiscoveryService` answers that question for the whole
//! process. Resolution sources, in order of precedence:
//!
//! 1. Manual override, set by an explicit user action. Pins the address
//!    and is never abandoned automatically.
//! 2. Environment override (`HOST`). Pins the address, but liveness
//!    monitoring still applies.
//! 3. Broadcast search: UDP listeners on a small span of discovery ports
//!    wait for server beacons. A valid beacon resolves the address.
//! 4. Localhost fallback: when a search has run longer than the force
//!    timeout and the fallback is permitted, the service resolves to
//!    `127.0.0.1` on the default port, once, and stops searching.
//!
//! `restart_discovery` throws away a resolved address and searches again
//! with a fresh budget; under a manual override it does nothing. Beacons
//! arriving after resolution are ignored because the listeners are gone.

use crate::config::Config;
use log::{debug, info, warn};
use shared::{decode, Envelope, MAX_DATAGRAM_BYTES};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

/// Localhost fallback target.
const FALLBACK_HOST: &str = "127.0.0.1";

/// Where the client currently stands in locating a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// No address known and no search running.
    Unresolved,
    /// Address pinned by the `HOST` environment variable.
    EnvOverride,
    /// Address pinned by an explicit user action.
    ManualOverride,
    /// Listening for beacons.
    Searching,
    /// A beacon resolved the address.
    Discovered,
    /// The search budget ran out and the localhost fallback was taken.
    FailedFallback,
}

impl DiscoveryState {
    /// Whether this state carries a usable server address.
    pub fn is_resolved(self) -> bool {
        matches!(
            self,
            DiscoveryState::EnvOverride
                | DiscoveryState::ManualOverride
                | DiscoveryState::Discovered
                | DiscoveryState::FailedFallback
        )
    }
}

struct Shared {
    state: DiscoveryState,
    resolved: Option<(String, u16)>,
    manual: Option<(String, u16)>,
}

pub struct DiscoveryService {
    config: Config,
    shared: Mutex<Shared>,
    restart: Notify,
}

impl DiscoveryService {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shared: Mutex::new(Shared {
                state: DiscoveryState::Unresolved,
                resolved: None,
                manual: None,
            }),
            restart: Notify::new(),
        }
    }

    fn locked(&self) -> MutexGuard<'_, Shared> {
        // a poisoned guard still holds a consistent snapshot
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> DiscoveryState {
        self.locked().state
    }

    /// The resolved server address, whatever source produced it.
    pub fn server_addr(&self) -> Option<(String, u16)> {
        self.locked().resolved.clone()
    }

    /// Pins the server address to an explicit user choice.
    ///
    /// Takes effect immediately, even mid-search, and stays in force until
    /// `clear_manual_override`.
    pub fn set_manual_override(&self, host: impl Into<String>, port: u16) {
        let host = host.into();
        info!("Manual server override set to {}:{}", host, port);
        {
            let mut shared = self.locked();
            shared.manual = Some((host.clone(), port));
            shared.resolved = Some((host, port));
            shared.state = DiscoveryState::ManualOverride;
        }
        self.restart.notify_one();
    }

    /// Drops the manual override and searches again.
    pub fn clear_manual_override(&self) {
        info!("Manual server override cleared");
        {
            let mut shared = self.locked();
            shared.manual = None;
            shared.resolved = None;
            shared.state = DiscoveryState::Unresolved;
        }
        self.restart.notify_one();
    }

    /// Forgets the resolved address and re-enters the search.
    ///
    /// Does nothing while a manual override is active.
    pub fn restart_discovery(&self) {
        {
            let mut shared = self.locked();
            if shared.manual.is_some() {
                debug!("Ignoring discovery restart under manual override");
                return;
            }
            shared.resolved = None;
            shared.state = DiscoveryState::Unresolved;
        }
        info!("Restarting server discovery");
        self.restart.notify_one();
    }

    /// Runs the resolution worker until the token fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.worker(shutdown).await })
    }

    async fn worker(&self, shutdown: CancellationToken) {
        enum Plan {
            Resolve(DiscoveryState, (String, u16)),
            Park,
            Search,
        }

        while !shutdown.is_cancelled() {
            let plan = {
                let shared = self.locked();
                if let Some(manual) = shared.manual.clone() {
                    Plan::Resolve(DiscoveryState::ManualOverride, manual)
                } else if let Some(env) = self.config.env_override.clone() {
                    Plan::Resolve(DiscoveryState::EnvOverride, env)
                } else if shared.resolved.is_some() {
                    Plan::Park
                } else {
                    Plan::Search
                }
            };

            match plan {
                Plan::Resolve(state, addr) => {
                    self.resolve(state, addr);
                    self.park(&shutdown).await;
                }
                Plan::Park => self.park(&shutdown).await,
                Plan::Search => self.search(&shutdown).await,
            }
        }
    }

    fn resolve(&self, state: DiscoveryState, addr: (String, u16)) {
        let mut shared = self.locked();
        if shared.state != state || shared.resolved.as_ref() != Some(&addr) {
            info!(
                "Server address resolved to {}:{} ({:?})",
                addr.0, addr.1, state
            );
        }
        shared.resolved = Some(addr);
        shared.state = state;
    }

    /// Waits for a restart request or shutdown.
    async fn park(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = self.restart.notified() => {}
        }
    }

    /// One full searching episode: ends on resolution, restart, or
    /// shutdown. The force budget spans the whole episode, including any
    /// time spent unable to bind a listener.
    async fn search(&self, shutdown: &CancellationToken) {
        let episode = shutdown.child_token();
        self.run_search(&episode, shutdown).await;
        episode.cancel();
    }

    async fn run_search(&self, episode: &CancellationToken, shutdown: &CancellationToken) {
        {
            let mut shared = self.locked();
            shared.state = DiscoveryState::Searching;
        }

        let span = self.config.port_span.max(1);
        info!(
            "Searching for server beacons on UDP ports {}-{}",
            self.config.discovery_port,
            self.config.discovery_port.saturating_add(span - 1)
        );

        let (beacon_tx, mut beacon_rx) = mpsc::channel(16);
        let mut listeners = self.bind_listeners(episode, &beacon_tx).await;

        let started = Instant::now();
        let mut fallback_taken = false;

        loop {
            if !fallback_taken && started.elapsed() > self.config.force_timeout {
                fallback_taken = true;
                if self.config.localhost_fallback {
                    warn!(
                        "No server found after {:?}; falling back to {}:{}",
                        self.config.force_timeout, FALLBACK_HOST, self.config.default_server_port
                    );
                    self.resolve(
                        DiscoveryState::FailedFallback,
                        (FALLBACK_HOST.to_string(), self.config.default_server_port),
                    );
                    return;
                }
            }

            // Sockets can die underneath the listener tasks; rebind when
            // none are left.
            if listeners.iter().all(|listener| listener.is_finished()) {
                if !self.pause(self.config.retry_interval, shutdown).await {
                    return;
                }
                listeners = self.bind_listeners(episode, &beacon_tx).await;
                continue;
            }

            // One listening pass.
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = self.restart.notified() => return,
                received = timeout(self.config.pass_timeout, beacon_rx.recv()) => match received {
                    Ok(Some((host, port))) => {
                        info!("Discovered server at {}:{}", host, port);
                        self.resolve(DiscoveryState::Discovered, (host, port));
                        return;
                    }
                    Ok(None) => return,
                    Err(_) => {}
                }
            }

            if !self.pause(self.config.retry_interval, shutdown).await {
                return;
            }
        }
    }

    /// Spawns a listener task per configured port that actually bound.
    async fn bind_listeners(
        &self,
        episode: &CancellationToken,
        beacon_tx: &mpsc::Sender<(String, u16)>,
    ) -> Vec<JoinHandle<()>> {
        let mut listeners = Vec::new();
        for offset in 0..self.config.port_span.max(1) {
            let Some(port) = self.config.discovery_port.checked_add(offset) else {
                break;
            };
            match bind_reusable_udp(port).await {
                Some(socket) => listeners.push(tokio::spawn(listen_for_beacons(
                    socket,
                    beacon_tx.clone(),
                    episode.clone(),
                ))),
                None => debug!("Could not bind discovery port {}", port),
            }
        }
        if listeners.is_empty() {
            warn!(
                "No discovery port could be bound starting from {}",
                self.config.discovery_port
            );
        }
        listeners
    }

    /// Cancellation-aware sleep; false means the wait was interrupted.
    async fn pause(&self, duration: Duration, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = self.restart.notified() => false,
            _ = sleep(duration) => true,
        }
    }
}

/// Reads datagrams off one discovery socket, forwarding valid beacons.
async fn listen_for_beacons(
    socket: UdpSocket,
    beacon_tx: mpsc::Sender<(String, u16)>,
    stop: CancellationToken,
) {
    let mut buf = [0u8; MAX_DATAGRAM_BYTES];
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            received = socket.recv_from(&mut buf) => {
                let Ok((len, source)) = received else { return };
                let text = String::from_utf8_lossy(&buf[..len]);
                let Some(Envelope::Discovery { port, ip }) = decode(&text) else {
                    debug!("Ignoring non-beacon datagram from {}", source);
                    continue;
                };
                if port == 0 {
                    continue;
                }
                // Prefer the address the server advertises; fall back to
                // where the datagram actually came from.
                let host = ip
                    .filter(|advertised| !advertised.is_empty())
                    .unwrap_or_else(|| source.ip().to_string());
                if beacon_tx.send((host, port)).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Binds a UDP socket with the reuse flags set so several clients on one
/// machine can share the discovery port.
async fn bind_reusable_udp(port: u16) -> Option<UdpSocket> {
    let socket = match Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)) {
        Ok(socket) => socket,
        Err(e) => {
            warn!("Failed to create discovery socket: {}", e);
            return None;
        }
    };

    if let Err(e) = socket.set_reuse_address(true) {
        debug!("SO_REUSEADDR failed on discovery socket: {}", e);
    }
    #[cfg(not(target_os = "windows"))]
    if let Err(e) = socket.set_reuse_port(true) {
        debug!("SO_REUSEPORT failed on discovery socket: {}", e);
    }
    if socket.set_nonblocking(true).is_err() {
        return None;
    }

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    if socket.bind(&addr.into()).is_err() {
        return None;
    }

    match UdpSocket::from_std(socket.into()) {
        Ok(socket) => Some(socket),
        Err(e) => {
            warn!("Failed to register discovery socket: {}", e);
            None
        }
    }
}
