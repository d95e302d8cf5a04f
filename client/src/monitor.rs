//! Persistent server liveness monitoring.
//!
//! Keeps one probe connection open to whatever address discovery has
//! resolved and watches it with a cheap periodic peek. The probe never
//! sends anything, so on the server side it parks in the handshake and
//! costs nothing. When the probe dies the monitor flips the online flag
//! off and kicks discovery back into searching; a manual override makes
//! that kick a no-op, so a manually pinned address just keeps being
//! re-probed.

use crate::discovery::DiscoveryService;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Connection attempt budget.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Cadence of liveness checks on an open probe.
const CHECK_INTERVAL: Duration = Duration::from_millis(500);
/// Pause after a failed connection attempt.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(3);
/// How long one peek may wait before counting as "no data, still alive".
const PEEK_WINDOW: Duration = Duration::from_millis(100);

pub struct LivenessMonitor {
    discovery: Arc<DiscoveryService>,
    online: AtomicBool,
}

impl LivenessMonitor {
    pub fn new(discovery: Arc<DiscoveryService>) -> Self {
        Self {
            discovery,
            online: AtomicBool::new(false),
        }
    }

    /// Whether the resolved server currently accepts connections.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Runs the probe loop until the token fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.worker(shutdown).await })
    }

    async fn worker(&self, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            let Some((host, port)) = self.discovery.server_addr() else {
                pause(CHECK_INTERVAL, &shutdown).await;
                continue;
            };

            match timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), port))).await {
                Ok(Ok(stream)) => {
                    info!("Server {}:{} is online", host, port);
                    self.online.store(true, Ordering::SeqCst);

                    self.watch(&stream, &shutdown).await;

                    self.online.store(false, Ordering::SeqCst);
                    if shutdown.is_cancelled() {
                        return;
                    }
                    info!("Lost server {}:{}", host, port);
                    drop(stream);
                    self.discovery.restart_discovery();
                }
                Ok(Err(e)) => {
                    debug!("Server {}:{} not reachable: {}", host, port, e);
                    pause(RECONNECT_BACKOFF, &shutdown).await;
                }
                Err(_) => {
                    debug!("Server {}:{} not reachable: connect timed out", host, port);
                    pause(RECONNECT_BACKOFF, &shutdown).await;
                }
            }
        }
    }

    /// Returns when the probe stream dies or shutdown fires.
    async fn watch(&self, stream: &TcpStream, shutdown: &CancellationToken) {
        let mut byte = [0u8; 1];
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match timeout(PEEK_WINDOW, stream.peek(&mut byte)).await {
                // Nothing readable inside the window: still alive.
                Err(_) => {}
                // The peer closed the stream.
                Ok(Ok(0)) => return,
                // Unread data also proves the stream is alive.
                Ok(Ok(_)) => {}
                Ok(Err(_)) => return,
            }
            pause(CHECK_INTERVAL, shutdown).await;
        }
    }
}

async fn pause(duration: Duration, shutdown: &CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = sleep(duration) => {}
    }
}
