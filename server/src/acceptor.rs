//! TCP intake: accept loop, username handshake, per-connection task.
//!
//! Each accepted socket gets one task. The first read is the handshake:
//! the client sends its username as a raw unterminated chunk, and a taken
//! name is answered with a plain-text rejection before any JSON flows.
//! After registration the task services the socket with `select!`, racing
//! buffered line reads against the connection's outbound frame queue.

use crate::avatars::AvatarProvider;
use crate::registry::{ConnId, Registry};
use crate::router::Router;
use log::{debug, info, warn};
use shared::{decode, USERNAME_TAKEN_REJECTION};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct Acceptor {
    registry: Arc<Registry>,
    router: Arc<Router>,
    avatars: Arc<dyn AvatarProvider>,
}

impl Acceptor {
    pub fn new(
        registry: Arc<Registry>,
        router: Arc<Router>,
        avatars: Arc<dyn AvatarProvider>,
    ) -> Self {
        Self {
            registry,
            router,
            avatars,
        }
    }

    /// Accepts connections until the token fires, spawning one task each.
    pub async fn run(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Acceptor shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let acceptor = Arc::clone(&self);
                        let token = shutdown.clone();
                        tokio::spawn(async move {
                            acceptor.handle_connection(stream, addr, token).await;
                        });
                    }
                    Err(e) => warn!("Failed to accept connection: {}", e),
                }
            }
        }
    }

    /// Drives one connection from handshake to disconnect cleanup.
    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        addr: SocketAddr,
        shutdown: CancellationToken,
    ) {
        debug!("Connection from {}", addr);

        // Liveness probes connect without ever sending a username; they
        // park here until the probe closes and never register.
        let Some((username, mut line_buf)) = read_handshake(&mut stream).await else {
            debug!("Connection from {} closed before handshake", addr);
            return;
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn_id = match self
            .registry
            .register(&username, self.avatars.pick_random(), tx)
        {
            Ok(id) => id,
            Err(e) => {
                warn!("Rejected {}: {}", addr, e);
                let _ = stream.write_all(USERNAME_TAKEN_REJECTION.as_bytes()).await;
                return;
            }
        };
        self.router.handle_join(&username);

        let (mut read_half, mut write_half) = stream.split();
        let mut chunk = [0u8; 1024];

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                maybe_frame = rx.recv() => {
                    let Some(frame) = maybe_frame else { break };
                    if let Err(e) = write_half.write_all(&frame).await {
                        debug!("Write to '{}' failed: {}", username, e);
                        break;
                    }
                }
                read = read_half.read(&mut chunk) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        line_buf.extend_from_slice(&chunk[..n]);
                        self.dispatch_lines(conn_id, &username, &mut line_buf);
                    }
                    Err(e) => {
                        debug!("Read from '{}' failed: {}", username, e);
                        break;
                    }
                }
            }
        }

        self.router.handle_disconnect(conn_id);
        debug!("Connection from {} closed", addr);
    }

    /// Drains every complete line out of the buffer into the router.
    fn dispatch_lines(&self, conn_id: ConnId, username: &str, buf: &mut Vec<u8>) {
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            match decode(&text) {
                Some(envelope) => self.router.dispatch(conn_id, username, envelope),
                None => {
                    if !text.trim().is_empty() {
                        warn!("Dropping malformed line from '{}'", username);
                    }
                }
            }
        }
    }
}

/// Reads the handshake chunk, returning the username and any bytes the
/// client sent past it. `None` means the connection should just close:
/// the peer disconnected, errored, or sent a blank name.
async fn read_handshake<S: AsyncRead + Unpin>(stream: &mut S) -> Option<(String, Vec<u8>)> {
    let mut chunk = [0u8; 1024];
    let n = match stream.read(&mut chunk).await {
        Ok(0) => return None,
        Ok(n) => n,
        Err(_) => return None,
    };
    let raw = &chunk[..n];

    // The username arrives unterminated; a newline in the chunk means the
    // client got ahead of the handshake, so the remainder is kept for the
    // line loop.
    let (name_bytes, leftover) = match raw.iter().position(|&b| b == b'\n') {
        Some(pos) => (&raw[..pos], raw[pos + 1..].to_vec()),
        None => (raw, Vec::new()),
    };

    let username = String::from_utf8_lossy(name_bytes).trim().to_string();
    if username.is_empty() {
        return None;
    }
    Some((username, leftover))
}

/// Binds the chat listener on the resolved port.
pub async fn bind(host: &str, port: u16) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind((host, port)).await?;
    info!("Chat server listening on {}", listener.local_addr()?);
    Ok(listener)
}
