//! Chat session: connect, handshake, and framed message I/O.
//!
//! `Session::connect` performs the raw username handshake and then hands
//! the socket to a reader task and a writer task. The caller talks to the
//! session through plain queues: `send` enqueues envelopes for the wire,
//! `next_event` yields decoded envelopes and ends with a single
//! `Disconnected` once the connection is gone.
//!
//! The server answers a rejected username with a bare string rather than
//! an envelope, inside the same initial burst that otherwise carries the
//! roster catch-up, so the handshake sniffs the burst before any framing
//! is assumed.

use log::{debug, warn};
use shared::{decode, encode, Envelope, USERNAME_TAKEN_REJECTION};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// How long the handshake keeps reading once the server goes quiet.
const HANDSHAKE_WINDOW: Duration = Duration::from_millis(400);

#[derive(Debug, Error)]
pub enum ConnectError {
    /// Another live session already holds this username.
    #[error("username '{0}' is already taken")]
    UsernameTaken(String),
    /// The server could not be reached or dropped the handshake.
    #[error("could not connect to the server: {0}")]
    Io(#[from] std::io::Error),
}

/// One inbound occurrence on an established session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A decoded envelope from the server.
    Message(Envelope),
    /// The connection is gone; no further events follow.
    Disconnected,
}

pub struct Session {
    username: String,
    outbound: mpsc::UnboundedSender<Envelope>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Session {
    /// Connects, sends the username, and screens the server's first reply.
    pub async fn connect(host: &str, port: u16, username: &str) -> Result<Session, ConnectError> {
        let mut stream = TcpStream::connect((host, port)).await?;
        stream.write_all(username.as_bytes()).await?;

        let burst = read_initial_burst(&mut stream).await;
        if String::from_utf8_lossy(&burst).contains(USERNAME_TAKEN_REJECTION) {
            return Err(ConnectError::UsernameTaken(username.to_string()));
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (read_half, write_half) = stream.into_split();

        tokio::spawn(read_loop(read_half, burst, events_tx));
        tokio::spawn(write_loop(write_half, outbound_rx));

        debug!("Session established for '{}'", username);
        Ok(Session {
            username: username.to_string(),
            outbound,
            events,
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Queues one envelope for the server. Returns false once the
    /// connection is gone.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.outbound.send(envelope).is_ok()
    }

    /// The next inbound event; `None` only after `Disconnected` has been
    /// consumed.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }
}

/// Collects the server's initial reply, stopping once it pauses.
///
/// The burst may hold the rejection string or the first batch of
/// envelopes; whatever it is, the caller decides before framing starts.
async fn read_initial_burst<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut burst = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match timeout(HANDSHAKE_WINDOW, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => burst.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) | Err(_) => break,
        }
    }
    burst
}

/// Reads frames off the socket and forwards decoded envelopes, starting
/// with whatever the handshake already buffered.
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    seed: Vec<u8>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let mut buf = seed;
    let mut chunk = [0u8; 1024];

    loop {
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            if text.trim().is_empty() {
                continue;
            }
            match decode(&text) {
                Some(envelope) => {
                    if events.send(SessionEvent::Message(envelope)).is_err() {
                        return;
                    }
                }
                None => warn!("Dropping malformed line from server"),
            }
        }

        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) => {
                debug!("Server read failed: {}", e);
                break;
            }
        }
    }

    let _ = events.send(SessionEvent::Disconnected);
}

/// Encodes and writes queued envelopes until the queue or socket closes.
async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(envelope) = outbound.recv().await {
        let frame = match encode(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping unencodable envelope: {}", e);
                continue;
            }
        };
        if let Err(e) = writer.write_all(&frame).await {
            debug!("Server write failed: {}", e);
            break;
        }
    }
}
