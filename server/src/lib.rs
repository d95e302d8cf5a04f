//! # Chat Server Library
//!
//! This library provides the server side of the LAN chat and game
//! application. It tracks which users are present, relays chat and game
//! messages between them, and announces the server's address on the local
//! network so clients can connect without any configuration.
//!
//! ## Core Responsibilities
//!
//! ### Presence Registry
//! Maintains the authoritative map of connected users. Registration is an
//! atomic check-and-insert, so a username can never be held by two live
//! connections, and every user is assigned a random avatar in the same
//! step. Disconnects release the name for reuse immediately.
//!
//! ### Message Routing
//! All traffic flows through a central router that classifies each message
//! and delivers it:
//! - Room chat is fanned out to everyone except the sender
//! - Private chat goes to exactly one recipient
//! - Game messages are relayed opaquely to the named opponent
//! - Join and leave events produce system notices and roster updates
//!
//! ### Network Discovery
//! A UDP beacon broadcasts the chat port every couple of seconds. Clients
//! on the same network listen for the beacon and connect automatically;
//! the beacon also carries the server's primary address for networks where
//! the datagram source is not routable.
//!
//! ## Architecture Design
//!
//! ### Task Per Connection
//! Each accepted socket is serviced by one tokio task that races inbound
//! reads against the connection's outbound frame queue. Routing itself is
//! synchronous: handlers enqueue pre-encoded frames and never block on
//! socket I/O, so one slow client cannot stall another.
//!
//! ### Line-Oriented JSON Protocol
//! Chat traffic is newline-delimited JSON over TCP. Each line is a tagged
//! envelope; malformed lines are logged and dropped without affecting the
//! connection. Discovery uses the same envelope shape, one per datagram.
//!
//! ### Locking Discipline
//! The registry guards the session and avatar maps with a single mutex.
//! Critical sections only touch the maps; delivery always happens on a
//! snapshot taken after the lock is released, which keeps lock hold times
//! bounded and makes ordering per connection easy to reason about.
//!
//! ## Module Organization
//!
//! ### Registry Module (`registry`)
//! Session bookkeeping: id assignment, username uniqueness, avatar
//! mappings, and snapshot accessors for delivery.
//!
//! ### Router Module (`router`)
//! Envelope dispatch, join/leave announcement sequences, broadcast with
//! sender exclusion, and cleanup of peers whose queues have died.
//!
//! ### Acceptor Module (`acceptor`)
//! The TCP accept loop, the username handshake, and the per-connection
//! read/write task.
//!
//! ### Beacon Module (`beacon`)
//! The periodic UDP presence broadcast.
//!
//! ### Ports Module (`ports`)
//! Bind-probe scans that resolve the preferred chat and discovery ports,
//! with optional fallback to nearby ports.
//!
//! ### Avatars Module (`avatars`)
//! The avatar listing boundary: a directory-backed provider for the
//! binary and a fixed provider for tests.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::acceptor::{self, Acceptor};
//! use server::avatars::DirAvatars;
//! use server::beacon::Beacon;
//! use server::ports;
//! use server::registry::Registry;
//! use server::router::Router;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Resolve ports, scanning upward if the preferred ones are taken
//!     let chat_port = ports::find_available_port("0.0.0.0", 9000, true)
//!         .ok_or("no available chat port")?;
//!     let discovery_port = ports::find_available_discovery_port(9001, true)
//!         .ok_or("no available discovery port")?;
//!
//!     // Wire the registry, router, and acceptor together
//!     let registry = Arc::new(Registry::new());
//!     let avatars = Arc::new(DirAvatars::new("assets/avatars"));
//!     let router = Arc::new(Router::new(Arc::clone(&registry), avatars.clone()));
//!     let acceptor = Arc::new(Acceptor::new(registry, router, avatars));
//!
//!     let listener = acceptor::bind("0.0.0.0", chat_port).await?;
//!     let beacon = Beacon::new(
//!         "255.255.255.255".parse()?,
//!         discovery_port,
//!         chat_port,
//!         Duration::from_secs(2),
//!     );
//!
//!     // Run until Ctrl+C
//!     let shutdown = CancellationToken::new();
//!     tokio::spawn(beacon.run(shutdown.clone()));
//!     acceptor.run(listener, shutdown).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Failure Handling
//!
//! A peer whose outbound queue has closed is treated exactly like a peer
//! that hung up: it is unregistered, its departure is announced, and the
//! broadcast in progress continues to everyone else. Handshake rejections
//! use a plain-text reply because they happen before JSON framing starts.

pub mod acceptor;
pub mod avatars;
pub mod beacon;
pub mod ports;
pub mod registry;
pub mod router;
