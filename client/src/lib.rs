//! # Chat Client Library
//!
//! This library provides the client-side networking for the chat and game
//! application. It finds a server on the local network, tracks whether that
//! server is still alive, and runs the framed message session the rest of
//! the application talks through.
//!
//! ## Architecture Overview
//!
//! The client is designed so the user interface never blocks on the
//! network. Discovery, liveness probing, and socket I/O all run as
//! background tasks; the application observes them through cheap state
//! snapshots and message queues.
//!
//! ### Automatic Discovery
//! Servers announce themselves over UDP broadcast. The discovery service
//! listens across a small port range, resolves the first announcement it
//! hears, and optionally falls back to localhost when the network stays
//! silent too long. Manual and environment overrides short-circuit the
//! search for setups where broadcast is filtered.
//!
//! ### Liveness Monitoring
//! A dedicated probe connection is held open against whatever address
//! discovery resolved. When that connection dies the monitor flips the
//! online flag off and sends discovery searching again, so the client
//! follows a server that restarts on a different port.
//!
//! ### Framed Sessions
//! Chat traffic is newline-delimited JSON over TCP. The session module
//! owns the socket, splits it into reader and writer tasks, and exposes
//! typed envelopes on both sides.
//!
//! ## Module Organization
//!
//! ### Config Module (`config`)
//! Environment-driven tuning for discovery:
//! - Discovery port and scan span
//! - Retry and force-timeout intervals
//! - Localhost fallback policy and host/port overrides
//!
//! ### Discovery Module (`discovery`)
//! The server-location state machine:
//! - UDP broadcast listeners over the configured port range
//! - Override precedence (manual, then environment, then search)
//! - Localhost fallback, taken at most once per search
//!
//! ### Monitor Module (`monitor`)
//! Connection liveness tracking:
//! - One persistent probe socket against the resolved server
//! - An online flag the UI can poll at any time
//! - Automatic discovery restart when the server goes away
//!
//! ### Session Module (`session`)
//! The chat connection itself:
//! - Username handshake, including the taken-name rejection
//! - Reader and writer tasks over the split socket
//! - Envelope queues in both directions
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::config::Config;
//! use client::discovery::DiscoveryService;
//! use client::monitor::LivenessMonitor;
//! use client::session::{Session, SessionEvent};
//! use shared::{Envelope, GENERAL_CHAT};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let shutdown = CancellationToken::new();
//!     let discovery = Arc::new(DiscoveryService::new(Config::from_env()));
//!     let _discovery_task = discovery.clone().spawn(shutdown.clone());
//!
//!     let monitor = Arc::new(LivenessMonitor::new(discovery.clone()));
//!     let _monitor_task = monitor.clone().spawn(shutdown.clone());
//!
//!     // Block until discovery lands on an address.
//!     let (host, port) = loop {
//!         match discovery.server_addr() {
//!             Some(addr) => break addr,
//!             None => tokio::time::sleep(Duration::from_millis(200)).await,
//!         }
//!     };
//!
//!     let mut session = Session::connect(&host, port, "alice").await?;
//!     session.send(Envelope::Chat {
//!         sender: "alice".to_string(),
//!         recipient: GENERAL_CHAT.to_string(),
//!         text: "hello everyone".to_string(),
//!     });
//!
//!     while let Some(event) = session.next_event().await {
//!         match event {
//!             SessionEvent::Message(envelope) => println!("{:?}", envelope),
//!             SessionEvent::Disconnected => break,
//!         }
//!     }
//!
//!     shutdown.cancel();
//!     Ok(())
//! }
//! ```
//!
//! ## Design Philosophy
//!
//! ### Keep Searching
//! Discovery never concludes "no server exists". Short of an explicit
//! fallback it keeps listening, because on a home network the server may
//! simply not have started yet.
//!
//! ### Overrides Win
//! When the user pins an address, automation stands down. A manual
//! override survives discovery restarts and is only lifted by an explicit
//! clear.
//!
//! ### Fail Toward the Flag
//! Liveness is a single boolean the interface can poll every frame.
//! Anything ambiguous on the probe socket counts as dead so the flag goes
//! off quickly; discovery then proves the server again before the flag
//! comes back.

pub mod config;
pub mod discovery;
pub mod monitor;
pub mod session;
