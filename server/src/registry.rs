//! Session registry for the chat server
//!
//! This module is the single source of truth for "who is online":
//! - Connection lifecycle (register on handshake, unregister on disconnect)
//! - Username uniqueness enforcement at registration time
//! - The avatar assignment table, mutated under the same lock as the roster
//! - Snapshots that let callers deliver messages without holding the lock
//!
//! All socket I/O happens outside this module; sessions are reached through
//! their queued frame senders so a slow peer can never stall the registry.

use log::info;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

/// Identifier assigned to each accepted connection.
pub type ConnId = u64;

/// Handle for queueing pre-encoded frames to one connection's write loop.
pub type FrameSender = UnboundedSender<Vec<u8>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    /// Another live session already holds this username.
    #[error("username '{0}' is already taken")]
    UsernameTaken(String),
}

/// One registered connection: its username and its outbound frame queue.
struct Session {
    username: String,
    sender: FrameSender,
}

/// Snapshot entry handed to callers for lock-free delivery.
///
/// Cloning the sender is cheap; sends on it fail only once the connection's
/// write loop has gone away, which callers treat as a disconnect.
#[derive(Clone)]
pub struct Peer {
    pub id: ConnId,
    pub username: String,
    pub sender: FrameSender,
}

/// Roster and avatar table, always mutated together.
struct Inner {
    sessions: HashMap<ConnId, Session>,
    avatars: HashMap<String, String>,
    next_id: ConnId,
}

/// Thread-safe map of connection -> username and username -> avatar.
///
/// A username appears at most once at any instant; the check and the insert
/// happen under one lock so concurrent handshakes cannot both win. Critical
/// sections only touch the maps, never sockets.
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                avatars: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        // a poisoned guard still holds consistent maps
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Atomically checks username availability and inserts the session.
    ///
    /// The freshly assigned avatar (if any) lands in the avatar table within
    /// the same critical section, so no observer can see a registered user
    /// without their avatar. Returns the new connection id.
    pub fn register(
        &self,
        username: &str,
        avatar: Option<String>,
        sender: FrameSender,
    ) -> Result<ConnId, RegisterError> {
        let mut inner = self.locked();

        if inner.sessions.values().any(|s| s.username == username) {
            return Err(RegisterError::UsernameTaken(username.to_string()));
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.sessions.insert(
            id,
            Session {
                username: username.to_string(),
                sender,
            },
        );
        if let Some(avatar) = avatar {
            inner.avatars.insert(username.to_string(), avatar);
        }

        info!("Client {} registered as '{}'", id, username);
        Ok(id)
    }

    /// Removes a session and its avatar mapping.
    ///
    /// Returns the username that was registered, or None if the connection
    /// was already gone; double-unregister is a no-op, which lets the write
    /// loop and a failed broadcast race on cleanup safely.
    pub fn unregister(&self, id: ConnId) -> Option<String> {
        let mut inner = self.locked();

        let session = inner.sessions.remove(&id)?;
        inner.avatars.remove(&session.username);

        info!("Client {} ('{}') unregistered", id, session.username);
        Some(session.username)
    }

    /// Copies the current roster for iteration outside the lock.
    pub fn snapshot(&self) -> Vec<Peer> {
        let inner = self.locked();
        inner
            .sessions
            .iter()
            .map(|(id, session)| Peer {
                id: *id,
                username: session.username.clone(),
                sender: session.sender.clone(),
            })
            .collect()
    }

    /// Looks up one connection by id for direct replies.
    pub fn peer(&self, id: ConnId) -> Option<Peer> {
        let inner = self.locked();
        inner.sessions.get(&id).map(|session| Peer {
            id,
            username: session.username.clone(),
            sender: session.sender.clone(),
        })
    }

    /// Linear scan for a username; fine at tens of sessions.
    pub fn find_by_username(&self, username: &str) -> Option<Peer> {
        let inner = self.locked();
        inner
            .sessions
            .iter()
            .find(|(_, session)| session.username == username)
            .map(|(id, session)| Peer {
                id: *id,
                username: session.username.clone(),
                sender: session.sender.clone(),
            })
    }

    /// All registered usernames, sorted for stable roster broadcasts.
    pub fn usernames(&self) -> Vec<String> {
        let inner = self.locked();
        let mut names: Vec<String> = inner
            .sessions
            .values()
            .map(|s| s.username.clone())
            .collect();
        names.sort();
        names
    }

    /// Updates a registered user's avatar. Returns false if the user is no
    /// longer connected, in which case the table is left untouched.
    pub fn set_avatar(&self, username: &str, avatar: &str) -> bool {
        let mut inner = self.locked();
        if !inner.sessions.values().any(|s| s.username == username) {
            return false;
        }
        inner
            .avatars
            .insert(username.to_string(), avatar.to_string());
        true
    }

    pub fn avatar_of(&self, username: &str) -> Option<String> {
        self.locked().avatars.get(username).cloned()
    }

    /// Copies the avatar table, sorted by username, for catch-up sends.
    pub fn avatars_snapshot(&self) -> Vec<(String, String)> {
        let inner = self.locked();
        let mut pairs: Vec<(String, String)> = inner
            .avatars
            .iter()
            .map(|(user, avatar)| (user.clone(), avatar.clone()))
            .collect();
        pairs.sort();
        pairs
    }

    /// Returns the number of currently registered sessions.
    pub fn len(&self) -> usize {
        self.locked().sessions.len()
    }

    /// Returns true if no sessions are registered.
    pub fn is_empty(&self) -> bool {
        self.locked().sessions.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
