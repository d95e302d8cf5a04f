use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default TCP port for the chat server.
pub const DEFAULT_SERVER_PORT: u16 = 9000;
/// Default UDP port for discovery broadcasts.
pub const DEFAULT_DISCOVERY_PORT: u16 = 9001;
/// Seconds between presence broadcasts.
pub const DISCOVERY_INTERVAL_SECS: u64 = 2;
/// How many consecutive ports a fallback scan may probe.
pub const PORT_SCAN_ATTEMPTS: u16 = 50;
/// Recipient name that addresses the shared chat room.
pub const GENERAL_CHAT: &str = "general";
/// Plain-text handshake rejection, sent before JSON framing begins.
pub const USERNAME_TAKEN_REJECTION: &str = "Username already taken";
/// Upper bound for a single discovery datagram.
pub const MAX_DATAGRAM_BYTES: usize = 1024;

/// One protocol message: a tagged `{type, data}` JSON object, sent as a
/// single newline-terminated line over the chat connection (or as one UDP
/// datagram for `Discovery`).
///
/// The `opponent` fields on the game variants are routing hints consumed by
/// the server; they are optional so relayed copies can omit them.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Envelope {
    Chat {
        sender: String,
        recipient: String,
        text: String,
    },
    System {
        text: String,
        chat_id: String,
    },
    Userlist {
        users: Vec<String>,
    },
    Avatar {
        username: String,
        avatar: String,
    },
    AvatarError {},
    SetAvatar {
        avatar: String,
    },
    GameInvite {
        opponent: String,
    },
    GameAccepted {
        player: String,
        symbol: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        opponent: Option<String>,
    },
    GameMove {
        board: Vec<Option<String>>,
        current_player: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        opponent: Option<String>,
    },
    GameEnd {
        result: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        opponent: Option<String>,
    },
    GameReset {
        player: String,
        symbol: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        opponent: Option<String>,
    },
    GameLeft {
        player: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        opponent: Option<String>,
    },
    Discovery {
        port: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ip: Option<String>,
    },
}

impl Envelope {
    /// Builds a `SYSTEM` notice addressed to the shared chat room.
    pub fn system(text: impl Into<String>) -> Self {
        Envelope::System {
            text: text.into(),
            chat_id: GENERAL_CHAT.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("envelope serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Serializes an envelope to one JSON line, newline included.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    let mut bytes = serde_json::to_vec(envelope)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parses one line as an envelope. Malformed input yields `None`; callers
/// drop such lines and keep the connection open.
pub fn decode(line: &str) -> Option<Envelope> {
    serde_json::from_str(line.trim()).ok()
}
