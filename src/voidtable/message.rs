//! Wire protocol primitives shared by every participant.
//!
//! All coordination in voidtable happens through typed [`Message`]s flowing
//! over the [`MessageBus`](crate::voidtable::bus::MessageBus). Each message is
//! one UTF-8 JSON object terminated by `\n`; the bus and every agent frame
//! and parse with the helpers in this module.
//!
//! # Wire format
//!
//! ```text
//! {"id":"…","type":"action_declared","sender":"player_01","recipient":null,
//!  "payload":{…},"timestamp":"2025-07-01T12:00:00Z"}
//! ```
//!
//! A `null` (or absent) `recipient` means broadcast.
//!
//! # Example
//!
//! ```rust
//! use voidtable::voidtable::message::{Message, MessageType};
//! use serde_json::json;
//!
//! let msg = Message::new(
//!     MessageType::TurnRequest,
//!     "coordinator",
//!     Some("player_01".into()),
//!     json!({"phase": "declaration", "initiative": 27}),
//! );
//!
//! let line = msg.to_wire().unwrap();
//! assert!(line.ends_with('\n'));
//!
//! let parsed = Message::from_wire(line.trim_end()).unwrap();
//! assert_eq!(parsed.message_type, MessageType::TurnRequest);
//! assert_eq!(parsed.recipient.as_deref(), Some("player_01"));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Every message type the session protocol understands.
///
/// Agents ignore types they have no handler for — a turn-phase message may be
/// destined for a coordinator-side handler living in the same process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // System messages
    AgentRegister,
    AgentReady,
    SessionStart,
    SessionEnd,

    // Game flow messages
    ScenarioSetup,
    /// Mid-game scenario pivots and story advancement notices.
    ScenarioUpdate,
    TurnRequest,
    ActionDeclared,
    ActionResolved,

    // State sync messages
    GameStateUpdate,
    CharacterUpdate,

    // AI interactions
    DmNarration,
    NpcDialogue,
    PlayerResponse,

    // System control
    Ping,
    Pong,
    Shutdown,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Reuse the serde snake_case names so log lines match the wire.
        let s = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// One frame on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id (uuid v4).
    pub id: String,
    /// Message discriminant.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Agent id of the sender (`dm_01`, `player_01`, `coordinator`, …).
    pub sender: String,
    /// Target agent id, or `None` for broadcast.
    #[serde(default)]
    pub recipient: Option<String>,
    /// Type-specific payload.
    #[serde(default)]
    pub payload: Value,
    /// UTC creation time.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message with a fresh id and the current timestamp.
    pub fn new(
        message_type: MessageType,
        sender: impl Into<String>,
        recipient: Option<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            sender: sender.into(),
            recipient,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Serialize to a single newline-terminated JSON frame.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one frame (without its trailing newline).
    pub fn from_wire(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Convenience accessor: a string field out of the payload object.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Convenience accessor: an integer field out of the payload object.
    pub fn payload_i64(&self, key: &str) -> Option<i64> {
        self.payload.get(key).and_then(Value::as_i64)
    }

    /// Convenience accessor: a boolean field out of the payload object.
    pub fn payload_bool(&self, key: &str) -> Option<bool> {
        self.payload.get(key).and_then(Value::as_bool)
    }
}
