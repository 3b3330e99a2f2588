// ================
// common/src/lib.rs
// ================
//! Common types and structures
//! used for communication between realtime clients and the relay server.
//! This module defines the wire envelope, presence payloads, the request
//! shapes of the stream and emit endpoints, and the room-key conventions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub mod event;

pub use event::{
    ChatMessage, CursorMove, PresenceStatus, Reaction, RealtimeEvent, StatusChange, TypingSignal,
    TypingState,
};

/// Milliseconds since the Unix epoch, as carried in `Envelope::ts`
pub type Timestamp = i64;

/// Event type names understood by the broker and the sync engine.
///
/// The broker treats every name as an opaque string; only `presence`,
/// `ready` and `ping` are synthesized by the server itself.
pub mod kinds {
    pub const PRESENCE: &str = "presence";
    pub const READY: &str = "ready";
    pub const PING: &str = "ping";
    pub const CHAT: &str = "chat";
    pub const DM: &str = "dm";
    pub const FILE: &str = "file";
    pub const TASK: &str = "task";
    pub const CURSOR: &str = "cursor";
    pub const TYPING: &str = "typing";
    pub const REACTION: &str = "reaction";
    pub const USER_STATUS: &str = "user_status";
    pub const CALL_START: &str = "call_start";
    pub const CALL_END: &str = "call_end";
    pub const WHITEBOARD_DRAW: &str = "whiteboard_draw";
    pub const WHITEBOARD_CLEAR: &str = "whiteboard_clear";
    pub const FOCUS_SESSION_START: &str = "focus_session_start";
    pub const FOCUS_SESSION_END: &str = "focus_session_end";
}

/// Organizational level of a user.
///
/// Used for display and client-side hints only; the relay never enforces it.
/// Unknown values decode as `Member`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Lead,
    Manager,
    Director,
    Admin,
    #[default]
    #[serde(other)]
    Member,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Member => "member",
            Role::Lead => "lead",
            Role::Manager => "manager",
            Role::Director => "director",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ephemeral identity attached to connections and envelopes
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct User {
    /// Stable client-generated identifier
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Organizational level
    #[serde(default)]
    pub role: Role,
}

impl User {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role,
        }
    }
}

/// Wrapper around a payload carrying sender identity and timestamp.
///
/// The event type travels as the SSE `event:` name; it is repeated in
/// `type` so the data line is self-describing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Event type name
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Sender identity
    pub user: User,
    /// Opaque event payload
    #[serde(default)]
    pub payload: Value,
    /// Server receive time in epoch milliseconds
    #[serde(default)]
    pub ts: Timestamp,
}

impl Envelope {
    /// Build an envelope stamped with the current time
    pub fn new(kind: impl Into<String>, user: User, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            user,
            payload,
            ts: now_millis(),
        }
    }
}

/// Broker-synthesized membership notifications
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Presence {
    /// Full member list, sent only to a connection that just opened
    State { members: Vec<User> },
    /// A user's first connection to the room opened
    Join { user: User },
    /// A user's last connection to the room closed
    Leave { user: User },
}

/// Sent right after the presence snapshot on a new stream
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ready {
    pub connection_id: String,
    pub room: String,
}

/// Body of `POST /realtime/emit`
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EmitRequest {
    /// Target room key
    pub room: String,
    /// Event type name
    pub event: String,
    /// Opaque payload, `{}` when omitted
    #[serde(default = "empty_object")]
    pub payload: Value,
    /// Sender identity
    pub user: User,
}

/// Query parameters of `GET /realtime/stream`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StreamParams {
    /// Room key to join
    pub room: String,
    /// User id
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Organizational level
    #[serde(default)]
    pub role: Role,
}

impl StreamParams {
    pub fn new(room: impl Into<String>, user: &User) -> Self {
        Self {
            room: room.into(),
            id: user.id.clone(),
            name: user.name.clone(),
            role: user.role,
        }
    }

    /// Identity carried by these parameters; the id doubles as the name when none was given
    pub fn user(&self) -> User {
        let name = if self.name.is_empty() {
            self.id.clone()
        } else {
            self.name.clone()
        };
        User::new(self.id.clone(), name, self.role)
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Current time in epoch milliseconds
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// Room key of a direct conversation.
///
/// Both participants compute the same key without a lookup:
/// `dm_key(a, b) == dm_key(b, a)`, and `dm_key(a, a)` is still stable.
pub fn dm_key(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("dm:{lo}:{hi}")
}

/// Split a DM room key back into its two participants
pub fn parse_dm_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix("dm:")?;
    let (a, b) = rest.split_once(':')?;
    if a.is_empty() || b.is_empty() {
        return None;
    }
    Some((a, b))
}

/// Personal channel of one user
pub fn user_channel(user_id: &str) -> String {
    format!("user:{user_id}")
}

/// Shared broadcast room of an organizational unit
pub fn company_room(company_id: &str) -> String {
    format!("company:{company_id}:main")
}
