//! Typed view over event payloads.
//!
//! The broker forwards payloads untouched. Consumers decode a frame into
//! a `RealtimeEvent` at the dispatch boundary; an unknown type name or a
//! payload that does not fit its variant becomes `RealtimeEvent::Other`.

use crate::{kinds, Presence, Ready};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Chat or direct message body
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Client-generated id, used by consumers to deduplicate
    pub id: String,
    pub text: String,
    /// Id of the message this one answers; not validated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Recipient user id (direct messages only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// DM room key of the conversation (direct messages only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TypingState {
    Start,
    Stop,
}

/// `typing:start` / `typing:stop`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TypingSignal {
    pub state: TypingState,
    /// Room the user is typing in, when not the room the event travels on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub status: PresenceStatus,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CursorMove {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub message_id: String,
    pub emoji: String,
}

/// One decoded frame payload
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    Presence(Presence),
    Ready(Ready),
    Ping,
    Chat(ChatMessage),
    Dm(ChatMessage),
    File(Value),
    Task(Value),
    Cursor(CursorMove),
    Typing(TypingSignal),
    Reaction(Reaction),
    UserStatus(StatusChange),
    /// `call_*`
    Call { kind: String, payload: Value },
    /// `whiteboard_*`
    Whiteboard { kind: String, payload: Value },
    /// `focus_session_*`
    Focus { kind: String, payload: Value },
    /// Unknown type, or a payload that did not match its type
    Other { kind: String, payload: Value },
}

impl RealtimeEvent {
    /// Decode a payload given its event type name
    pub fn decode(kind: &str, payload: Value) -> Self {
        match kind {
            kinds::PRESENCE => typed(kind, payload, RealtimeEvent::Presence),
            kinds::READY => typed(kind, payload, RealtimeEvent::Ready),
            kinds::PING => RealtimeEvent::Ping,
            kinds::CHAT => typed(kind, payload, RealtimeEvent::Chat),
            kinds::DM => typed(kind, payload, RealtimeEvent::Dm),
            kinds::FILE => RealtimeEvent::File(payload),
            kinds::TASK => RealtimeEvent::Task(payload),
            kinds::CURSOR => typed(kind, payload, RealtimeEvent::Cursor),
            kinds::TYPING => typed(kind, payload, RealtimeEvent::Typing),
            kinds::REACTION => typed(kind, payload, RealtimeEvent::Reaction),
            kinds::USER_STATUS => typed(kind, payload, RealtimeEvent::UserStatus),
            k if k.starts_with("call_") => RealtimeEvent::Call {
                kind: k.to_string(),
                payload,
            },
            k if k.starts_with("whiteboard_") => RealtimeEvent::Whiteboard {
                kind: k.to_string(),
                payload,
            },
            k if k.starts_with("focus_session_") => RealtimeEvent::Focus {
                kind: k.to_string(),
                payload,
            },
            k => RealtimeEvent::Other {
                kind: k.to_string(),
                payload,
            },
        }
    }

    /// Event type name this variant travels under
    pub fn kind(&self) -> &str {
        match self {
            RealtimeEvent::Presence(_) => kinds::PRESENCE,
            RealtimeEvent::Ready(_) => kinds::READY,
            RealtimeEvent::Ping => kinds::PING,
            RealtimeEvent::Chat(_) => kinds::CHAT,
            RealtimeEvent::Dm(_) => kinds::DM,
            RealtimeEvent::File(_) => kinds::FILE,
            RealtimeEvent::Task(_) => kinds::TASK,
            RealtimeEvent::Cursor(_) => kinds::CURSOR,
            RealtimeEvent::Typing(_) => kinds::TYPING,
            RealtimeEvent::Reaction(_) => kinds::REACTION,
            RealtimeEvent::UserStatus(_) => kinds::USER_STATUS,
            RealtimeEvent::Call { kind, .. }
            | RealtimeEvent::Whiteboard { kind, .. }
            | RealtimeEvent::Focus { kind, .. }
            | RealtimeEvent::Other { kind, .. } => kind,
        }
    }

    /// Whether this is an authored message that may deserve a notification
    pub fn is_message_like(&self) -> bool {
        matches!(
            self,
            RealtimeEvent::Chat(_)
                | RealtimeEvent::Dm(_)
                | RealtimeEvent::File(_)
                | RealtimeEvent::Task(_)
        )
    }
}

fn typed<T, F>(kind: &str, payload: Value, wrap: F) -> RealtimeEvent
where
    T: for<'de> Deserialize<'de>,
    F: FnOnce(T) -> RealtimeEvent,
{
    match T::deserialize(&payload) {
        Ok(value) => wrap(value),
        Err(_) => RealtimeEvent::Other {
            kind: kind.to_string(),
            payload,
        },
    }
}
