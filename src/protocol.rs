//! Space wire protocol.
//!
//! This module owns **every frame that crosses the WebSocket** between the
//! client core and the space server. One connection per space carries all of
//! them; the `type` field is the only thing the transport looks at.
//!
//! ## Frame families
//!
//! | Family      | Tags                                                   | Direction        |
//! |-------------|--------------------------------------------------------|------------------|
//! | movement    | `move`                                                 | both             |
//! | roster      | `user_joined`, `user_left`, `user_list`, `request_users` | server → client (request: client → server) |
//! | zones       | `zone_enter`, `zone_exit`                              | client → server  |
//! | zones       | `zone_entered`, `zone_exited`                          | server → client  |
//! | chat        | `chat_message`, `proximity_chat`                       | both             |
//! | direct msgs | `dm_sent`                                              | client → server  |
//! | direct msgs | `dm_received`, `dm_updated`, `dm_deleted`              | server → client  |
//!
//! ## Design rules
//!
//! 1. Every frame is a JSON object tagged by `type` with snake_case fields.
//! 2. Outbound frames carry the envelope version `v`; inbound frames without
//!    one are read as version 1.
//! 3. Optional fields default rather than fail, so older servers still parse.
//! 4. Unknown tags are a decode error; the caller logs and drops them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Direction, RosterEntry, ZoneKind};

/// Current envelope version written on outbound frames.
pub const PROTOCOL_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("frame has no `type` tag")]
    MissingType,
    #[error("unknown frame type `{0}`")]
    UnknownType(String),
    #[error("malformed `{tag}` frame: {source}")]
    Malformed {
        tag: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode `{tag}` frame: {source}")]
    Encode {
        tag: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Versioned wrapper around a [`Frame`]. The frame's fields sit at the top
/// level next to `v` and `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "default_version")]
    pub v: u32,
    #[serde(flatten)]
    pub frame: Frame,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// The closed set of frames understood by both ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Position report. Outbound frames omit `user_id`; the server stamps it.
    #[serde(alias = "player_move")]
    Move(MoveFrame),
    UserJoined(RosterEntry),
    UserLeft {
        user_id: String,
    },
    UserList {
        users: Vec<RosterEntry>,
    },
    /// Ask the server to push a fresh `user_list`.
    RequestUsers,
    ZoneEnter {
        zone_id: String,
        zone_type: ZoneKind,
    },
    ZoneExit {
        zone_id: String,
    },
    /// Server confirmation of zone entry with the current member list.
    ZoneEntered {
        zone_id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        members: Vec<String>,
    },
    ZoneExited {
        zone_id: String,
    },
    ChatMessage(ChatMessage),
    ProximityChat(ChatMessage),
    DmSent {
        target_id: String,
        message: String,
    },
    DmReceived {
        message: serde_json::Value,
    },
    DmUpdated {
        message: serde_json::Value,
    },
    DmDeleted {
        message_id: String,
    },
}

impl Frame {
    /// The wire tag of this frame.
    pub fn tag(&self) -> &'static str {
        match self {
            Frame::Move(_) => tags::MOVE,
            Frame::UserJoined(_) => tags::USER_JOINED,
            Frame::UserLeft { .. } => tags::USER_LEFT,
            Frame::UserList { .. } => tags::USER_LIST,
            Frame::RequestUsers => tags::REQUEST_USERS,
            Frame::ZoneEnter { .. } => tags::ZONE_ENTER,
            Frame::ZoneExit { .. } => tags::ZONE_EXIT,
            Frame::ZoneEntered { .. } => tags::ZONE_ENTERED,
            Frame::ZoneExited { .. } => tags::ZONE_EXITED,
            Frame::ChatMessage(_) => tags::CHAT_MESSAGE,
            Frame::ProximityChat(_) => tags::PROXIMITY_CHAT,
            Frame::DmSent { .. } => tags::DM_SENT,
            Frame::DmReceived { .. } => tags::DM_RECEIVED,
            Frame::DmUpdated { .. } => tags::DM_UPDATED,
            Frame::DmDeleted { .. } => tags::DM_DELETED,
        }
    }
}

/// `move` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub x: i32,
    pub y: i32,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Which conversation plane a chat message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatScope {
    /// Persistent channel message (stored via the REST collaborator).
    Channel,
    /// Ephemeral message scoped to the current zone.
    Zone,
    /// One-to-one message.
    Direct,
    /// Ephemeral message to whoever is nearby in the open world.
    Proximity,
    /// Space-wide broadcast.
    Global,
}

/// `chat_message` / `proximity_chat` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub scope: ChatScope,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Full persisted message object forwarded to channel recipients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_data: Option<serde_json::Value>,
}

impl ChatMessage {
    pub fn new(scope: ChatScope, message: impl Into<String>) -> Self {
        Self {
            scope,
            message: message.into(),
            channel_id: None,
            zone_id: None,
            target_id: None,
            sender: None,
            username: None,
            timestamp: None,
            message_data: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound seam
// ---------------------------------------------------------------------------

/// Anything that can put a frame on the wire. Implemented by the transport;
/// tests use a recording sink.
pub trait FrameSink: Send + Sync {
    /// Queue `frame` for sending. Returns `false` if it was dropped.
    fn send(&self, frame: &Frame) -> bool;
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Serialise `frame` inside a versioned envelope.
pub fn encode(frame: &Frame) -> Result<String, ProtocolError> {
    let envelope = Envelope {
        v: PROTOCOL_VERSION,
        frame: frame.clone(),
    };
    serde_json::to_string(&envelope).map_err(|source| ProtocolError::Encode {
        tag: frame.tag(),
        source,
    })
}

/// Parse one inbound text payload.
pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;

    let tag = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    if !tags::is_known(&tag) {
        return Err(ProtocolError::UnknownType(tag));
    }

    serde_json::from_value(value).map_err(|source| ProtocolError::Malformed { tag, source })
}

// ---------------------------------------------------------------------------
// Tag constants
// ---------------------------------------------------------------------------

/// All frame tags, as constants.
pub mod tags {
    pub const MOVE: &str = "move";
    /// Legacy spelling still sent by some servers.
    pub const PLAYER_MOVE: &str = "player_move";

    pub const USER_JOINED: &str = "user_joined";
    pub const USER_LEFT: &str = "user_left";
    pub const USER_LIST: &str = "user_list";
    pub const REQUEST_USERS: &str = "request_users";

    pub const ZONE_ENTER: &str = "zone_enter";
    pub const ZONE_EXIT: &str = "zone_exit";
    pub const ZONE_ENTERED: &str = "zone_entered";
    pub const ZONE_EXITED: &str = "zone_exited";

    pub const CHAT_MESSAGE: &str = "chat_message";
    pub const PROXIMITY_CHAT: &str = "proximity_chat";

    pub const DM_SENT: &str = "dm_sent";
    pub const DM_RECEIVED: &str = "dm_received";
    pub const DM_UPDATED: &str = "dm_updated";
    pub const DM_DELETED: &str = "dm_deleted";

    const ALL: &[&str] = &[
        MOVE,
        PLAYER_MOVE,
        USER_JOINED,
        USER_LEFT,
        USER_LIST,
        REQUEST_USERS,
        ZONE_ENTER,
        ZONE_EXIT,
        ZONE_ENTERED,
        ZONE_EXITED,
        CHAT_MESSAGE,
        PROXIMITY_CHAT,
        DM_SENT,
        DM_RECEIVED,
        DM_UPDATED,
        DM_DELETED,
    ];

    pub fn is_known(tag: &str) -> bool {
        ALL.contains(&tag)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_frame_is_tagged_and_versioned() {
        let frame = Frame::Move(MoveFrame {
            user_id: None,
            x: 4,
            y: 7,
            direction: Direction::Left,
            username: Some("ada".into()),
        });
        let text = encode(&frame).unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "move");
        assert_eq!(v["v"], 1);
        assert_eq!(v["x"], 4);
        assert_eq!(v["direction"], "left");
        assert_eq!(v["username"], "ada");
        assert!(v.get("user_id").is_none());
    }

    #[test]
    fn request_users_has_only_tag_and_version() {
        let text = encode(&Frame::RequestUsers).unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "request_users");
        assert_eq!(v.as_object().unwrap().len(), 2);
    }

    #[test]
    fn decode_defaults_missing_version() {
        let env = decode(r#"{"type":"user_left","user_id":"u1"}"#).unwrap();
        assert_eq!(env.v, PROTOCOL_VERSION);
        assert_eq!(
            env.frame,
            Frame::UserLeft {
                user_id: "u1".into()
            }
        );
    }

    #[test]
    fn decode_accepts_legacy_player_move() {
        let env = decode(r#"{"type":"player_move","user_id":"u2","x":1,"y":2}"#).unwrap();
        match env.frame {
            Frame::Move(m) => {
                assert_eq!(m.user_id.as_deref(), Some("u2"));
                assert_eq!((m.x, m.y), (1, 2));
                assert_eq!(m.direction, Direction::Down);
            }
            other => panic!("expected Move, got {other:?}"),
        }
    }

    #[test]
    fn decode_user_list_with_partial_entries() {
        let env = decode(
            r#"{"type":"user_list","users":[{"user_id":"a","x":3,"y":4},{"user_id":"b"}]}"#,
        )
        .unwrap();
        let Frame::UserList { users } = env.frame else {
            panic!("expected UserList");
        };
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].position(), Some(crate::types::Position::new(3, 4)));
        assert_eq!(users[1].position(), None);
    }

    #[test]
    fn decode_chat_scopes() {
        let env =
            decode(r#"{"type":"chat_message","scope":"zone","zone_id":"Room1","message":"hi"}"#)
                .unwrap();
        let Frame::ChatMessage(msg) = env.frame else {
            panic!("expected ChatMessage");
        };
        assert_eq!(msg.scope, ChatScope::Zone);
        assert_eq!(msg.zone_id.as_deref(), Some("Room1"));
    }

    #[test]
    fn decode_zone_enter_kind() {
        let env = decode(r#"{"type":"zone_enter","zone_id":"Room2","zone_type":"PRIVATE"}"#)
            .unwrap();
        assert_eq!(
            env.frame,
            Frame::ZoneEnter {
                zone_id: "Room2".into(),
                zone_type: ZoneKind::Private
            }
        );
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(decode("not json"), Err(ProtocolError::InvalidJson(_))));
        assert!(matches!(decode(r#"{"x":1}"#), Err(ProtocolError::MissingType)));
        assert!(matches!(
            decode(r#"{"type":"teleport_everyone"}"#),
            Err(ProtocolError::UnknownType(t)) if t == "teleport_everyone"
        ));
        assert!(matches!(
            decode(r#"{"type":"move","x":"left"}"#),
            Err(ProtocolError::Malformed { tag, .. }) if tag == "move"
        ));
    }

    #[test]
    fn every_frame_tag_is_known() {
        let frames = [
            Frame::RequestUsers,
            Frame::ZoneExit {
                zone_id: "z".into(),
            },
            Frame::DmDeleted {
                message_id: "m".into(),
            },
            Frame::ProximityChat(ChatMessage::new(ChatScope::Proximity, "x")),
        ];
        for f in frames {
            assert!(tags::is_known(f.tag()), "{} not registered", f.tag());
        }
    }
}
