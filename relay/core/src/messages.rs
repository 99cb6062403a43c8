//! Wire Messages
//!
//! Message shapes exchanged with the backend and the identifier types shared by
//! the connection and streaming layers.
//!
//! # Inbound
//!
//! Inbound traffic is JSON of the form
//! `{id?, frontendGeneratedId?, type?, text?, done?, state?, ...}`. Unknown
//! fields are kept in [`InboundMessage::extra`] so subscribers see everything
//! the backend sent. Payloads that are not a JSON object survive as
//! [`Inbound::Raw`] rather than being dropped.
//!
//! # Outbound
//!
//! [`OutboundMessage`] covers the control messages this client originates
//! (`ping`, `pong`, `stop`), user messages tagged with a local id, and
//! arbitrary JSON payloads.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Reserved `type` values intercepted by the connection manager
pub mod control {
    /// Peer liveness probe (alias of `ping`)
    pub const HEARTBEAT: &str = "heartbeat";
    /// Liveness probe, answered with a pong
    pub const PING: &str = "ping";
    /// Liveness reply
    pub const PONG: &str = "pong";
    /// Assistant status update
    pub const STATUS: &str = "status";
    /// Request cancellation
    pub const STOP: &str = "stop";
    /// Incremental response text
    pub const CHUNK: &str = "chunk";
    /// User message sent by this client
    pub const USER_MESSAGE: &str = "user_message";
}

// ============================================================================
// Identifiers
// ============================================================================

/// Correlation key supplied by the sender of a streamed response
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    /// Wrap a sender-supplied correlation key
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw key
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of a rendered or persisted message
///
/// Locally generated ids carry a `local_` prefix; canonical ids assigned by the
/// persistence store are wrapped verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// Generate a new client-side message ID
    #[must_use]
    pub fn new() -> Self {
        Self(format!("local_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Borrow the raw id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id was generated on this side of the connection
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.0.starts_with("local_")
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Who authored a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// The human
    User,
    /// The assistant backend
    Assistant,
    /// System notices
    System,
}

/// What the assistant on the far end is doing right now
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssistantStatus {
    /// Connected and ready
    #[default]
    Idle,
    /// Capturing user input
    Listening,
    /// Working on a response
    Thinking,
    /// Delivering a response
    Speaking,
    /// Disconnected, waiting for the link to come back
    Waiting,
    /// Backend reported a failure
    Error,
}

impl AssistantStatus {
    /// Parse a backend `state` string (case-insensitive)
    #[must_use]
    pub fn parse(state: &str) -> Option<Self> {
        match state.to_ascii_lowercase().as_str() {
            "idle" => Some(Self::Idle),
            "listening" => Some(Self::Listening),
            "thinking" => Some(Self::Thinking),
            "speaking" => Some(Self::Speaking),
            "waiting" => Some(Self::Waiting),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Short human-readable label
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Idle => "Ready",
            Self::Listening => "Listening...",
            Self::Thinking => "Thinking...",
            Self::Speaking => "Responding...",
            Self::Waiting => "Reconnecting...",
            Self::Error => "Error",
        }
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// A JSON message received from the backend
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    /// Primary message/request id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Transient echo of an id this client generated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend_generated_id: Option<String>,

    /// Backend id displaced by a frontend id promotion (debug only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,

    /// Message type; routes the message to topic subscribers
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Text payload (chunks, notices)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Final chunk marker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,

    /// Status value for `status` messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// Every other field, kept verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InboundMessage {
    /// The message type, if any
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    /// Whether this is the final chunk of a stream
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.unwrap_or(false)
    }

    /// Sender timestamp, echoed back in pongs
    #[must_use]
    pub fn timestamp(&self) -> Option<&Value> {
        self.extra.get("timestamp")
    }

    /// Sequence hint (`seq` or `sequence`), used to tell identical chunks apart
    #[must_use]
    pub fn sequence(&self) -> Option<u64> {
        self.extra
            .get("seq")
            .or_else(|| self.extra.get("sequence"))
            .and_then(Value::as_u64)
    }

    /// Whether this message is handled by the connection layer itself
    #[must_use]
    pub fn is_control(&self) -> bool {
        matches!(
            self.kind(),
            Some(control::HEARTBEAT | control::PING | control::PONG | control::STATUS)
        )
    }
}

/// Payload that could not be parsed as an inbound JSON object
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RawPayload {
    /// Text frame
    Text(String),
    /// Binary frame
    Binary(Vec<u8>),
}

impl RawPayload {
    /// Payload size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    /// Whether the payload is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An inbound payload after decoding
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// A well-formed JSON message
    Parsed(InboundMessage),
    /// Anything else, passed through untouched
    Raw(RawPayload),
}

impl Inbound {
    /// The parsed message, if this payload was well-formed
    #[must_use]
    pub fn as_parsed(&self) -> Option<&InboundMessage> {
        match self {
            Self::Parsed(message) => Some(message),
            Self::Raw(_) => None,
        }
    }

    /// The message type, if parsed and typed
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        self.as_parsed().and_then(InboundMessage::kind)
    }
}

// ============================================================================
// Outbound
// ============================================================================

/// Messages sent from this client to the backend
#[derive(Clone, Debug, PartialEq)]
pub enum OutboundMessage {
    /// Liveness probe
    Ping {
        /// Milliseconds since the Unix epoch
        timestamp: i64,
    },
    /// Liveness reply
    Pong {
        /// Milliseconds since the Unix epoch
        timestamp: i64,
        /// The timestamp carried by the probe being answered
        echo: Option<Value>,
    },
    /// Ask the backend to stop producing a response
    Stop {
        /// Request to stop
        id: RequestId,
    },
    /// User input, tagged with a client-generated id
    UserMessage {
        /// Id the backend echoes back as `frontendGeneratedId`
        frontend_generated_id: MessageId,
        /// The message content
        text: String,
    },
    /// Arbitrary application payload
    Custom(Value),
}

impl OutboundMessage {
    /// Build a ping stamped with the current time
    #[must_use]
    pub fn ping_now() -> Self {
        Self::Ping {
            timestamp: now_millis(),
        }
    }

    /// Build a pong answering a probe that carried `echo`
    #[must_use]
    pub fn pong_for(echo: Option<Value>) -> Self {
        Self::Pong {
            timestamp: now_millis(),
            echo,
        }
    }

    /// The `type` tag this message is sent with
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Ping { .. } => control::PING,
            Self::Pong { .. } => control::PONG,
            Self::Stop { .. } => control::STOP,
            Self::UserMessage { .. } => control::USER_MESSAGE,
            Self::Custom(value) => value.get("type").and_then(Value::as_str).unwrap_or("custom"),
        }
    }

    /// Render as a JSON value
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Ping { timestamp } => json!({ "type": control::PING, "timestamp": timestamp }),
            Self::Pong { timestamp, echo } => json!({
                "type": control::PONG,
                "timestamp": timestamp,
                "echo": echo.clone().unwrap_or(Value::Null),
            }),
            Self::Stop { id } => json!({ "type": control::STOP, "id": id }),
            Self::UserMessage {
                frontend_generated_id,
                text,
            } => json!({
                "type": control::USER_MESSAGE,
                "frontendGeneratedId": frontend_generated_id,
                "text": text,
            }),
            Self::Custom(value) => value.clone(),
        }
    }
}

impl From<Value> for OutboundMessage {
    fn from(value: Value) -> Self {
        Self::Custom(value)
    }
}

/// Milliseconds since the Unix epoch
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
