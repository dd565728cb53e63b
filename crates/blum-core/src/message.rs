//! Messages and their JSON wire representation.
//!
//! A [`Message`] is the unit that flows through a session in either
//! direction. Inbound messages are decoded from [`InboundFrame`]s; outbound
//! ones are stamped with the session's next sequence number when enqueued
//! and encoded as [`OutboundFrame`]s.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::ids::SessionId;

/// Topic carrying framework error notifications.
pub const ERROR_TOPIC: &str = "error";

/// Topic of the first message every session receives.
pub const SESSION_OPENED_TOPIC: &str = "session.opened";

/// Immutable message bound to one session.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    session_id: SessionId,
    topic: String,
    payload: Value,
    seq: u64,
}

impl Message {
    /// Build a message.
    pub fn new(session_id: SessionId, topic: impl Into<String>, payload: Value, seq: u64) -> Self {
        Self {
            session_id,
            topic: topic.into(),
            payload,
            seq,
        }
    }

    /// Owning session.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Topic tag used for routing.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Application payload. The framework never inspects it.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Per-session sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Encode as an outbound wire frame.
    pub fn to_frame_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&OutboundFrame {
            topic: &self.topic,
            payload: &self.payload,
            seq: self.seq,
        })
    }
}

/// A reply or notification produced before a sequence number is assigned.
#[derive(Clone, Debug, PartialEq)]
pub struct Outgoing {
    /// Destination topic.
    pub topic: String,
    /// Payload.
    pub payload: Value,
}

impl Outgoing {
    /// Build an outgoing message.
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }

    /// Error notification on [`ERROR_TOPIC`].
    pub fn error(code: ErrorCode, message: impl Into<String>, in_reply_to: Option<&str>) -> Self {
        Self::error_with(code, message, in_reply_to, Value::Null)
    }

    /// Error notification with extra structured details.
    pub fn error_with(
        code: ErrorCode,
        message: impl Into<String>,
        in_reply_to: Option<&str>,
        details: Value,
    ) -> Self {
        let mut payload = json!({
            "code": code,
            "message": message.into(),
        });
        if let Some(topic) = in_reply_to {
            payload["inReplyTo"] = json!(topic);
        }
        if !details.is_null() {
            payload["details"] = details;
        }
        Self::new(ERROR_TOPIC, payload)
    }
}

/// Machine-readable error codes carried on [`ERROR_TOPIC`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The inbound frame could not be decoded.
    ProtocolError,
    /// No plugin claims the topic.
    UnknownTopic,
    /// The handling plugin returned a failure.
    PluginError,
    /// An optimistic write lost against a concurrent writer.
    VersionConflict,
    /// The handling plugin did not finish in time.
    DispatchTimeout,
}

impl ErrorCode {
    /// Wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::UnknownTopic => "UNKNOWN_TOPIC",
            Self::PluginError => "PLUGIN_ERROR",
            Self::VersionConflict => "VERSION_CONFLICT",
            Self::DispatchTimeout => "DISPATCH_TIMEOUT",
        }
    }
}

/// Why an inbound frame was rejected.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Not valid JSON or missing required fields.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Binary frame that is not UTF-8.
    #[error("binary frame is not valid UTF-8")]
    NotUtf8,
    /// Topic was the empty string.
    #[error("frame topic must not be empty")]
    EmptyTopic,
}

/// Client-to-server frame: `{"topic", "payload", "seq"}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundFrame {
    /// Routing topic.
    pub topic: String,
    /// Application payload; `null` when omitted.
    #[serde(default)]
    pub payload: Value,
    /// Client-assigned sequence number.
    pub seq: u64,
}

impl InboundFrame {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let frame: Self = serde_json::from_str(text)?;
        if frame.topic.is_empty() {
            return Err(FrameError::EmptyTopic);
        }
        Ok(frame)
    }

    /// Decode a binary frame carrying UTF-8 JSON.
    pub fn decode_bytes(data: &[u8]) -> Result<Self, FrameError> {
        let text = std::str::from_utf8(data).map_err(|_| FrameError::NotUtf8)?;
        Self::decode(text)
    }

    /// Bind the frame to a session.
    pub fn into_message(self, session_id: SessionId) -> Message {
        Message::new(session_id, self.topic, self.payload, self.seq)
    }
}

/// Server-to-client frame.
#[derive(Debug, Serialize)]
pub struct OutboundFrame<'a> {
    /// Topic.
    pub topic: &'a str,
    /// Payload.
    pub payload: &'a Value,
    /// Outbound sequence number for the session.
    pub seq: u64,
}
