//! Frame definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ProtoError;

/// Discriminator field present on every frame.
pub const TYPE_FIELD: &str = "type";

/// Field carrying the server-issued session identifier.
pub const SESSION_ID_FIELD: &str = "session_id";

/// Frame type used when a caller hands over a bare text payload.
pub const MESSAGE_TYPE: &str = "message";

/// Which of the two session-establishing frame types was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFrameKind {
    /// `{"type":"connection", ...}`, sent by the server right after a socket opens.
    Connection,
    /// `{"type":"session", ...}`, sent when a session is (re)attached.
    Session,
}

impl SessionFrameKind {
    /// Wire name of this frame type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Session => "session",
        }
    }
}

/// A session-establishing frame.
///
/// The session id is optional here: a frame that announces a session but
/// carries no usable id still parses, so the caller can treat it as a failed
/// establishment rather than as noise.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionFrame {
    /// Frame type.
    pub kind: SessionFrameKind,
    /// Server-issued session identifier, if one was present and non-empty.
    pub session_id: Option<String>,
    /// The full frame object.
    pub body: Map<String, Value>,
}

impl SessionFrame {
    fn from_map(kind: SessionFrameKind, body: Map<String, Value>) -> Self {
        let session_id = body
            .get(SESSION_ID_FIELD)
            .or_else(|| body.get("sessionId"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(ToString::to_string);

        Self {
            kind,
            session_id,
            body,
        }
    }

    /// Session identifier carried by this frame.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

/// Any frame that is neither session nor heartbeat traffic.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationFrame {
    /// Value of the `type` field.
    pub frame_type: String,
    /// The full frame object, including `type`.
    pub body: Value,
}

impl ApplicationFrame {
    /// Value of the `type` field.
    #[must_use]
    pub fn frame_type(&self) -> &str {
        &self.frame_type
    }

    /// Look up a top-level field of the frame.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.body.get(name)
    }
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Session establishment (`connection` or `session`).
    Session(SessionFrame),
    /// Server-initiated liveness probe.
    Ping,
    /// Answer to one of our probes.
    Pong,
    /// Everything else.
    Application(ApplicationFrame),
}

impl InboundFrame {
    /// Parse and classify a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a JSON object with a non-empty
    /// string `type` field.
    pub fn parse(text: &str) -> Result<Self, ProtoError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtoError::Decoding(e.to_string()))?;
        Self::from_value(value)
    }

    /// Classify an already-decoded JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not an object with a usable `type`.
    pub fn from_value(value: Value) -> Result<Self, ProtoError> {
        let Value::Object(map) = value else {
            return Err(ProtoError::Decoding("frame is not a JSON object".to_string()));
        };

        let frame_type = match map.get(TYPE_FIELD) {
            Some(Value::String(t)) if !t.is_empty() => t.clone(),
            Some(_) => {
                return Err(ProtoError::InvalidField {
                    field: TYPE_FIELD,
                    reason: "must be a non-empty string".to_string(),
                });
            }
            None => return Err(ProtoError::MissingField(TYPE_FIELD)),
        };

        let frame = match frame_type.as_str() {
            "connection" => Self::Session(SessionFrame::from_map(SessionFrameKind::Connection, map)),
            "session" => Self::Session(SessionFrame::from_map(SessionFrameKind::Session, map)),
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            _ => Self::Application(ApplicationFrame {
                frame_type,
                body: Value::Object(map),
            }),
        };
        Ok(frame)
    }

    /// Value of the frame's `type` field.
    #[must_use]
    pub fn frame_type(&self) -> &str {
        match self {
            Self::Session(s) => s.kind.as_str(),
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Application(a) => &a.frame_type,
        }
    }
}

/// Frames the client itself originates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Liveness probe.
    Ping {
        /// Client time the probe was sent.
        timestamp: DateTime<Utc>,
    },
    /// Answer to a server probe.
    Pong {
        /// Client time of the answer.
        timestamp: DateTime<Utc>,
    },
    /// Session-scoped metadata (e.g. the selected assistant persona).
    SessionConfig {
        /// Session the metadata applies to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Arbitrary session parameters.
        params: Map<String, Value>,
    },
}

impl ControlFrame {
    /// Create a ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Self::Ping {
            timestamp: Utc::now(),
        }
    }

    /// Create a pong frame.
    #[must_use]
    pub fn pong() -> Self {
        Self::Pong {
            timestamp: Utc::now(),
        }
    }

    /// Create a session metadata frame.
    #[must_use]
    pub fn session_config(session_id: Option<String>, params: Map<String, Value>) -> Self {
        Self::SessionConfig { session_id, params }
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(|e| ProtoError::Encoding(e.to_string()))
    }

    /// Deserialize from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails.
    pub fn from_json(json: &str) -> Result<Self, ProtoError> {
        serde_json::from_str(json).map_err(|e| ProtoError::Decoding(e.to_string()))
    }
}

/// Turn a caller payload into a sendable application frame.
///
/// Bare strings become `{"type":"message","content":...}`. Objects must
/// already carry a string `type`.
///
/// # Errors
///
/// Returns an error for objects without a `type` and for non-object,
/// non-string payloads.
pub fn normalize_outbound(payload: Value) -> Result<Value, ProtoError> {
    match payload {
        Value::String(content) => {
            let mut map = Map::new();
            map.insert(TYPE_FIELD.to_string(), Value::String(MESSAGE_TYPE.to_string()));
            map.insert("content".to_string(), Value::String(content));
            Ok(Value::Object(map))
        }
        Value::Object(map) => match map.get(TYPE_FIELD) {
            Some(Value::String(t)) if !t.is_empty() => Ok(Value::Object(map)),
            Some(_) => Err(ProtoError::InvalidField {
                field: TYPE_FIELD,
                reason: "must be a non-empty string".to_string(),
            }),
            None => Err(ProtoError::MissingField(TYPE_FIELD)),
        },
        other => Err(ProtoError::InvalidField {
            field: TYPE_FIELD,
            reason: format!("payload must be a string or an object, got {other}"),
        }),
    }
}

/// Encode an application payload as frame text.
///
/// # Errors
///
/// Returns an error if the payload is not a valid outbound frame.
pub fn encode_application(payload: &Value) -> Result<String, ProtoError> {
    let frame = normalize_outbound(payload.clone())?;
    serde_json::to_string(&frame).map_err(|e| ProtoError::Encoding(e.to_string()))
}
