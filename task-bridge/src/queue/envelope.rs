//! Wire envelope and its JSON codec.
//!
//! Every message on the queue is a UTF-8 JSON object with a required, non-empty
//! string field `type`. All other fields are payload, interpreted by the handler
//! registered for that type:
//!
//! ```text
//! {"type": "test_message", "message": "hello"}
//! ```

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Default queue name when none is configured.
pub const DEFAULT_QUEUE: &str = "your-queue-name";

/// Errors from encoding or decoding an [`Envelope`].
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("body is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("body is not a JSON object")]
    NotAnObject,

    #[error("missing `type` field")]
    MissingType,

    #[error("`type` field must be a string")]
    TypeNotString,

    #[error("`type` field is empty")]
    EmptyType,

    #[error("failed to serialize envelope: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// A tagged task message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    /// Message type tag, used to pick a handler.
    #[serde(rename = "type")]
    kind: String,

    /// Type-specific fields.
    #[serde(flatten)]
    payload: Map<String, Value>,
}

impl Envelope {
    /// Create an envelope with an empty payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Map::new(),
        }
    }

    /// Add a payload field. A `type` key is ignored; the tag is fixed at
    /// construction.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != "type" {
            self.payload.insert(key, value.into());
        }
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// String payload field, if present and a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Serialize an envelope to its wire body.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(envelope).map_err(CodecError::Serialize)
}

/// Parse a wire body into an envelope.
///
/// Fails on malformed JSON, non-object bodies, and a missing, non-string or
/// empty `type`.
pub fn decode(body: &[u8]) -> Result<Envelope, CodecError> {
    let value: Value = serde_json::from_slice(body).map_err(CodecError::InvalidJson)?;
    let Value::Object(mut payload) = value else {
        return Err(CodecError::NotAnObject);
    };

    let kind = match payload.remove("type") {
        None => return Err(CodecError::MissingType),
        Some(Value::String(kind)) => kind,
        Some(_) => return Err(CodecError::TypeNotString),
    };
    if kind.is_empty() {
        return Err(CodecError::EmptyType);
    }

    Ok(Envelope { kind, payload })
}
