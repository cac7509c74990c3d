use crate::protocol::Message;
use crate::registry::{self, MessageKind};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The frame is not valid JSON or not a JSON array.
    InvalidFrame(String),
    UnknownMessageType(String),
    Malformed { tag: Option<String>, reason: String },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFrame(reason) => write!(f, "invalid frame: {reason}"),
            Self::UnknownMessageType(tag) => write!(f, "unknown message type: {tag}"),
            Self::Malformed {
                tag: Some(tag),
                reason,
            } => write!(f, "malformed {tag} message: {reason}"),
            Self::Malformed { tag: None, reason } => write!(f, "malformed message: {reason}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Per-element outcome of a frame; element order is preserved.
pub type Decoded = Result<Message, DecodeError>;

pub fn encode(message: &Message) -> Result<String, serde_json::Error> {
    encode_batch(std::slice::from_ref(message))
}

/// Coalesces several messages into one array for a single wire write.
pub fn encode_batch(messages: &[Message]) -> Result<String, serde_json::Error> {
    serde_json::to_string(messages)
}

/// Splits a frame into its elements. Only a frame that is not a JSON array
/// fails as a whole; a bad element fails alone and its siblings still decode.
pub fn decode(frame: &str) -> Result<Vec<Decoded>, DecodeError> {
    let value: Value = serde_json::from_str(frame)
        .map_err(|err| DecodeError::InvalidFrame(format!("json parse failed: {err}")))?;
    let Value::Array(elements) = value else {
        return Err(DecodeError::InvalidFrame(
            "expected a JSON array of messages".to_string(),
        ));
    };
    Ok(elements.into_iter().map(decode_element).collect())
}

fn decode_element(element: Value) -> Decoded {
    let Value::Object(object) = element else {
        return Err(DecodeError::Malformed {
            tag: None,
            reason: "expected a single-key object".to_string(),
        });
    };
    if object.len() != 1 {
        return Err(DecodeError::Malformed {
            tag: None,
            reason: format!("expected exactly one message tag, found {}", object.len()),
        });
    }
    let Some((tag, payload)) = object.into_iter().next() else {
        return Err(DecodeError::Malformed {
            tag: None,
            reason: "empty message object".to_string(),
        });
    };
    let kind =
        MessageKind::from_tag(&tag).ok_or_else(|| DecodeError::UnknownMessageType(tag.clone()))?;
    registry::decode_payload(kind, payload).map_err(|err| DecodeError::Malformed {
        tag: Some(tag),
        reason: err.to_string(),
    })
}
