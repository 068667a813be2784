//! Inbound decoder: raw text frame → [`Request`].
//!
//! The envelope is validated field by field before the typed parse so that
//! callers get a precise [`DecodeError`] to log. Whatever the error, the
//! connection stays open; the caller answers with a broadcast bad-request
//! notification.

use serde_json::Value;
use thiserror::Error;

use crate::messages::{Request, RequestKind};

/// Why an inbound text frame was rejected.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not JSON, or JSON that is not an object.
    #[error("malformed request envelope: {0}")]
    Malformed(String),
    /// The `id` field is absent.
    #[error("request is missing the `id` field")]
    MissingId,
    /// The `id` field is not a positive integer.
    #[error("request id must be a positive integer, got {0}")]
    InvalidId(Value),
    /// The `kind` field is absent or not a string.
    #[error("request is missing the `kind` field")]
    MissingKind,
    /// The `kind` is not one of [`RequestKind::KINDS`].
    #[error("unknown request kind `{0}`")]
    UnknownKind(String),
    /// Known kind, but its fields do not match.
    #[error("invalid `{kind}` payload: {source}")]
    InvalidPayload {
        /// Kind that failed to parse.
        kind: String,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
}

/// Decode one text frame into a [`Request`].
pub fn decode_request(raw: &str) -> Result<Request, DecodeError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let Value::Object(ref envelope) = value else {
        return Err(DecodeError::Malformed("expected a JSON object".into()));
    };

    match envelope.get("id") {
        None | Some(Value::Null) => return Err(DecodeError::MissingId),
        Some(id) if id.as_i64().is_some_and(|n| n > 0) => {}
        Some(id) => return Err(DecodeError::InvalidId(id.clone())),
    }

    let kind = envelope
        .get("kind")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingKind)?
        .to_owned();
    if !RequestKind::KINDS.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownKind(kind));
    }

    serde_json::from_value(value).map_err(|source| DecodeError::InvalidPayload { kind, source })
}
