// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Envelope Codec
//!
//! The wire unit exchanged with clients and the backend is a JSON object with
//! at least a `text` field when client-authored. Backend envelopes may carry
//! any other fields; the relay passes them through untouched.

use std::fmt;

use serde_json::{Map, Value};

use crate::error::{BackendError, DecodeError};

/// Field carrying the primary payload.
pub const TEXT_FIELD: &str = "text";

/// Sent to the client when a message arrives while the backend is not open.
pub const BACKEND_DISCONNECTED: &str = "Failed to send message. Backend is disconnected.";

/// Prefix of the envelope reporting a backend transport error.
pub const BACKEND_ERROR_PREFIX: &str = "Error connecting to backend: ";

/// Prefix of the envelope reporting an undecodable client message.
pub const CLIENT_ERROR_PREFIX: &str = "Error processing your message: ";

/// A semi-structured message: a JSON object with a typed `text` accessor.
///
/// Decoded envelopes keep the exact text they were parsed from and encode
/// back to it, so relayed messages reach the far side byte for byte.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    fields: Map<String, Value>,
    raw: String,
}

impl Envelope {
    /// Creates an envelope holding only `text`.
    pub fn with_text(text: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert(TEXT_FIELD.to_string(), Value::String(text.into()));
        Self::from_fields(fields)
    }

    /// Synthesized envelope for a forward refused while the backend is down.
    pub fn backend_disconnected() -> Self {
        Self::with_text(BACKEND_DISCONNECTED)
    }

    /// Synthesized envelope for a backend transport failure.
    pub fn backend_error(err: &BackendError) -> Self {
        Self::with_text(format!("{BACKEND_ERROR_PREFIX}{err}"))
    }

    /// Synthesized envelope for a client message that failed to decode.
    pub fn client_error(err: &DecodeError) -> Self {
        Self::with_text(format!("{CLIENT_ERROR_PREFIX}{err}"))
    }

    fn from_fields(fields: Map<String, Value>) -> Self {
        // A map of strings always serializes.
        let raw = Value::Object(fields.clone()).to_string();
        Envelope { fields, raw }
    }

    /// Returns the `text` field if it is a string.
    pub fn text(&self) -> Option<&str> {
        self.fields.get(TEXT_FIELD).and_then(Value::as_str)
    }

    /// Returns an arbitrary field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// All fields.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// The JSON wire form: the decoded text as received, or the serialized
    /// fields for synthesized envelopes.
    pub fn encode(&self) -> String {
        self.raw.clone()
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Validates a client-authored message.
///
/// The message must be a JSON object with a non-empty string `text`.
/// Additional fields are kept and forwarded as received.
pub fn decode_client(raw: &str) -> Result<Envelope, DecodeError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let Value::Object(fields) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let envelope = Envelope {
        fields,
        raw: raw.to_string(),
    };
    match envelope.text() {
        Some(text) if !text.is_empty() => Ok(envelope),
        _ => Err(DecodeError::MissingText),
    }
}

/// Validates a raw client frame, enforcing the size limit before parsing.
pub fn decode_client_frame(data: &[u8], max_size: usize) -> Result<Envelope, DecodeError> {
    if data.len() > max_size {
        return Err(DecodeError::TooLarge {
            size: data.len(),
            limit: max_size,
        });
    }
    let raw = std::str::from_utf8(data).map_err(|_| DecodeError::InvalidUtf8)?;
    decode_client(raw)
}

/// Classifies a backend-authored message.
///
/// Backend messages are never dropped: a JSON object passes through as-is,
/// anything else is wrapped verbatim as `{"text": raw}`.
pub fn decode_backend(raw: &str) -> Envelope {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(fields)) => Envelope {
            fields,
            raw: raw.to_string(),
        },
        _ => Envelope::with_text(raw),
    }
}
