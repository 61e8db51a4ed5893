//! The structured message envelope carried over the bus.

use serde::{Deserialize, Serialize};

use super::base64_bytes;

/// A decoded bus message.
///
/// Clients publish this envelope as JSON. When the wire bytes are not a
/// decodable envelope (or decode to an empty payload), the dispatch loop
/// wraps the raw bytes into a synthetic envelope instead of rejecting the
/// message — real clients publish arbitrary bytes that happen to parse as
/// empty JSON objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The bus subject the message targets.
    #[serde(default)]
    pub subject: String,

    /// Opaque payload bytes, base64-encoded on the wire.
    #[serde(default, with = "base64_bytes")]
    pub payload: Vec<u8>,

    /// HTTP verb when the message originated from the gateway, empty
    /// otherwise.
    #[serde(default)]
    pub method: String,

    /// Path suffix after the subject component of the gateway URL.
    #[serde(default)]
    pub url: String,

    /// Executor tag overriding the per-script default. Empty means no
    /// override.
    #[serde(default)]
    pub executor: String,

    /// When set, the dispatcher acknowledges immediately with `{}` and the
    /// actual script results are logged only.
    #[serde(default, rename = "async")]
    pub is_async: bool,

    /// Set by the receiver when the wire payload was not a structured
    /// envelope.
    #[serde(default)]
    pub raw: bool,
}

impl Message {
    /// Wraps raw wire bytes into a synthetic envelope.
    pub fn raw(subject: &str, data: &[u8]) -> Self {
        Message {
            subject: subject.to_string(),
            payload: data.to_vec(),
            raw: true,
            ..Message::default()
        }
    }

    /// Decodes wire bytes received on `bus_subject` into an envelope.
    ///
    /// Falls back to a raw envelope when the bytes are not valid JSON, and
    /// also when they decode structurally but yield an empty payload (e.g.
    /// an unrelated JSON object where no key matches).
    pub fn from_wire(bus_subject: &str, data: &[u8]) -> Self {
        match serde_json::from_slice::<Message>(data) {
            Ok(msg) if !msg.payload.is_empty() => msg,
            _ => Message::raw(bus_subject, data),
        }
    }
}
