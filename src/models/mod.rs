//! Core data model: the bus message envelope, per-script results, the
//! aggregate reply, and the script artifact with its text-header parser.

pub mod message;
pub mod reply;
pub mod script;

pub use message::Message;
pub use reply::{Reply, ScriptResult, NO_SCRIPT_FOUND};
pub use script::{ExecutorKind, Script, ScriptParseError};

/// Serde helper encoding byte payloads as base64 strings, the way the wire
/// format expects them. Tolerates `null` and absent fields on decode.
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(Vec::new()),
            Some(s) => STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom),
        }
    }
}
