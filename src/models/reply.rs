//! Per-script results and the aggregate reply published on the bus.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::base64_bytes;

/// Sentinel error string the gateway matches to return 404.
pub const NO_SCRIPT_FOUND: &str = "No script found for subject";

/// The output of one script invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptResult {
    /// Numeric status. Exit code for sandboxed runtimes, HTTP status for
    /// HTML-mode interpreter scripts, 0 otherwise.
    #[serde(rename = "http_code", default)]
    pub code: i64,

    /// Failure description, empty on success.
    #[serde(default)]
    pub error: String,

    /// Response headers produced by HTML-mode scripts.
    #[serde(rename = "http_headers", default)]
    pub headers: HashMap<String, String>,

    /// True when the result follows the HTML calling convention.
    #[serde(rename = "is_html", default)]
    pub is_html: bool,

    /// Result payload bytes, base64-encoded on the wire.
    #[serde(default, with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl ScriptResult {
    /// A failed result carrying only an error description.
    pub fn from_error(error: impl Into<String>) -> Self {
        ScriptResult { error: error.into(), ..ScriptResult::default() }
    }
}

/// The aggregate reply for one dispatched message: one result per matched
/// script, keyed by script name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    /// Per-script results. May be empty when every matching script skipped
    /// (e.g. another replica held the lock); that is still a success.
    #[serde(default)]
    pub results: HashMap<String, ScriptResult>,

    /// True iff any result follows the HTML calling convention.
    #[serde(rename = "is_html", default)]
    pub is_html: bool,

    /// Set when dispatch failed before any script ran.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl Reply {
    /// An error reply produced before any script ran.
    pub fn from_error(error: impl Into<String>) -> Self {
        Reply { error: error.into(), ..Reply::default() }
    }

    /// Aggregates per-script results, raising the HTML flag if any result
    /// carries it.
    pub fn from_results(results: HashMap<String, ScriptResult>) -> Self {
        let is_html = results.values().any(|r| r.is_html);
        Reply { results, is_html, error: String::new() }
    }
}
