//! The script artifact and its text-header envelope.
//!
//! A script is stored as plain text with a directive prelude:
//!
//! ```text
//! --* subject: funcs.echo
//! --* name: e1
//! --* require: strings
//! --* html: false
//! --* executor: interpreter
//! ```
//!
//! Lines not matching the directive grammar form the script body. For the
//! interpreter executor the body is program source; for the WASI executor it
//! is the filesystem path of a compiled module; for the container executor
//! it is a JSON container spec.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Directive line prefix.
pub const HEADER_PATTERN: &str = "--*";

/// Errors produced while parsing a script envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptParseError {
    /// The `executor` directive named a tag that is not a known runtime.
    #[error("unknown executor tag '{0}'")]
    UnknownExecutor(String),
}

/// The isolation backend a script runs in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Embedded interpreter runtime (the default).
    #[default]
    Interpreter,
    /// Sandboxed WASI bytecode runtime.
    Wasm,
    /// One-shot container runtime.
    Container,
}

impl ExecutorKind {
    /// The wire tag for this executor.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::Interpreter => "interpreter",
            ExecutorKind::Wasm => "wasm",
            ExecutorKind::Container => "container",
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutorKind {
    type Err = ScriptParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interpreter" => Ok(ExecutorKind::Interpreter),
            "wasm" => Ok(ExecutorKind::Wasm),
            "container" => Ok(ExecutorKind::Container),
            other => Err(ScriptParseError::UnknownExecutor(other.to_string())),
        }
    }
}

/// A user-supplied script bound to a bus subject.
///
/// Identity is the `(subject, name)` pair; the store holds at most one
/// script per pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    /// Script body with the directive prelude stripped.
    pub content: Vec<u8>,

    /// The runtime this script executes in.
    pub executor: ExecutorKind,

    /// Selects the HTML-return calling convention.
    #[serde(rename = "is_html")]
    pub html: bool,

    /// Ordered library keys concatenated before the body by the interpreter.
    #[serde(rename = "libraries")]
    pub lib_keys: Vec<String>,

    /// Unique name within the subject.
    pub name: String,

    /// Bus subject pattern the script is bound to.
    pub subject: String,
}

/// Splits a directive line into its key, e.g. `subject` out of
/// `--* subject: funcs.echo`. Returns `None` for body lines.
fn header_key(line: &str) -> Option<&str> {
    if !line.starts_with(HEADER_PATTERN) {
        return None;
    }
    line.split_whitespace().nth(1).map(|k| k.trim_end_matches(':'))
}

/// Extracts the value part of a directive line: everything after the key
/// token, joined back together.
fn header_value(line: &str) -> String {
    let mut parts = line.split_whitespace();
    // Skip the pattern and the key.
    parts.next();
    parts.next();
    parts.collect::<Vec<_>>().join(" ")
}

impl Script {
    /// Parses a script envelope from text.
    ///
    /// Unrecognized directive keys and malformed `html` values are
    /// tolerated: the former stay in the body, the latter default to
    /// `false`. An unknown `executor` tag is an error so it surfaces as the
    /// script's result instead of silently running in the wrong runtime.
    pub fn parse(text: &str) -> Result<Self, ScriptParseError> {
        let mut script = Script::default();
        let mut body = String::new();

        for line in text.lines() {
            let key = header_key(line);
            let value = key.map(|_| header_value(line)).unwrap_or_default();
            match key {
                Some("subject") => {
                    if !value.is_empty() {
                        script.subject = value;
                    }
                }
                Some("name") => {
                    if !value.is_empty() {
                        script.name = value;
                    }
                }
                Some("require") => {
                    if !value.is_empty() {
                        script.lib_keys.push(value);
                    }
                }
                Some("html") => script.html = value.parse().unwrap_or(false),
                Some("executor") => {
                    if !value.is_empty() {
                        script.executor = value.parse()?;
                    }
                }
                _ => {
                    body.push_str(line);
                    body.push('\n');
                }
            }
        }

        script.content = body.trim_end_matches('\n').as_bytes().to_vec();
        Ok(script)
    }

    /// Parses a script envelope from raw bytes (lossy UTF-8).
    pub fn parse_bytes(content: &[u8]) -> Result<Self, ScriptParseError> {
        Script::parse(&String::from_utf8_lossy(content))
    }

    /// Emits the canonical text form: the full directive prelude followed by
    /// the body. Re-parsing the output yields an equal `Script`.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        if !self.subject.is_empty() {
            out.push_str(&format!("{HEADER_PATTERN} subject: {}\n", self.subject));
        }
        if !self.name.is_empty() {
            out.push_str(&format!("{HEADER_PATTERN} name: {}\n", self.name));
        }
        for key in &self.lib_keys {
            out.push_str(&format!("{HEADER_PATTERN} require: {key}\n"));
        }
        out.push_str(&format!("{HEADER_PATTERN} html: {}\n", self.html));
        out.push_str(&format!("{HEADER_PATTERN} executor: {}\n", self.executor));
        out.push_str(&String::from_utf8_lossy(&self.content));
        out
    }
}
