//! Interpreter security limits.

use serde::Deserialize;

/// Limits applied to every interpreter engine instance.
#[derive(Debug, Deserialize, Clone)]
pub struct InterpreterConfig {
    /// Maximum number of operations a script can perform. 0 disables the
    /// limit (the invocation deadline still applies).
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,

    /// Maximum function call nesting depth.
    #[serde(default = "default_max_call_levels")]
    pub max_call_levels: usize,

    /// Maximum size of strings in characters.
    #[serde(default = "default_max_string_size")]
    pub max_string_size: usize,

    /// Maximum number of array elements.
    #[serde(default = "default_max_array_size")]
    pub max_array_size: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            max_operations: default_max_operations(),
            max_call_levels: default_max_call_levels(),
            max_string_size: default_max_string_size(),
            max_array_size: default_max_array_size(),
        }
    }
}

fn default_max_operations() -> u64 {
    10_000_000
}

fn default_max_call_levels() -> usize {
    64
}

fn default_max_string_size() -> usize {
    1_048_576
}

fn default_max_array_size() -> usize {
    100_000
}
