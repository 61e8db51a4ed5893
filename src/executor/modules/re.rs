//! Regular expressions for scripts.

use regex::Regex;
use rhai::Module;

use super::runtime_error;

fn compile(pattern: &str) -> Result<Regex, Box<rhai::EvalAltResult>> {
    Regex::new(pattern).map_err(|e| runtime_error(format!("invalid pattern '{pattern}': {e}")))
}

/// Builds the `re` module: `is_match`, `find` (first match or empty string)
/// and `replace` (all occurrences).
pub fn module() -> Module {
    let mut module = Module::new();

    module.set_native_fn("is_match", |pattern: &str, text: &str| {
        Ok(compile(pattern)?.is_match(text))
    });

    module.set_native_fn("find", |pattern: &str, text: &str| {
        Ok(compile(pattern)?
            .find(text)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default())
    });

    module.set_native_fn("replace", |pattern: &str, text: &str, replacement: &str| {
        Ok(compile(pattern)?.replace_all(text, replacement).to_string())
    });

    module
}
