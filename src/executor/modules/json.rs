//! JSON encoding and decoding for scripts.

use rhai::serde::to_dynamic;
use rhai::{Dynamic, Module};

use super::runtime_error;

/// Builds the `json` module: `parse` into a script value, `stringify` back
/// to text.
pub fn module() -> Module {
    let mut module = Module::new();

    module.set_native_fn("parse", |text: &str| {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| runtime_error(format!("invalid json: {e}")))?;
        to_dynamic(value)
    });

    module.set_native_fn("stringify", |value: Dynamic| {
        serde_json::to_string(&value)
            .map_err(|e| runtime_error(format!("failed to encode json: {e}")))
    });

    module
}

#[cfg(test)]
mod tests {
    use rhai::Engine;

    #[test]
    fn parse_and_stringify_round_trip() {
        let mut engine = Engine::new();
        engine.register_static_module("json", super::module().into());

        let name: String =
            engine.eval(r#"let v = json::parse("{\"name\":\"e1\"}"); v.name"#).unwrap();
        assert_eq!(name, "e1");

        let text: String = engine.eval(r#"json::stringify(#{count: 2})"#).unwrap();
        assert_eq!(text, r#"{"count":2}"#);
    }

    #[test]
    fn invalid_json_is_a_runtime_error() {
        let mut engine = Engine::new();
        engine.register_static_module("json", super::module().into());
        assert!(engine.eval::<rhai::Dynamic>(r#"json::parse("{nope")"#).is_err());
    }
}
