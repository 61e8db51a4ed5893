//! Operator-supplied interpreter preloaders.
//!
//! A preloader registers extra modules or functions into the interpreter
//! state. Preloaders are collected once at startup and invoked for every
//! engine instance, receiving a snapshot of the process environment the way
//! operator plugins expect.

use std::collections::HashMap;
use std::sync::Arc;

use rhai::Engine;
use tracing::debug;

/// Registers custom modules into an interpreter engine instance.
pub trait Preloader: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Registers this plugin's modules into `engine`. Called once per
    /// engine instance, before the script runs.
    fn preload(&self, engine: &mut Engine, env: &HashMap<String, String>);
}

/// Invokes every preloader against `engine`.
pub fn load_plugins(engine: &mut Engine, preloaders: &[Arc<dyn Preloader>]) {
    if preloaders.is_empty() {
        return;
    }

    let env: HashMap<String, String> = std::env::vars().collect();
    for preloader in preloaders {
        debug!(plugin = preloader.name(), "loading plugin");
        preloader.preload(engine, &env);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Greeter;

    impl Preloader for Greeter {
        fn name(&self) -> &str {
            "greeter"
        }

        fn preload(&self, engine: &mut Engine, _env: &HashMap<String, String>) {
            engine.register_fn("greet", |name: &str| format!("hello {name}"));
        }
    }

    #[test]
    fn preloaded_functions_are_callable_from_scripts() {
        let mut engine = Engine::new();
        load_plugins(&mut engine, &[Arc::new(Greeter) as Arc<dyn Preloader>]);

        let out: String = engine.eval(r#"greet("operator")"#).unwrap();
        assert_eq!(out, "hello operator");
    }
}
