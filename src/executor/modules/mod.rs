//! Host modules preloaded into every interpreter engine instance.
//!
//! Scripts reach the outside world only through these namespaces: `http`
//! (outbound requests), `re` (regular expressions), `fs` (the invocation's
//! private working directory), `json` (encode/decode), `kv` (the etcd
//! backend, when configured), and `bus` (publishing back onto the bus).
//!
//! The module functions block on the runtime handle. That is only legal off
//! the async executor threads, so the interpreter always evaluates scripts
//! inside `spawn_blocking`.

mod bus;
mod fs;
mod http;
mod json;
mod kv;
mod re;

use std::path::Path;
use std::time::Instant;

use rhai::{Dynamic, Engine, EvalAltResult, Position};

/// Shared clients handed to the host modules.
#[derive(Clone)]
pub struct HostDeps {
    /// Outbound HTTP client.
    pub http: reqwest::Client,
    /// Bus connection for `bus::publish`; `None` in offline setups.
    pub bus: Option<async_nats::Client>,
    /// etcd client for the `kv` module; `None` unless the etcd backend is
    /// in use.
    pub kv: Option<etcd_client::Client>,
    /// Runtime handle the module functions block on.
    pub handle: tokio::runtime::Handle,
}

impl HostDeps {
    /// Captures the current runtime handle alongside the given clients.
    pub fn new(bus: Option<async_nats::Client>, kv: Option<etcd_client::Client>) -> Self {
        HostDeps {
            http: reqwest::Client::new(),
            bus,
            kv,
            handle: tokio::runtime::Handle::current(),
        }
    }
}

/// Converts a failure into a rhai runtime error.
pub(crate) fn runtime_error(message: impl Into<String>) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(Dynamic::from(message.into()), Position::NONE))
}

/// Registers every host module into `engine`. `workdir` scopes the `fs`
/// module; `deadline` bounds the `http` module's requests.
pub fn register_all(engine: &mut Engine, deps: &HostDeps, workdir: &Path, deadline: Instant) {
    engine.register_static_module("http", http::module(deps, deadline).into());
    engine.register_static_module("re", re::module().into());
    engine.register_static_module("fs", fs::module(workdir).into());
    engine.register_static_module("json", json::module().into());
    engine.register_static_module("kv", kv::module(deps).into());
    engine.register_static_module("bus", bus::module(deps).into());
}
