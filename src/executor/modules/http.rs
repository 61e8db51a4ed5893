//! Outbound HTTP client for scripts.

use std::time::Instant;

use rhai::Module;

use super::{runtime_error, HostDeps};

/// Builds the `http` module: `http::get(url)` and `http::post(url, body)`
/// return the response body as a string. Requests are capped by the
/// invocation deadline.
pub fn module(deps: &HostDeps, deadline: Instant) -> Module {
    let mut module = Module::new();

    let get_deps = deps.clone();
    module.set_native_fn("get", move |url: &str| {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let request = get_deps.http.get(url).timeout(remaining);
        get_deps
            .handle
            .block_on(async move { request.send().await?.error_for_status()?.text().await })
            .map_err(|e| runtime_error(format!("http get {url} failed: {e}")))
    });

    let post_deps = deps.clone();
    module.set_native_fn("post", move |url: &str, body: &str| {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let request = post_deps.http.post(url).body(body.to_string()).timeout(remaining);
        post_deps
            .handle
            .block_on(async move { request.send().await?.error_for_status()?.text().await })
            .map_err(|e| runtime_error(format!("http post {url} failed: {e}")))
    });

    module
}
