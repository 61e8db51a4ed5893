//! Key-value store access for scripts, backed by the etcd client.

use rhai::Module;

use super::{runtime_error, HostDeps};

fn client(deps: &HostDeps) -> Result<etcd_client::Client, Box<rhai::EvalAltResult>> {
    deps.kv.clone().ok_or_else(|| runtime_error("kv backend is not configured"))
}

/// Builds the `kv` module: `get(key)` (empty string when absent),
/// `put(key, value)` and `delete(key)`.
pub fn module(deps: &HostDeps) -> Module {
    let mut module = Module::new();

    let get_deps = deps.clone();
    module.set_native_fn("get", move |key: &str| {
        let mut client = client(&get_deps)?;
        let resp = get_deps
            .handle
            .block_on(async { client.get(key, None).await })
            .map_err(|e| runtime_error(format!("kv get '{key}' failed: {e}")))?;

        Ok(resp
            .kvs()
            .first()
            .map(|kv| String::from_utf8_lossy(kv.value()).to_string())
            .unwrap_or_default())
    });

    let put_deps = deps.clone();
    module.set_native_fn("put", move |key: &str, value: &str| {
        let mut client = client(&put_deps)?;
        put_deps
            .handle
            .block_on(async { client.put(key, value, None).await })
            .map_err(|e| runtime_error(format!("kv put '{key}' failed: {e}")))?;
        Ok(())
    });

    let delete_deps = deps.clone();
    module.set_native_fn("delete", move |key: &str| {
        let mut client = client(&delete_deps)?;
        delete_deps
            .handle
            .block_on(async { client.delete(key, None).await })
            .map_err(|e| runtime_error(format!("kv delete '{key}' failed: {e}")))?;
        Ok(())
    });

    module
}
