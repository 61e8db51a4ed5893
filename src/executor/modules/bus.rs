//! Bus access for scripts.

use bytes::Bytes;
use rhai::Module;

use super::{runtime_error, HostDeps};

/// Builds the `bus` module: `publish(subject, message)`.
pub fn module(deps: &HostDeps) -> Module {
    let mut module = Module::new();

    let publish_deps = deps.clone();
    module.set_native_fn("publish", move |subject: &str, message: &str| {
        let Some(client) = publish_deps.bus.clone() else {
            return Err(runtime_error("not connected to the bus"));
        };

        let subject = subject.to_string();
        let payload = Bytes::copy_from_slice(message.as_bytes());
        publish_deps
            .handle
            .block_on(async move { client.publish(subject, payload).await })
            .map_err(|e| runtime_error(format!("failed to publish message: {e}")))?;
        Ok(())
    });

    module
}
