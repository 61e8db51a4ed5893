//! The sandboxed WASI bytecode executor.
//!
//! Script content is the filesystem path of a precompiled `wasm32-wasip1`
//! module. The module's `_start` runs with message fields exported as
//! environment variables; stdout becomes the reply payload (decoded as a
//! JSON result when possible) and stderr becomes the error. WASI itself is
//! the isolation boundary: no libraries, no lock, no working directory.
//!
//! Built only with the `wasm` cargo feature; otherwise a stub returns a
//! structured "not supported" error.

#[cfg(feature = "wasm")]
mod enabled {
    use tracing::debug;
    use wasmtime::{Config, Engine, Linker, Module, Store};
    use wasmtime_wasi::pipe::MemoryOutputPipe;
    use wasmtime_wasi::preview1::WasiP1Ctx;
    use wasmtime_wasi::WasiCtxBuilder;

    use crate::executor::{ExecContext, Executor, MAX_INTERPRETER_RUNNING_TIME};
    use crate::models::{Message, Script, ScriptResult};

    const STDOUT_CAPACITY: usize = 1024 * 1024;
    const STDERR_CAPACITY: usize = 256 * 1024;
    /// Rough instruction budget per second of allowed runtime.
    const FUEL_PER_SEC: u64 = 33_000_000;

    /// Runs precompiled WASI modules.
    #[derive(Default)]
    pub struct WasmExecutor;

    impl WasmExecutor {
        /// Creates the executor.
        pub fn new() -> Self {
            WasmExecutor
        }

        fn execute_sync(module_bytes: Vec<u8>, envs: Vec<(String, String)>, fuel: u64) -> ScriptResult {
            let mut config = Config::new();
            config.consume_fuel(true);

            let engine = match Engine::new(&config) {
                Ok(engine) => engine,
                Err(e) => {
                    return ScriptResult::from_error(format!("failed to create wasm engine: {e}"))
                }
            };

            let module = match Module::new(&engine, &module_bytes) {
                Ok(module) => module,
                Err(e) => {
                    return ScriptResult::from_error(format!("failed to create module: {e}"))
                }
            };

            let stdout = MemoryOutputPipe::new(STDOUT_CAPACITY);
            let stderr = MemoryOutputPipe::new(STDERR_CAPACITY);

            let wasi_ctx = WasiCtxBuilder::new()
                .stdout(stdout.clone())
                .stderr(stderr.clone())
                .envs(&envs)
                .build_p1();

            let mut store = Store::new(&engine, wasi_ctx);
            if let Err(e) = store.set_fuel(fuel) {
                return ScriptResult::from_error(format!("failed to set fuel limit: {e}"));
            }

            let mut linker = Linker::new(&engine);
            if let Err(e) =
                wasmtime_wasi::preview1::add_to_linker_sync(&mut linker, |ctx: &mut WasiP1Ctx| ctx)
            {
                return ScriptResult::from_error(format!("failed to define WASI: {e}"));
            }

            let instance = match linker.instantiate(&mut store, &module) {
                Ok(instance) => instance,
                Err(e) => return ScriptResult::from_error(format!("failed to instantiate: {e}")),
            };

            let start = match instance.get_typed_func::<(), ()>(&mut store, "_start") {
                Ok(func) => func,
                Err(e) => {
                    return ScriptResult::from_error(format!("no _start entry point: {e}"))
                }
            };

            // A non-zero exit is reportable, but stdout is still consumed.
            let exit_code = match start.call(&mut store, ()) {
                Ok(()) => 0,
                Err(e) => {
                    if let Some(exit) = e.downcast_ref::<wasmtime_wasi::I32Exit>() {
                        i64::from(exit.0)
                    } else if e.to_string().contains("fuel") {
                        return ScriptResult::from_error("module timed out (fuel exhausted)");
                    } else {
                        return ScriptResult::from_error(format!(
                            "failed to execute wasm module: {e}"
                        ));
                    }
                }
            };

            let output = stdout.contents().to_vec();

            // The module may print a full JSON result; raw output is taken
            // as the payload otherwise.
            let mut result = match serde_json::from_slice::<ScriptResult>(&output) {
                Ok(result) => result,
                Err(_) => ScriptResult { payload: output, ..ScriptResult::default() },
            };

            if exit_code != 0 && result.error.is_empty() {
                result.error = format!("module exited with status {exit_code}");
            }

            let errors = stderr.contents();
            if !errors.is_empty() {
                result.error = String::from_utf8_lossy(&errors).to_string();
            }

            result
        }
    }

    #[async_trait::async_trait]
    impl Executor for WasmExecutor {
        #[tracing::instrument(
            skip_all,
            fields(subject = %msg.subject, script = %script.name, executor = "wasm")
        )]
        async fn handle(
            &self,
            ctx: &ExecContext,
            msg: &Message,
            script: &Script,
        ) -> Option<ScriptResult> {
            // The script's content is the path to the compiled module.
            let module_path =
                String::from_utf8_lossy(&script.content).trim().to_string();

            let module_bytes = match tokio::fs::read(&module_path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    return Some(ScriptResult::from_error(format!(
                        "failed to read wasm module file {module_path}: {e}"
                    )))
                }
            };

            let envs = vec![
                ("SUBJECT".to_string(), msg.subject.clone()),
                ("PAYLOAD".to_string(), String::from_utf8_lossy(&msg.payload).to_string()),
                ("METHOD".to_string(), msg.method.clone()),
                ("URL".to_string(), msg.url.clone()),
            ];

            let budget = ctx.remaining().unwrap_or(MAX_INTERPRETER_RUNNING_TIME);
            let fuel = FUEL_PER_SEC * budget.as_secs().max(1);

            debug!(module = %module_path, "running wasm module");
            let result =
                tokio::task::spawn_blocking(move || Self::execute_sync(module_bytes, envs, fuel))
                    .await
                    .unwrap_or_else(|e| {
                        ScriptResult::from_error(format!("wasm task failed: {e}"))
                    });
            debug!(module = %module_path, code = result.code, "finished wasm module");

            Some(result)
        }

        async fn stop(&self) {
            debug!("wasm executor stopped");
        }
    }

}

#[cfg(not(feature = "wasm"))]
mod disabled {
    use crate::executor::{ExecContext, Executor};
    use crate::models::{Message, Script, ScriptResult};

    /// Stub registered when the build does not carry the WASI runtime.
    #[derive(Default)]
    pub struct WasmExecutor;

    impl WasmExecutor {
        /// Creates the stub.
        pub fn new() -> Self {
            WasmExecutor
        }
    }

    #[async_trait::async_trait]
    impl Executor for WasmExecutor {
        async fn handle(
            &self,
            _ctx: &ExecContext,
            _msg: &Message,
            _script: &Script,
        ) -> Option<ScriptResult> {
            Some(ScriptResult::from_error("server wasn't built with wasm support"))
        }

        async fn stop(&self) {}
    }

}

#[cfg(feature = "wasm")]
pub use enabled::WasmExecutor;
#[cfg(not(feature = "wasm"))]
pub use disabled::WasmExecutor;
