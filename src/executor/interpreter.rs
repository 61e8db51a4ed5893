//! The embedded interpreter executor.
//!
//! Scripts run in a fresh rhai engine per invocation, with the configured
//! security limits, the host modules from [`super::modules`], and any
//! operator preloaders. Libraries are concatenated in order before the
//! script body and the whole thing executes as a single program.
//!
//! Two calling conventions, selected by the script's `html` header:
//!
//! - raw: a global `OnMessage(subject, payload)` returning a string;
//! - HTML: a global function named after the HTTP method, called with
//!   `(url_suffix, payload)`, returning a body string or an array of
//!   `[body, status_code, headers_map]`.

use std::sync::Arc;
use std::time::Instant;

use rhai::{Dynamic, Engine, EvalAltResult, Scope, AST};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::modules::{self, HostDeps};
use super::plugins::{self, Preloader};
use super::{ExecContext, Executor, MAX_INTERPRETER_RUNNING_TIME};
use crate::config::InterpreterConfig;
use crate::models::{Message, Script, ScriptResult};
use crate::store::ScriptStore;

const ON_MESSAGE_FN: &str = "OnMessage";
const TERMINATED_DEADLINE: &str = "deadline";
const TERMINATED_CANCELLED: &str = "cancelled";
/// How many operations pass between deadline checks in the progress hook.
const PROGRESS_CHECK_INTERVAL: u64 = 512;

/// Runs scripts in an embedded rhai interpreter.
pub struct InterpreterExecutor {
    store: Arc<dyn ScriptStore>,
    deps: HostDeps,
    config: InterpreterConfig,
    preloaders: Vec<Arc<dyn Preloader>>,
}

/// Everything one blocking evaluation needs, detached from `self` so it can
/// move onto the blocking thread pool.
struct Invocation {
    source: String,
    subject: String,
    method: String,
    url: String,
    payload: String,
    html: bool,
    deps: HostDeps,
    config: InterpreterConfig,
    preloaders: Vec<Arc<dyn Preloader>>,
    cancel: CancellationToken,
    deadline: Instant,
    // Removed on drop, which covers every exit path.
    workdir: TempDir,
}

fn dynamic_to_string(value: Dynamic) -> String {
    if value.is_unit() {
        return String::new();
    }
    match value.into_immutable_string() {
        Ok(s) => s.as_str().to_string(),
        Err(type_name) => type_name.to_string(),
    }
}

impl InterpreterExecutor {
    /// Creates the executor over `store`, with the host-module clients in
    /// `deps` and the operator `preloaders`.
    pub fn new(
        store: Arc<dyn ScriptStore>,
        deps: HostDeps,
        config: InterpreterConfig,
        preloaders: Vec<Arc<dyn Preloader>>,
    ) -> Self {
        InterpreterExecutor { store, deps, config, preloaders }
    }

    async fn run(
        &self,
        ctx: &ExecContext,
        msg: &Message,
        script: &Script,
        libs: Vec<Vec<u8>>,
    ) -> Option<ScriptResult> {
        let workdir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                return Some(ScriptResult::from_error(format!(
                    "failed to create temp directory: {e}"
                )))
            }
        };

        let hard_cap = Instant::now() + MAX_INTERPRETER_RUNNING_TIME;
        let deadline = ctx.deadline().map_or(hard_cap, |d| d.min(hard_cap));

        let mut source = String::new();
        for lib in &libs {
            source.push_str(&String::from_utf8_lossy(lib));
            source.push('\n');
        }
        source.push_str(&String::from_utf8_lossy(&script.content));
        debug!(subject = %msg.subject, script = %script.name, size = source.len(), "executing script");

        let invocation = Invocation {
            source,
            subject: msg.subject.clone(),
            method: msg.method.clone(),
            url: msg.url.clone(),
            payload: String::from_utf8_lossy(&msg.payload).to_string(),
            html: script.html,
            deps: self.deps.clone(),
            config: self.config.clone(),
            preloaders: self.preloaders.clone(),
            cancel: ctx.cancel_token().clone(),
            deadline,
            workdir,
        };

        // rhai evaluation is synchronous; keep it off the async workers.
        match tokio::task::spawn_blocking(move || Self::evaluate(invocation)).await {
            Ok(result) => result,
            Err(e) => Some(ScriptResult::from_error(format!("interpreter task failed: {e}"))),
        }
    }

    fn evaluate(inv: Invocation) -> Option<ScriptResult> {
        let mut engine = Engine::new();
        engine.set_max_operations(inv.config.max_operations);
        engine.set_max_call_levels(inv.config.max_call_levels);
        engine.set_max_string_size(inv.config.max_string_size);
        engine.set_max_array_size(inv.config.max_array_size);
        engine.disable_symbol("eval");

        let cancel = inv.cancel.clone();
        let deadline = inv.deadline;
        engine.on_progress(move |ops| {
            if ops % PROGRESS_CHECK_INTERVAL != 0 {
                return None;
            }
            if cancel.is_cancelled() {
                return Some(Dynamic::from(TERMINATED_CANCELLED));
            }
            if Instant::now() >= deadline {
                return Some(Dynamic::from(TERMINATED_DEADLINE));
            }
            None
        });

        modules::register_all(&mut engine, &inv.deps, inv.workdir.path(), deadline);
        plugins::load_plugins(&mut engine, &inv.preloaders);

        let ast = match engine.compile(&inv.source) {
            Ok(ast) => ast,
            Err(e) => {
                return Some(ScriptResult::from_error(format!("error compiling script: {e}")))
            }
        };

        if inv.html {
            Some(Self::evaluate_html(&engine, &ast, &inv))
        } else {
            Self::evaluate_raw(&engine, &ast, &inv)
        }
    }

    /// Raw mode: `OnMessage(subject, payload)` must exist and return a
    /// string, which becomes the result payload. A non-string return is
    /// dropped from the reply entirely.
    fn evaluate_raw(engine: &Engine, ast: &AST, inv: &Invocation) -> Option<ScriptResult> {
        if !ast.iter_functions().any(|f| f.name == ON_MESSAGE_FN) {
            // The body still runs, like any plain program would.
            if let Err(e) = engine.run_ast(ast) {
                return Some(Self::eval_error(*e));
            }
            return Some(ScriptResult::from_error(format!(
                "failed to find function named '{ON_MESSAGE_FN}'"
            )));
        }

        let mut scope = Scope::new();
        let value = match engine.call_fn::<Dynamic>(
            &mut scope,
            ast,
            ON_MESSAGE_FN,
            (inv.subject.clone(), inv.payload.clone()),
        ) {
            Ok(value) => value,
            Err(e) => return Some(Self::eval_error(*e)),
        };

        match value.into_immutable_string() {
            Ok(s) => Some(ScriptResult {
                payload: s.as_str().as_bytes().to_vec(),
                ..ScriptResult::default()
            }),
            Err(_) => {
                debug!("script did not return a string");
                None
            }
        }
    }

    /// HTML mode: call the function named after the HTTP method with
    /// `(url, payload)`. Return value is a body string or
    /// `[body, code, headers]`; code defaults to 200, headers to empty.
    fn evaluate_html(engine: &Engine, ast: &AST, inv: &Invocation) -> ScriptResult {
        let mut result = ScriptResult { is_html: true, code: 200, ..ScriptResult::default() };

        let method = inv.method.as_str();
        let has_handler = !method.is_empty() && ast.iter_functions().any(|f| f.name == method);
        if !has_handler {
            if let Err(e) = engine.run_ast(ast) {
                return Self::eval_error(*e);
            }
            return result;
        }

        let mut scope = Scope::new();
        let value = match engine.call_fn::<Dynamic>(
            &mut scope,
            ast,
            method,
            (inv.url.clone(), inv.payload.clone()),
        ) {
            Ok(value) => value,
            Err(e) => return Self::eval_error(*e),
        };

        if value.is_array() {
            let mut parts = value.into_array().unwrap_or_default().into_iter();
            if let Some(body) = parts.next() {
                result.payload = dynamic_to_string(body).into_bytes();
            }
            if let Some(code) = parts.next() {
                if let Ok(code) = code.as_int() {
                    if code != 0 {
                        result.code = code;
                    }
                }
            }
            if let Some(headers) = parts.next() {
                if let Some(map) = headers.try_cast::<rhai::Map>() {
                    for (key, value) in map {
                        result.headers.insert(key.to_string(), dynamic_to_string(value));
                    }
                }
            }
        } else {
            result.payload = dynamic_to_string(value).into_bytes();
        }

        result
    }

    fn eval_error(e: EvalAltResult) -> ScriptResult {
        match e {
            EvalAltResult::ErrorTerminated(token, _) => {
                let reason = dynamic_to_string(token);
                if reason == TERMINATED_CANCELLED {
                    ScriptResult::from_error("execution cancelled by shutdown")
                } else {
                    ScriptResult::from_error("script timed out")
                }
            }
            other => ScriptResult::from_error(format!("error executing script: {other}")),
        }
    }
}

#[async_trait::async_trait]
impl Executor for InterpreterExecutor {
    #[tracing::instrument(
        skip_all,
        fields(subject = %msg.subject, script = %script.name, executor = "interpreter")
    )]
    async fn handle(
        &self,
        ctx: &ExecContext,
        msg: &Message,
        script: &Script,
    ) -> Option<ScriptResult> {
        let libs = match self.store.load_libraries(&script.lib_keys).await {
            Ok(libs) => libs,
            Err(e) => {
                return Some(ScriptResult::from_error(format!("failed to load libraries: {e}")))
            }
        };

        match self.store.take_lock(&script.name).await {
            Ok(true) => {}
            Ok(false) => {
                // Another replica will answer.
                debug!("lock held elsewhere, giving up");
                return None;
            }
            Err(e) => {
                debug!(error = %e, "failed to take lock, bailing out");
                return None;
            }
        }

        let result = self.run(ctx, msg, script, libs).await;

        if let Err(e) = self.store.release_lock(&script.name).await {
            warn!(error = %e, "failed to release lock");
        }

        result
    }

    async fn stop(&self) {
        debug!("interpreter executor stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::{MemoryScriptStore, MockScriptStore, StoreError};

    fn interpreter(store: Arc<dyn ScriptStore>) -> InterpreterExecutor {
        InterpreterExecutor::new(
            store,
            HostDeps::new(None, None),
            InterpreterConfig::default(),
            Vec::new(),
        )
    }

    fn raw_script(name: &str, body: &str) -> Script {
        Script {
            name: name.to_string(),
            subject: "t.echo".to_string(),
            content: body.as_bytes().to_vec(),
            ..Script::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn raw_mode_returns_the_on_message_string() {
        let store = Arc::new(MemoryScriptStore::new());
        let exec = interpreter(store);

        let msg = Message { subject: "t.echo".to_string(), payload: b"hi".to_vec(), ..Message::default() };
        let script = raw_script("e1", "fn OnMessage(subject, payload) { subject + payload }");

        let result = exec.handle(&ExecContext::default(), &msg, &script).await.unwrap();
        assert_eq!(result.error, "");
        assert_eq!(result.payload, b"t.echohi".to_vec());
        assert_eq!(result.code, 0);
        assert!(!result.is_html);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_on_message_is_a_reportable_error() {
        let store = Arc::new(MemoryScriptStore::new());
        let exec = interpreter(store);

        let msg = Message { subject: "t.echo".to_string(), payload: b"x".to_vec(), ..Message::default() };
        let script = raw_script("e1", "let x = 1;");

        let result = exec.handle(&ExecContext::default(), &msg, &script).await.unwrap();
        assert!(result.error.contains("OnMessage"), "got: {}", result.error);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn non_string_return_is_dropped_from_the_reply() {
        let store = Arc::new(MemoryScriptStore::new());
        let exec = interpreter(store);

        let msg = Message { subject: "t".to_string(), payload: b"x".to_vec(), ..Message::default() };
        let script = raw_script("e1", "fn OnMessage(s, p) { 42 }");

        assert!(exec.handle(&ExecContext::default(), &msg, &script).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn libraries_are_concatenated_before_the_script() {
        let store = Arc::new(MemoryScriptStore::new());
        store.add_library("shout", br#"fn shout(s) { s + "!" }"#).await.unwrap();
        let exec = interpreter(store);

        let msg = Message { subject: "t".to_string(), payload: b"hi".to_vec(), ..Message::default() };
        let mut script = raw_script("e1", "fn OnMessage(s, p) { shout(p) }");
        script.lib_keys = vec!["shout".to_string()];

        let result = exec.handle(&ExecContext::default(), &msg, &script).await.unwrap();
        assert_eq!(result.payload, b"hi!".to_vec());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_library_fails_fast() {
        let store = Arc::new(MemoryScriptStore::new());
        let exec = interpreter(store);

        let msg = Message { subject: "t".to_string(), payload: b"x".to_vec(), ..Message::default() };
        let mut script = raw_script("e1", "fn OnMessage(s, p) { p }");
        script.lib_keys = vec!["absent".to_string()];

        let result = exec.handle(&ExecContext::default(), &msg, &script).await.unwrap();
        assert!(result.error.contains("failed to load libraries"), "got: {}", result.error);
        assert!(result.error.contains("absent"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn html_mode_calls_the_method_function() {
        let store = Arc::new(MemoryScriptStore::new());
        let exec = interpreter(store);

        let msg = Message {
            subject: "t.page".to_string(),
            method: "GET".to_string(),
            url: "/sub".to_string(),
            payload: Vec::new(),
            ..Message::default()
        };
        let mut script = raw_script(
            "p1",
            r#"fn GET(url, payload) { ["<h1>ok</h1>", 200, #{"X-Src": "t"}] }"#,
        );
        script.html = true;

        let result = exec.handle(&ExecContext::default(), &msg, &script).await.unwrap();
        assert!(result.is_html);
        assert_eq!(result.code, 200);
        assert_eq!(result.payload, b"<h1>ok</h1>".to_vec());
        assert_eq!(result.headers.get("X-Src").map(String::as_str), Some("t"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn html_mode_defaults_code_for_bare_string_returns() {
        let store = Arc::new(MemoryScriptStore::new());
        let exec = interpreter(store);

        let msg = Message {
            subject: "t.page".to_string(),
            method: "GET".to_string(),
            payload: Vec::new(),
            ..Message::default()
        };
        let mut script = raw_script("p1", r#"fn GET(url, payload) { "<p>hi</p>" }"#);
        script.html = true;

        let result = exec.handle(&ExecContext::default(), &msg, &script).await.unwrap();
        assert_eq!(result.code, 200);
        assert_eq!(result.payload, b"<p>hi</p>".to_vec());
        assert!(result.headers.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn runaway_script_hits_the_deadline() {
        let store = Arc::new(MemoryScriptStore::new());
        let exec = InterpreterExecutor::new(
            store,
            HostDeps::new(None, None),
            // Unlimited operations so the deadline is what stops it.
            InterpreterConfig { max_operations: 0, ..InterpreterConfig::default() },
            Vec::new(),
        );

        let msg = Message { subject: "t".to_string(), payload: b"x".to_vec(), ..Message::default() };
        let script = raw_script("e1", "fn OnMessage(s, p) { let x = 0; loop { x += 1; } }");

        let ctx = ExecContext::new(
            tokio_util::sync::CancellationToken::new(),
            Some(Duration::from_millis(100)),
        );
        let result = exec.handle(&ctx, &msg, &script).await.unwrap();
        assert!(result.error.contains("timed out"), "got: {}", result.error);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lock_held_elsewhere_skips_silently() {
        let mut store = MockScriptStore::new();
        store.expect_load_libraries().returning(|_| Ok(Vec::new()));
        store.expect_take_lock().returning(|_| Ok(false));

        let exec = interpreter(Arc::new(store));
        let msg = Message { subject: "t".to_string(), payload: b"x".to_vec(), ..Message::default() };
        let script = raw_script("e1", "fn OnMessage(s, p) { p }");

        assert!(exec.handle(&ExecContext::default(), &msg, &script).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lock_errors_also_skip_silently() {
        let mut store = MockScriptStore::new();
        store.expect_load_libraries().returning(|_| Ok(Vec::new()));
        store
            .expect_take_lock()
            .returning(|_| Err(StoreError::UnknownBackend("boom".to_string())));

        let exec = interpreter(Arc::new(store));
        let msg = Message { subject: "t".to_string(), payload: b"x".to_vec(), ..Message::default() };
        let script = raw_script("e1", "fn OnMessage(s, p) { p }");

        assert!(exec.handle(&ExecContext::default(), &msg, &script).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lock_is_released_after_execution() {
        let mut store = MockScriptStore::new();
        store.expect_load_libraries().returning(|_| Ok(Vec::new()));
        store.expect_take_lock().returning(|_| Ok(true));
        store.expect_release_lock().times(1).returning(|_| Ok(()));

        let exec = interpreter(Arc::new(store));
        let msg = Message { subject: "t".to_string(), payload: b"x".to_vec(), ..Message::default() };
        let script = raw_script("e1", "fn OnMessage(s, p) { p }");

        assert!(exec.handle(&ExecContext::default(), &msg, &script).await.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn compile_errors_are_captured() {
        let store = Arc::new(MemoryScriptStore::new());
        let exec = interpreter(store);

        let msg = Message { subject: "t".to_string(), payload: b"x".to_vec(), ..Message::default() };
        let script = raw_script("e1", "fn OnMessage(s, p { p }");

        let result = exec.handle(&ExecContext::default(), &msg, &script).await.unwrap();
        assert!(result.error.contains("error compiling script"), "got: {}", result.error);
    }
}
