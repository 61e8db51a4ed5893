//! Script execution backends.
//!
//! Every runtime implements [`Executor`]: one call per `(message, script)`
//! pair, returning a [`ScriptResult`] or `None` for a graceful skip (another
//! replica holds the script's lock). A registry maps executor tags to
//! implementations; selection precedence per message is the wire-level
//! override, then the script's declared executor, then the interpreter.

pub mod container;
pub mod interpreter;
pub mod modules;
pub mod plugins;
pub mod wasm;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use container::ContainerExecutor;
pub use interpreter::InterpreterExecutor;
pub use wasm::WasmExecutor;

use crate::config::AppConfig;
use crate::models::{ExecutorKind, Message, Script, ScriptResult};
use crate::store::ScriptStore;

/// Hard ceiling on a single interpreter invocation, regardless of ambient
/// deadlines.
pub const MAX_INTERPRETER_RUNNING_TIME: Duration = Duration::from_secs(120);

/// Cancellation and deadline context threaded through every invocation.
#[derive(Debug, Clone)]
pub struct ExecContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl ExecContext {
    /// A context that is cancelled with `cancel` and expires after
    /// `timeout`, when given.
    pub fn new(cancel: CancellationToken, timeout: Option<Duration>) -> Self {
        ExecContext { cancel, deadline: timeout.map(|t| Instant::now() + t) }
    }

    /// The shutdown token invocations must observe.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Absolute deadline, if one applies.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }
}

impl Default for ExecContext {
    fn default() -> Self {
        ExecContext::new(CancellationToken::new(), None)
    }
}

/// A script execution backend.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs `script` against `msg` and returns its result.
    ///
    /// `None` is the graceful skip: the script contributes nothing to the
    /// aggregate reply, either because another replica holds the cluster
    /// lock and will answer instead, or because the script produced no
    /// usable return value. Every failure mode is captured in the returned
    /// [`ScriptResult::error`]; executors never propagate a crash.
    async fn handle(
        &self,
        ctx: &ExecContext,
        msg: &Message,
        script: &Script,
    ) -> Option<ScriptResult>;

    /// Cooperative shutdown. Idempotent.
    async fn stop(&self);
}

/// Maps executor tags to their implementations.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<ExecutorKind, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        ExecutorRegistry::default()
    }

    /// Registers `executor` under `kind`, replacing any previous entry.
    pub fn register(&mut self, kind: ExecutorKind, executor: Arc<dyn Executor>) {
        self.executors.insert(kind, executor);
    }

    /// Looks up the executor registered for `kind`.
    pub fn get(&self, kind: ExecutorKind) -> Option<Arc<dyn Executor>> {
        self.executors.get(&kind).cloned()
    }

    /// Stops every registered executor.
    pub async fn stop_all(&self) {
        for executor in self.executors.values() {
            executor.stop().await;
        }
    }
}

/// Builds the registry with every runtime this build carries: the
/// interpreter, plus the WASI and container runtimes (stubbed when their
/// cargo features are off, so requesting them still yields a structured
/// error instead of a missing tag).
pub fn start_all_executors(
    config: &AppConfig,
    store: Arc<dyn ScriptStore>,
    deps: modules::HostDeps,
    preloaders: Vec<Arc<dyn plugins::Preloader>>,
) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    registry.register(
        ExecutorKind::Interpreter,
        Arc::new(InterpreterExecutor::new(
            Arc::clone(&store),
            deps,
            config.interpreter.clone(),
            preloaders,
        )),
    );
    registry.register(ExecutorKind::Wasm, Arc::new(WasmExecutor::new()));
    registry.register(
        ExecutorKind::Container,
        Arc::new(ContainerExecutor::new(config.container_runtime.clone())),
    );
    registry
}
