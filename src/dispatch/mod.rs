//! The dispatch loop.
//!
//! [`DispatchLoop`] is the only consumer of the bus subscription: it drops
//! reply-channel artefacts, decodes envelopes, acknowledges async messages,
//! and publishes replies. The per-message work — script lookup, executor
//! selection, concurrent fan-out, aggregation — lives in
//! [`MessageDispatcher`], which has no bus dependency.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::executor::{ExecContext, ExecutorRegistry};
use crate::models::{ExecutorKind, Message, Reply, Script, ScriptResult, NO_SCRIPT_FOUND};
use crate::store::ScriptStore;
use crate::telemetry;

/// Subject prefix of the bus's internal reply channels.
pub const INBOX_PREFIX: &str = "_INBOX.";

/// Errors that take the dispatch loop down.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The wildcard subscription could not be established.
    #[error("failed to subscribe to bus subjects: {0}")]
    Subscribe(#[from] async_nats::SubscribeError),
}

/// True for messages on the bus's internal inbox namespace.
pub fn is_inbox(subject: &str) -> bool {
    subject.starts_with(INBOX_PREFIX)
}

/// Executes one decoded message against the matching scripts.
pub struct MessageDispatcher {
    store: Arc<dyn ScriptStore>,
    registry: Arc<ExecutorRegistry>,
    message_timeout: Duration,
}

impl MessageDispatcher {
    /// Creates the dispatcher core. `message_timeout` bounds each message's
    /// execution.
    pub fn new(
        store: Arc<dyn ScriptStore>,
        registry: Arc<ExecutorRegistry>,
        message_timeout: Duration,
    ) -> Self {
        MessageDispatcher { store, registry, message_timeout }
    }

    /// Dispatches one message: script lookup, executor selection, concurrent
    /// fan-out, aggregation. Never panics; every failure mode becomes a
    /// well-formed reply.
    pub async fn dispatch(&self, message: &Message, cancel: CancellationToken) -> Reply {
        let ctx = ExecContext::new(cancel, Some(self.message_timeout));

        let contents = match self.store.get_scripts(&message.subject).await {
            Ok(contents) => contents,
            Err(e) => {
                error!(subject = %message.subject, error = %e, "failed to get scripts");
                return Reply::from_error(format!("failed to get scripts for subject: {e}"));
            }
        };

        if contents.is_empty() {
            return Reply::from_error(NO_SCRIPT_FOUND);
        }

        // A wire-level override selects a single executor for every matched
        // script; an unknown or unavailable tag fails the whole dispatch
        // before anything runs.
        let override_kind = if message.executor.is_empty() {
            None
        } else {
            match message.executor.parse::<ExecutorKind>() {
                Ok(kind) if self.registry.get(kind).is_some() => Some(kind),
                Ok(kind) => {
                    return Reply::from_error(format!("executor '{kind}' is not available"))
                }
                Err(e) => return Reply::from_error(e.to_string()),
            }
        };

        let mut results: HashMap<String, ScriptResult> = HashMap::new();
        let mut tasks = Vec::new();

        for (name, content) in contents {
            let script = match Script::parse_bytes(&content) {
                Ok(mut script) => {
                    if script.name.is_empty() {
                        script.name = name.clone();
                    }
                    script
                }
                Err(e) => {
                    results.insert(
                        name,
                        ScriptResult::from_error(format!("failed to read script: {e}")),
                    );
                    continue;
                }
            };

            let kind = override_kind.unwrap_or(script.executor);
            let Some(executor) = self.registry.get(kind) else {
                results.insert(
                    script.name.clone(),
                    ScriptResult::from_error(format!("no executor registered for '{kind}'")),
                );
                continue;
            };

            let ctx = ctx.clone();
            let message = message.clone();
            tasks.push(tokio::spawn(async move {
                let result = executor.handle(&ctx, &message, &script).await;
                (script.name, result)
            }));
        }

        let count = tasks.len();
        for task in tasks {
            match task.await {
                Ok((name, Some(result))) => {
                    results.insert(name, result);
                }
                // A skipped script (lock held elsewhere) contributes nothing.
                Ok((_, None)) => {}
                Err(e) => error!(error = %e, "script task failed"),
            }
        }

        debug!(subject = %message.subject, count, "finished running scripts");
        Reply::from_results(results)
    }
}

/// Consumes the bus subscription and routes messages through the
/// [`MessageDispatcher`].
pub struct DispatchLoop {
    client: async_nats::Client,
    dispatcher: Arc<MessageDispatcher>,
}

impl DispatchLoop {
    /// Creates the loop over a connected bus client.
    pub fn new(client: async_nats::Client, dispatcher: Arc<MessageDispatcher>) -> Self {
        DispatchLoop { client, dispatcher }
    }

    /// Runs the subscription loop until `token` is cancelled or the bus
    /// connection closes. Each message is handled on its own task.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<(), DispatchError> {
        let mut subscriber = self.client.subscribe(">").await?;
        info!("watching bus messages");

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    info!("dispatch loop shutting down");
                    break;
                }

                maybe_msg = subscriber.next() => {
                    let Some(bus_msg) = maybe_msg else {
                        info!("bus subscription closed");
                        break;
                    };
                    let this = Arc::clone(&self);
                    let cancel = token.child_token();
                    tokio::spawn(async move {
                        this.handle_bus_message(bus_msg, cancel).await;
                    });
                }
            }
        }

        let _ = subscriber.unsubscribe().await;
        Ok(())
    }

    async fn handle_bus_message(&self, bus_msg: async_nats::Message, cancel: CancellationToken) {
        if is_inbox(&bus_msg.subject) {
            debug!(subject = %bus_msg.subject, "ignoring reply subject");
            return;
        }

        // Continue the trace the gateway (or any bus client) started.
        let parent = telemetry::extract_context(bus_msg.headers.as_ref());
        let span = info_span!("dispatch_message", subject = %bus_msg.subject);
        span.set_parent(parent);

        async move {
            let message = Message::from_wire(&bus_msg.subject, &bus_msg.payload);
            debug!(
                subject = %message.subject,
                raw = message.raw,
                r#async = message.is_async,
                "received message"
            );

            if message.is_async {
                // Acknowledge immediately; results are logged only.
                if let Some(reply_to) = bus_msg.reply.clone() {
                    if let Err(e) =
                        self.client.publish(reply_to, Bytes::from_static(b"{}")).await
                    {
                        error!(error = %e, "failed to acknowledge async message");
                    }
                }

                let reply = self.dispatcher.dispatch(&message, cancel).await;
                debug!(
                    results = reply.results.len(),
                    error = %reply.error,
                    "async dispatch finished"
                );
                return;
            }

            let reply = self.dispatcher.dispatch(&message, cancel).await;

            let Some(reply_to) = bus_msg.reply.clone() else {
                debug!(subject = %message.subject, "message has no reply subject");
                return;
            };

            let payload = match serde_json::to_vec(&reply) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(error = %e, "failed to serialize reply");
                    return;
                }
            };

            if let Err(e) = self.client.publish(reply_to, payload.into()).await {
                error!(error = %e, "failed to publish reply");
            }
        }
        .instrument(span)
        .await
    }
}
