//! The Supervisor owns the broker's long-running services — the bus
//! dispatch loop and the HTTP gateway — plus the shared store, executor
//! registry and bus connection. It starts everything into a `JoinSet`,
//! listens for SIGINT/SIGTERM, and orchestrates a clean shutdown: if a
//! critical task fails, every other service is brought down rather than
//! continuing in a partially-functional state.

use std::sync::Arc;

use thiserror::Error;
use tokio::signal;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::dispatch::{DispatchError, DispatchLoop, MessageDispatcher};
use crate::executor::modules::HostDeps;
use crate::executor::plugins::Preloader;
use crate::executor::{start_all_executors, ExecutorRegistry};
use crate::gateway::{run_gateway, GatewayError, GatewayState};
use crate::store::{store_by_name, ScriptStore, StoreError, BACKEND_ETCD};

/// Errors raised while assembling or running the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// No configuration was provided to the builder.
    #[error("missing configuration for supervisor")]
    MissingConfig,

    /// Connecting to the bus failed.
    #[error("failed to connect to the bus at {url}: {source}")]
    BusConnect {
        /// The endpoint that was dialed.
        url: String,
        /// The underlying connect failure.
        source: async_nats::ConnectError,
    },

    /// The script store could not be initialized.
    #[error("failed to initialize the script store: {0}")]
    Store(#[from] StoreError),

    /// The dispatch loop failed to start.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The gateway failed to start.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// The primary runtime manager for the broker.
pub struct Supervisor {
    config: AppConfig,
    client: async_nats::Client,
    store: Arc<dyn ScriptStore>,
    registry: Arc<ExecutorRegistry>,
    cancellation_token: tokio_util::sync::CancellationToken,
    join_set: tokio::task::JoinSet<()>,
}

/// Assembles a [`Supervisor`] from configuration and optional interpreter
/// preloaders.
#[derive(Default)]
pub struct SupervisorBuilder {
    config: Option<AppConfig>,
    preloaders: Vec<Arc<dyn Preloader>>,
}

impl SupervisorBuilder {
    /// Sets the application configuration.
    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Adds an operator preloader for the interpreter executor.
    pub fn preloader(mut self, preloader: Arc<dyn Preloader>) -> Self {
        self.preloaders.push(preloader);
        self
    }

    /// Connects the bus and store clients and wires the executor registry.
    pub async fn build(self) -> Result<Supervisor, SupervisorError> {
        let config = self.config.ok_or(SupervisorError::MissingConfig)?;

        let bus_url = config.bus_url();
        let client = async_nats::connect(&bus_url)
            .await
            .map_err(|source| SupervisorError::BusConnect { url: bus_url.clone(), source })?;
        info!(url = %bus_url, "connected to the bus");

        let store = store_by_name(&config.backend, &config).await?;
        info!(backend = %config.backend, "starting store backend");

        // The kv host module gets its own client so scripts do not share
        // the store's connection state.
        let kv = if config.backend == BACKEND_ETCD {
            let endpoints_raw = config.kv_endpoints();
            let endpoints: Vec<&str> = endpoints_raw.split(',').map(str::trim).collect();
            match etcd_client::Client::connect(&endpoints, None).await {
                Ok(kv) => Some(kv),
                Err(e) => {
                    warn!(error = %e, "kv host module unavailable");
                    None
                }
            }
        } else {
            None
        };

        let deps = HostDeps::new(Some(client.clone()), kv);
        let registry =
            Arc::new(start_all_executors(&config, Arc::clone(&store), deps, self.preloaders));

        Ok(Supervisor {
            config,
            client,
            store,
            registry,
            cancellation_token: tokio_util::sync::CancellationToken::new(),
            join_set: tokio::task::JoinSet::new(),
        })
    }
}

impl Supervisor {
    /// Creates a builder.
    pub fn builder() -> SupervisorBuilder {
        SupervisorBuilder::default()
    }

    /// Starts every service and blocks until shutdown.
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        // Signal handler: SIGINT / SIGTERM cancel the root token.
        let signal_token = self.cancellation_token.clone();
        self.join_set.spawn(async move {
            let ctrl_c = signal::ctrl_c();
            #[cfg(unix)]
            let terminate = async {
                signal::unix::signal(signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler")
                    .recv()
                    .await;
            };
            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => info!("SIGINT received, initiating graceful shutdown"),
                _ = terminate => info!("SIGTERM received, initiating graceful shutdown"),
            }

            signal_token.cancel();
        });

        // The bus dispatch loop.
        let dispatcher = Arc::new(MessageDispatcher::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.config.message_timeout,
        ));
        let dispatch_loop = Arc::new(DispatchLoop::new(self.client.clone(), dispatcher));
        let loop_token = self.cancellation_token.clone();
        let loop_fail = self.cancellation_token.clone();
        self.join_set.spawn(async move {
            if let Err(e) = dispatch_loop.run(loop_token).await {
                error!(error = %e, "dispatch loop failed");
                loop_fail.cancel();
            }
        });

        // The HTTP gateway.
        let gateway_state =
            GatewayState::new(self.client.clone(), self.config.request_timeout);
        let gateway_port = self.config.http_port;
        let gateway_token = self.cancellation_token.clone();
        let gateway_fail = self.cancellation_token.clone();
        self.join_set.spawn(async move {
            if let Err(e) = run_gateway(gateway_state, gateway_port, gateway_token).await {
                error!(error = %e, "http gateway failed");
                gateway_fail.cancel();
            }
        });

        // Supervision loop: wait for shutdown or a dying task.
        loop {
            tokio::select! {
                biased;

                _ = self.cancellation_token.cancelled() => {
                    info!("supervisor cancellation signal received, shutting down");
                    break;
                }

                maybe_result = self.join_set.join_next() => {
                    match maybe_result {
                        Some(Err(e)) => {
                            error!("a critical task failed: {e:?}, initiating shutdown");
                            self.cancellation_token.cancel();
                        }
                        Some(Ok(())) => {}
                        None => break,
                    }
                }
            }
        }

        // Graceful shutdown: stop executors (kills tracked containers,
        // drains in-flight invocations via the cancelled token), then the
        // remaining tasks.
        self.registry.stop_all().await;
        self.join_set.shutdown().await;
        info!("supervisor shutdown complete");
        Ok(())
    }
}
