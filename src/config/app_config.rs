//! Application configuration for the broker server.

use std::time::Duration;

use config::{Config, ConfigError, File};
use serde::Deserialize;

use super::{deserialize_duration_from_seconds, InterpreterConfig};

/// Default NATS endpoint when neither the flag nor `BUS_URL` is set.
pub const DEFAULT_BUS_URL: &str = "nats://127.0.0.1:4222";

fn default_backend() -> String {
    crate::store::BACKEND_FILE.to_string()
}

fn default_kv_endpoints() -> String {
    "localhost:2379".to_string()
}

fn default_http_port() -> u16 {
    7643
}

fn default_script_dir() -> String {
    ".".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_message_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_container_runtime() -> String {
    "podman".to_string()
}

/// Top-level application configuration, loaded from an optional config file
/// with CLI-flag overrides applied on top.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Storage backend name (`etcd`, `file`, `memory`).
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Comma-separated etcd endpoints. `KV_ENDPOINTS` overrides.
    #[serde(default = "default_kv_endpoints")]
    pub kv_endpoints: String,

    /// Bus URL. Falls back to `BUS_URL`, then the local default.
    #[serde(default)]
    pub bus_url: Option<String>,

    /// Port the HTTP gateway listens on.
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Root directory for the file backend's scripts.
    #[serde(default = "default_script_dir")]
    pub script_dir: String,

    /// Root directory for the file backend's libraries.
    #[serde(default)]
    pub library_dir: Option<String>,

    /// Default gateway request timeout (overridable per request via the
    /// `_timeout` query parameter).
    #[serde(
        default = "default_request_timeout",
        deserialize_with = "deserialize_duration_from_seconds"
    )]
    pub request_timeout: Duration,

    /// Per-message execution deadline applied by the dispatch loop. The
    /// interpreter additionally enforces its own two-minute hard cap.
    #[serde(
        default = "default_message_timeout",
        deserialize_with = "deserialize_duration_from_seconds"
    )]
    pub message_timeout: Duration,

    /// Container runtime binary driven by the container executor.
    #[serde(default = "default_container_runtime")]
    pub container_runtime: String,

    /// Interpreter security limits.
    #[serde(default)]
    pub interpreter: InterpreterConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            kv_endpoints: default_kv_endpoints(),
            bus_url: None,
            http_port: default_http_port(),
            script_dir: default_script_dir(),
            library_dir: None,
            request_timeout: default_request_timeout(),
            message_timeout: default_message_timeout(),
            container_runtime: default_container_runtime(),
            interpreter: InterpreterConfig::default(),
        }
    }
}

impl AppConfig {
    /// Reads the configuration file. The default `msgscript.yaml` is
    /// optional; an explicitly named file must exist.
    pub fn new(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let source = match config_path {
            Some(path) => File::with_name(path),
            None => File::with_name("msgscript").required(false),
        };
        Config::builder().add_source(source).build()?.try_deserialize()
    }

    /// The bus endpoint: configured value, `BUS_URL`, or the local default.
    pub fn bus_url(&self) -> String {
        if let Some(url) = &self.bus_url {
            return url.clone();
        }
        std::env::var("BUS_URL").unwrap_or_else(|_| DEFAULT_BUS_URL.to_string())
    }

    /// etcd endpoints: `KV_ENDPOINTS` wins over the configured value.
    pub fn kv_endpoints(&self) -> String {
        std::env::var("KV_ENDPOINTS").unwrap_or_else(|_| self.kv_endpoints.clone())
    }
}
