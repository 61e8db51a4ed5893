//! Durable storage for scripts and libraries.
//!
//! Every backend implements [`ScriptStore`]: keyed CRUD on scripts, ordered
//! all-or-nothing library loads, mutation watches, and the cluster-wide
//! script lock. The etcd backend provides real mutual exclusion; the file
//! and memory backends serve single-process deployments where the lock is
//! uncontended by construction.

mod etcd;
mod file;
mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

pub use etcd::EtcdScriptStore;
pub use file::FileScriptStore;
pub use memory::MemoryScriptStore;

use crate::config::AppConfig;
use crate::models::ScriptParseError;

/// Backend name for the etcd-backed store.
pub const BACKEND_ETCD: &str = "etcd";
/// Backend name for the local-directory store.
pub const BACKEND_FILE: &str = "file";
/// Backend name for the in-memory development store.
pub const BACKEND_MEMORY: &str = "memory";

/// Errors produced by the storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The etcd client reported a failure.
    #[error("etcd backend error: {0}")]
    Etcd(#[from] etcd_client::Error),

    /// Filesystem access failed in the local backend.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The filesystem watcher could not be installed.
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    /// A referenced library key does not exist.
    #[error("library key '{0}' does not exist")]
    MissingLibrary(String),

    /// A script on disk failed validation.
    #[error("invalid script {path}: {reason}")]
    InvalidScript {
        /// File the script was read from.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A script envelope could not be parsed.
    #[error(transparent)]
    Parse(#[from] ScriptParseError),

    /// The requested backend name is not known.
    #[error("unknown store backend '{0}'")]
    UnknownBackend(String),
}

/// A mutation observed by [`ScriptStore::watch`].
#[derive(Debug, Clone)]
pub struct ScriptEvent {
    /// Subject the script is bound to.
    pub subject: String,
    /// Script name within the subject.
    pub name: String,
    /// New content; empty when the script was deleted.
    pub content: Vec<u8>,
    /// True when the mutation removed the script.
    pub deleted: bool,
}

/// Callback receiving watch events.
pub type WatchHandler = Box<dyn Fn(ScriptEvent) + Send + Sync>;

/// The storage contract shared by every backend.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ScriptStore: Send + Sync {
    /// Stores (or replaces) a script under `(subject, name)`.
    async fn add_script(&self, subject: &str, name: &str, content: &[u8])
        -> Result<(), StoreError>;

    /// Deletes the script stored under `(subject, name)`.
    async fn delete_script(&self, subject: &str, name: &str) -> Result<(), StoreError>;

    /// Returns every script bound to `subject`, keyed by name. An empty map
    /// (not an error) when nothing matches.
    async fn get_scripts(&self, subject: &str) -> Result<HashMap<String, Vec<u8>>, StoreError>;

    /// Lists every subject that has at least one script.
    async fn list_subjects(&self) -> Result<Vec<String>, StoreError>;

    /// Streams script mutations under `subject` to `handler`.
    ///
    /// Long-lived on the etcd backend (runs until the watch stream ends).
    /// The local backends register the handler with their reload machinery,
    /// emit one synthetic initial event, and return.
    async fn watch(&self, subject: &str, handler: WatchHandler) -> Result<(), StoreError>;

    /// Loads libraries in input order. Fails with
    /// [`StoreError::MissingLibrary`] if any key is absent — all or nothing.
    async fn load_libraries(&self, keys: &[String]) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Stores (or replaces) a library under `path`.
    async fn add_library(&self, path: &str, content: &[u8]) -> Result<(), StoreError>;

    /// Removes the library stored under `path`.
    async fn remove_library(&self, path: &str) -> Result<(), StoreError>;

    /// Non-blocking attempt at the cluster-wide lock for `path`.
    /// `Ok(false)` means another holder owns it, not an error.
    async fn take_lock(&self, path: &str) -> Result<bool, StoreError>;

    /// Releases the lock taken for `path`. Idempotent; releasing an unowned
    /// lock is a no-op.
    async fn release_lock(&self, path: &str) -> Result<(), StoreError>;
}

/// Builds the store selected by `backend` name.
pub async fn store_by_name(
    backend: &str,
    config: &AppConfig,
) -> Result<Arc<dyn ScriptStore>, StoreError> {
    match backend {
        BACKEND_ETCD => {
            Ok(Arc::new(EtcdScriptStore::connect(&config.kv_endpoints()).await?))
        }
        BACKEND_FILE => Ok(Arc::new(FileScriptStore::new(
            &config.script_dir,
            config.library_dir.as_deref(),
        )?)),
        BACKEND_MEMORY => Ok(Arc::new(MemoryScriptStore::new())),
        other => Err(StoreError::UnknownBackend(other.to_string())),
    }
}
