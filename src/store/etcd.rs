//! etcd-backed script store.
//!
//! Scripts live under `msgscript/scripts/<subject>/<name>`, libraries under
//! `msgscript/libs/<path>`. The cluster-wide script lock is a key under
//! `msgscript/locks/` bound to a short-TTL lease and acquired with a
//! compare-and-create transaction, so `take_lock` never blocks: either the
//! key did not exist and this process now holds it, or someone else does.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, PutOptions, Txn, TxnOp,
    WatchOptions,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ScriptEvent, ScriptStore, StoreError, WatchHandler};

const ETCD_TIMEOUT: Duration = Duration::from_secs(3);
/// Lease TTL backing each lock, in seconds.
const ETCD_SESSION_TTL: u64 = 3;
const SCRIPT_KEY_PREFIX: &str = "msgscript/scripts";
const LIBRARY_KEY_PREFIX: &str = "msgscript/libs";
const LOCK_KEY_PREFIX: &str = "msgscript/locks";

/// Bookkeeping for one held lock: the lease that owns the key and the
/// watchdog that force-releases it if the holder never does.
struct LockEntry {
    lease_id: i64,
    watchdog: JoinHandle<()>,
}

/// Script store backed by an etcd cluster.
pub struct EtcdScriptStore {
    client: Client,
    locks: Arc<DashMap<String, LockEntry>>,
}

fn script_key(subject: &str, name: &str) -> String {
    format!("{SCRIPT_KEY_PREFIX}/{subject}/{name}")
}

fn subject_prefix(subject: &str) -> String {
    format!("{SCRIPT_KEY_PREFIX}/{subject}/")
}

fn library_key(path: &str) -> String {
    format!("{LIBRARY_KEY_PREFIX}/{path}")
}

fn lock_key(path: &str) -> String {
    format!("{LOCK_KEY_PREFIX}/{path}")
}

impl EtcdScriptStore {
    /// Connects to the etcd cluster at `endpoints` (comma-separated).
    pub async fn connect(endpoints: &str) -> Result<Self, StoreError> {
        debug!(endpoints, "connecting to etcd");

        let endpoints: Vec<&str> = endpoints.split(',').map(str::trim).collect();
        let options = ConnectOptions::new().with_connect_timeout(ETCD_TIMEOUT);
        let client = Client::connect(&endpoints, Some(options)).await?;

        debug!("connected to etcd");
        Ok(EtcdScriptStore { client, locks: Arc::new(DashMap::new()) })
    }

    async fn revoke_lease(mut client: Client, lease_id: i64) {
        if let Err(e) = client.lease_revoke(lease_id).await {
            warn!(lease_id, error = %e, "failed to revoke lock lease");
        }
    }
}

#[async_trait]
impl ScriptStore for EtcdScriptStore {
    async fn add_script(
        &self,
        subject: &str,
        name: &str,
        content: &[u8],
    ) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client.put(script_key(subject, name), content, None).await?;

        debug!(subject, name, "script added");
        Ok(())
    }

    async fn delete_script(&self, subject: &str, name: &str) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client.delete(script_key(subject, name), None).await?;

        debug!(subject, name, "script deleted");
        Ok(())
    }

    async fn get_scripts(
        &self,
        subject: &str,
    ) -> Result<std::collections::HashMap<String, Vec<u8>>, StoreError> {
        let prefix = subject_prefix(subject);
        let mut client = self.client.clone();
        let resp = client.get(prefix.as_str(), Some(GetOptions::new().with_prefix())).await?;

        let mut scripts = std::collections::HashMap::new();
        for kv in resp.kvs() {
            let key = kv.key_str()?;
            let name = key.strip_prefix(&prefix).unwrap_or(key);
            scripts.insert(name.to_string(), kv.value().to_vec());
        }

        debug!(subject, count = scripts.len(), "retrieved scripts");
        Ok(scripts)
    }

    async fn list_subjects(&self) -> Result<Vec<String>, StoreError> {
        let prefix = format!("{SCRIPT_KEY_PREFIX}/");
        let mut client = self.client.clone();
        let resp = client.get(prefix.as_str(), Some(GetOptions::new().with_prefix())).await?;

        let mut subjects = BTreeSet::new();
        for kv in resp.kvs() {
            let key = kv.key_str()?;
            if let Some(rest) = key.strip_prefix(&prefix) {
                if let Some((subject, _)) = rest.split_once('/') {
                    subjects.insert(subject.to_string());
                }
            }
        }

        Ok(subjects.into_iter().collect())
    }

    async fn watch(&self, subject: &str, handler: WatchHandler) -> Result<(), StoreError> {
        let prefix = subject_prefix(subject);
        let mut client = self.client.clone();
        let (_watcher, mut stream) =
            client.watch(prefix.as_str(), Some(WatchOptions::new().with_prefix())).await?;

        while let Some(resp) = stream.message().await? {
            for event in resp.events() {
                let Some(kv) = event.kv() else { continue };
                let key = kv.key_str()?;
                let name = key.strip_prefix(&prefix).unwrap_or(key).to_string();

                match event.event_type() {
                    EventType::Put => {
                        debug!(subject, name, "script added/updated");
                        handler(ScriptEvent {
                            subject: subject.to_string(),
                            name,
                            content: kv.value().to_vec(),
                            deleted: false,
                        });
                    }
                    EventType::Delete => {
                        debug!(subject, name, "script deleted");
                        handler(ScriptEvent {
                            subject: subject.to_string(),
                            name,
                            content: Vec::new(),
                            deleted: true,
                        });
                    }
                }
            }
        }

        Ok(())
    }

    async fn load_libraries(&self, keys: &[String]) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut libraries = Vec::with_capacity(keys.len());
        for path in keys {
            let key = library_key(path);
            let mut client = self.client.clone();
            let resp = client.get(key.as_str(), None).await?;

            match resp.kvs().first() {
                Some(kv) => libraries.push(kv.value().to_vec()),
                None => return Err(StoreError::MissingLibrary(path.clone())),
            }
        }

        Ok(libraries)
    }

    async fn add_library(&self, path: &str, content: &[u8]) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client.put(library_key(path), content, None).await?;
        Ok(())
    }

    async fn remove_library(&self, path: &str) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client.delete(library_key(path), None).await?;
        Ok(())
    }

    async fn take_lock(&self, path: &str) -> Result<bool, StoreError> {
        let key = lock_key(path);
        let mut client = self.client.clone();

        let lease = client.lease_grant(ETCD_SESSION_TTL as i64, None).await?;
        let lease_id = lease.id();

        // The key is created only if it does not already exist; binding it
        // to the lease bounds how long a crashed holder can keep it.
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key.as_str(), CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                key.as_str(),
                Vec::<u8>::new(),
                Some(PutOptions::new().with_lease(lease_id)),
            )]);

        let resp = client.txn(txn).await?;
        if !resp.succeeded() {
            Self::revoke_lease(client, lease_id).await;
            debug!(path, "lock already held elsewhere");
            return Ok(false);
        }

        // Force-release one second past the lease TTL in case the holder
        // never unlocks.
        let locks = Arc::clone(&self.locks);
        let watchdog_client = self.client.clone();
        let watchdog_path = path.to_string();
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(ETCD_SESSION_TTL + 1)).await;
            if let Some((_, entry)) = locks.remove(&watchdog_path) {
                debug!(path = %watchdog_path, "releasing lock on watchdog timeout");
                Self::revoke_lease(watchdog_client, entry.lease_id).await;
            }
        });

        self.locks.insert(path.to_string(), LockEntry { lease_id, watchdog });
        debug!(path, "lock acquired");
        Ok(true)
    }

    async fn release_lock(&self, path: &str) -> Result<(), StoreError> {
        let Some((_, entry)) = self.locks.remove(path) else {
            // Not a holder; releasing an unowned lock is a no-op.
            debug!(path, "no held lock to release");
            return Ok(());
        };

        entry.watchdog.abort();
        // Revoking the lease deletes the lock key with it.
        Self::revoke_lease(self.client.clone(), entry.lease_id).await;

        debug!(path, "lock released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_keys_follow_the_persisted_layout() {
        assert_eq!(script_key("funcs.echo", "e1"), "msgscript/scripts/funcs.echo/e1");
        assert_eq!(library_key("strings"), "msgscript/libs/strings");
        assert_eq!(lock_key("e1"), "msgscript/locks/e1");
    }

    #[test]
    fn watch_prefix_strips_back_to_the_name() {
        let prefix = subject_prefix("funcs.echo");
        let key = script_key("funcs.echo", "e1");
        assert_eq!(key.strip_prefix(&prefix), Some("e1"));
    }
}
