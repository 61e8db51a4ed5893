//! Memory-only development store: single process, single writer, no real
//! lock contention.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ScriptEvent, ScriptStore, StoreError, WatchHandler};

/// In-memory script store for development and tests.
#[derive(Default)]
pub struct MemoryScriptStore {
    scripts: RwLock<HashMap<String, HashMap<String, Vec<u8>>>>,
    libraries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryScriptStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        MemoryScriptStore::default()
    }
}

#[async_trait]
impl ScriptStore for MemoryScriptStore {
    async fn add_script(
        &self,
        subject: &str,
        name: &str,
        content: &[u8],
    ) -> Result<(), StoreError> {
        self.scripts
            .write()
            .await
            .entry(subject.to_string())
            .or_default()
            .insert(name.to_string(), content.to_vec());
        Ok(())
    }

    async fn delete_script(&self, subject: &str, name: &str) -> Result<(), StoreError> {
        let mut scripts = self.scripts.write().await;
        if let Some(names) = scripts.get_mut(subject) {
            names.remove(name);
            if names.is_empty() {
                scripts.remove(subject);
            }
        }
        Ok(())
    }

    async fn get_scripts(&self, subject: &str) -> Result<HashMap<String, Vec<u8>>, StoreError> {
        Ok(self.scripts.read().await.get(subject).cloned().unwrap_or_default())
    }

    async fn list_subjects(&self) -> Result<Vec<String>, StoreError> {
        let mut subjects: Vec<String> = self.scripts.read().await.keys().cloned().collect();
        subjects.sort();
        Ok(subjects)
    }

    async fn watch(&self, subject: &str, handler: WatchHandler) -> Result<(), StoreError> {
        handler(ScriptEvent {
            subject: subject.to_string(),
            name: String::new(),
            content: Vec::new(),
            deleted: false,
        });
        Ok(())
    }

    async fn load_libraries(&self, keys: &[String]) -> Result<Vec<Vec<u8>>, StoreError> {
        let libraries = self.libraries.read().await;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            match libraries.get(key) {
                Some(content) => out.push(content.clone()),
                None => return Err(StoreError::MissingLibrary(key.clone())),
            }
        }
        Ok(out)
    }

    async fn add_library(&self, path: &str, content: &[u8]) -> Result<(), StoreError> {
        self.libraries.write().await.insert(path.to_string(), content.to_vec());
        Ok(())
    }

    async fn remove_library(&self, path: &str) -> Result<(), StoreError> {
        self.libraries.write().await.remove(path);
        Ok(())
    }

    async fn take_lock(&self, _path: &str) -> Result<bool, StoreError> {
        Ok(true)
    }

    async fn release_lock(&self, _path: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stored_scripts_are_visible_until_deleted() {
        let store = MemoryScriptStore::new();
        store.add_script("funcs.echo", "e1", b"body").await.unwrap();

        let scripts = store.get_scripts("funcs.echo").await.unwrap();
        assert_eq!(scripts.get("e1").map(Vec::as_slice), Some(b"body".as_slice()));

        store.delete_script("funcs.echo", "e1").await.unwrap();
        assert!(store.get_scripts("funcs.echo").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replacing_a_script_keeps_one_entry_per_name() {
        let store = MemoryScriptStore::new();
        store.add_script("funcs.echo", "e1", b"v1").await.unwrap();
        store.add_script("funcs.echo", "e1", b"v2").await.unwrap();

        let scripts = store.get_scripts("funcs.echo").await.unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts.get("e1").map(Vec::as_slice), Some(b"v2".as_slice()));
    }

    #[tokio::test]
    async fn duplicate_library_keys_load_in_order() {
        let store = MemoryScriptStore::new();
        store.add_library("strings", b"fn upper(s) { s }").await.unwrap();

        let keys = vec!["strings".to_string(), "strings".to_string()];
        let libs = store.load_libraries(&keys).await.unwrap();
        assert_eq!(libs.len(), 2);
        assert_eq!(libs[0], libs[1]);
    }

    #[tokio::test]
    async fn load_is_all_or_nothing() {
        let store = MemoryScriptStore::new();
        store.add_library("present", b"x").await.unwrap();

        let keys = vec!["present".to_string(), "absent".to_string()];
        let err = store.load_libraries(&keys).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingLibrary(k) if k == "absent"));
    }

    #[tokio::test]
    async fn locks_never_contend() {
        let store = MemoryScriptStore::new();
        assert!(store.take_lock("e1").await.unwrap());
        assert!(store.take_lock("e1").await.unwrap());
        store.release_lock("e1").await.unwrap();
        // Releasing twice is a no-op.
        store.release_lock("e1").await.unwrap();
    }
}
