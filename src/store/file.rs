//! Local-directory script store.
//!
//! Scripts are `.rhai` files under a root directory, parsed through the
//! header envelope at startup and indexed by subject; libraries come from a
//! sibling root (or a `libs/` folder, which the script walk skips). The
//! filesystem is an input source only: `add`/`delete` mutate the in-memory
//! index. A `notify` watcher re-walks the trees on changes and swaps the
//! index atomically so in-flight lookups never observe a torn state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info};

use super::{ScriptEvent, ScriptStore, StoreError, WatchHandler};
use crate::models::Script;

const SCRIPT_EXTENSION: &str = "rhai";
const LIBRARY_FOLDER_NAME: &str = "libs";

type SubjectIndex = HashMap<String, HashMap<String, Vec<u8>>>;

#[derive(Default)]
struct Index {
    scripts: SubjectIndex,
    libraries: HashMap<String, Vec<u8>>,
}

/// Script store reading from a local directory tree.
pub struct FileScriptStore {
    index: Arc<RwLock<Index>>,
    handlers: Arc<RwLock<Vec<(String, WatchHandler)>>>,
    // Dropped with the store; dropping stops the change notifications.
    _watcher: Option<RecommendedWatcher>,
}

fn walk_scripts(dir: &Path, scripts: &mut SubjectIndex) -> Result<(), StoreError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            // Library folders inside the script tree are not scripts.
            if path.file_name().is_some_and(|n| n == LIBRARY_FOLDER_NAME) {
                continue;
            }
            walk_scripts(&path, scripts)?;
        } else if path.extension().is_some_and(|e| e == SCRIPT_EXTENSION) {
            let text = std::fs::read_to_string(&path)?;
            let script = Script::parse(&text)?;

            if script.subject.is_empty() {
                return Err(StoreError::InvalidScript {
                    path: path.display().to_string(),
                    reason: "missing 'subject' header".to_string(),
                });
            }
            if script.name.is_empty() {
                return Err(StoreError::InvalidScript {
                    path: path.display().to_string(),
                    reason: "missing 'name' header".to_string(),
                });
            }

            scripts
                .entry(script.subject)
                .or_default()
                .insert(script.name, text.into_bytes());
        }
    }

    Ok(())
}

fn read_libraries(dir: &Path, libraries: &mut HashMap<String, Vec<u8>>) -> Result<(), StoreError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.extension().is_some_and(|e| e == SCRIPT_EXTENSION) {
            continue;
        }

        let text = std::fs::read_to_string(&path)?;
        let script = Script::parse(&text)?;
        let key = if script.name.is_empty() {
            path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default()
        } else {
            script.name
        };

        libraries.insert(key, script.content);
    }

    Ok(())
}

fn load_index(script_dir: &Path, library_dir: Option<&Path>) -> Result<Index, StoreError> {
    let mut index = Index::default();
    walk_scripts(script_dir, &mut index.scripts)?;
    if let Some(dir) = library_dir {
        read_libraries(dir, &mut index.libraries)?;
    }
    Ok(index)
}

/// Computes the mutation events between two script indexes.
fn diff_scripts(old: &SubjectIndex, new: &SubjectIndex) -> Vec<ScriptEvent> {
    let mut events = Vec::new();

    for (subject, names) in new {
        for (name, content) in names {
            if old.get(subject).and_then(|m| m.get(name)) != Some(content) {
                events.push(ScriptEvent {
                    subject: subject.clone(),
                    name: name.clone(),
                    content: content.clone(),
                    deleted: false,
                });
            }
        }
    }

    for (subject, names) in old {
        for name in names.keys() {
            if !new.get(subject).is_some_and(|m| m.contains_key(name)) {
                events.push(ScriptEvent {
                    subject: subject.clone(),
                    name: name.clone(),
                    content: Vec::new(),
                    deleted: true,
                });
            }
        }
    }

    events
}

impl FileScriptStore {
    /// Walks `script_dir` (and `library_dir`, when given), builds the index,
    /// and installs a filesystem watcher that keeps it current.
    pub fn new(script_dir: &str, library_dir: Option<&str>) -> Result<Self, StoreError> {
        let script_root = PathBuf::from(script_dir);
        let library_root = library_dir.map(PathBuf::from);

        let index = load_index(&script_root, library_root.as_deref())?;
        info!(
            script_dir,
            subjects = index.scripts.len(),
            libraries = index.libraries.len(),
            "loaded script directory"
        );

        let index = Arc::new(RwLock::new(index));
        let handlers: Arc<RwLock<Vec<(String, WatchHandler)>>> = Arc::new(RwLock::new(Vec::new()));

        let (tx, mut rx) = mpsc::unbounded_channel::<Result<Event, notify::Error>>();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;
        watcher.watch(&script_root, RecursiveMode::Recursive)?;
        if let Some(dir) = &library_root {
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
        }

        let reload_index = Arc::clone(&index);
        let reload_handlers = Arc::clone(&handlers);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    Ok(ev)
                        if matches!(
                            ev.kind,
                            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                        ) =>
                    {
                        Self::reload(
                            &script_root,
                            library_root.as_deref(),
                            &reload_index,
                            &reload_handlers,
                        )
                        .await;
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "filesystem watch error"),
                }
            }
            debug!("filesystem watch channel closed");
        });

        Ok(FileScriptStore { index, handlers, _watcher: Some(watcher) })
    }

    /// A store over an already-built index, without a watcher. Test hook.
    #[cfg(test)]
    fn from_parts(scripts: SubjectIndex, libraries: HashMap<String, Vec<u8>>) -> Self {
        FileScriptStore {
            index: Arc::new(RwLock::new(Index { scripts, libraries })),
            handlers: Arc::new(RwLock::new(Vec::new())),
            _watcher: None,
        }
    }

    /// Re-walks the trees and swaps the index in one write-lock section, so
    /// lookups see either the old or the new state, never a mix.
    async fn reload(
        script_dir: &Path,
        library_dir: Option<&Path>,
        index: &Arc<RwLock<Index>>,
        handlers: &Arc<RwLock<Vec<(String, WatchHandler)>>>,
    ) {
        let fresh = match load_index(script_dir, library_dir) {
            Ok(fresh) => fresh,
            Err(e) => {
                // Keep serving the previous index rather than dropping it.
                error!(error = %e, "failed to reload script directory");
                return;
            }
        };

        let events = {
            let mut guard = index.write().await;
            let events = diff_scripts(&guard.scripts, &fresh.scripts);
            *guard = fresh;
            events
        };

        if events.is_empty() {
            return;
        }

        debug!(count = events.len(), "script directory changed");
        let handlers = handlers.read().await;
        for event in events {
            for (subject, handler) in handlers.iter() {
                if subject == &event.subject || subject == ">" {
                    handler(event.clone());
                }
            }
        }
    }
}

#[async_trait]
impl ScriptStore for FileScriptStore {
    async fn add_script(
        &self,
        subject: &str,
        name: &str,
        content: &[u8],
    ) -> Result<(), StoreError> {
        let mut guard = self.index.write().await;
        guard
            .scripts
            .entry(subject.to_string())
            .or_default()
            .insert(name.to_string(), content.to_vec());
        Ok(())
    }

    async fn delete_script(&self, subject: &str, name: &str) -> Result<(), StoreError> {
        let mut guard = self.index.write().await;
        if let Some(names) = guard.scripts.get_mut(subject) {
            names.remove(name);
            if names.is_empty() {
                guard.scripts.remove(subject);
            }
        }
        Ok(())
    }

    async fn get_scripts(&self, subject: &str) -> Result<HashMap<String, Vec<u8>>, StoreError> {
        let guard = self.index.read().await;
        Ok(guard.scripts.get(subject).cloned().unwrap_or_default())
    }

    async fn list_subjects(&self) -> Result<Vec<String>, StoreError> {
        let guard = self.index.read().await;
        let mut subjects: Vec<String> = guard.scripts.keys().cloned().collect();
        subjects.sort();
        Ok(subjects)
    }

    async fn watch(&self, subject: &str, handler: WatchHandler) -> Result<(), StoreError> {
        // Initial synthetic event so callers can prime their state.
        handler(ScriptEvent {
            subject: subject.to_string(),
            name: String::new(),
            content: Vec::new(),
            deleted: false,
        });

        self.handlers.write().await.push((subject.to_string(), handler));
        Ok(())
    }

    async fn load_libraries(&self, keys: &[String]) -> Result<Vec<Vec<u8>>, StoreError> {
        let guard = self.index.read().await;
        let mut libraries = Vec::with_capacity(keys.len());
        for key in keys {
            match guard.libraries.get(key) {
                Some(content) => libraries.push(content.clone()),
                None => return Err(StoreError::MissingLibrary(key.clone())),
            }
        }
        Ok(libraries)
    }

    async fn add_library(&self, path: &str, content: &[u8]) -> Result<(), StoreError> {
        self.index.write().await.libraries.insert(path.to_string(), content.to_vec());
        Ok(())
    }

    async fn remove_library(&self, path: &str) -> Result<(), StoreError> {
        self.index.write().await.libraries.remove(path);
        Ok(())
    }

    async fn take_lock(&self, _path: &str) -> Result<bool, StoreError> {
        // No cross-process contention in local mode.
        Ok(true)
    }

    async fn release_lock(&self, _path: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn write_script(dir: &Path, file: &str, subject: &str, name: &str, body: &str) {
        let text = format!("--* subject: {subject}\n--* name: {name}\n{body}");
        std::fs::write(dir.join(file), text).unwrap();
    }

    #[tokio::test]
    async fn indexes_scripts_by_subject() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "echo.rhai", "funcs.echo", "e1", "let x = 1;");
        write_script(dir.path(), "other.rhai", "funcs.echo", "e2", "let y = 2;");
        write_script(dir.path(), "page.rhai", "funcs.page", "p1", "let z = 3;");

        let store = FileScriptStore::new(dir.path().to_str().unwrap(), None).unwrap();

        let scripts = store.get_scripts("funcs.echo").await.unwrap();
        assert_eq!(scripts.len(), 2);
        assert!(scripts.contains_key("e1"));
        assert!(scripts.contains_key("e2"));

        let mut subjects = store.list_subjects().await.unwrap();
        subjects.sort();
        assert_eq!(subjects, vec!["funcs.echo", "funcs.page"]);
    }

    #[tokio::test]
    async fn unknown_subject_yields_an_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileScriptStore::new(dir.path().to_str().unwrap(), None).unwrap();
        assert!(store.get_scripts("funcs.none").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scripts_inside_a_libs_folder_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "echo.rhai", "funcs.echo", "e1", "let x = 1;");
        let libs = dir.path().join(LIBRARY_FOLDER_NAME);
        std::fs::create_dir(&libs).unwrap();
        std::fs::write(libs.join("util.rhai"), "fn helper() { 1 }").unwrap();

        let store = FileScriptStore::new(dir.path().to_str().unwrap(), None).unwrap();
        assert_eq!(store.list_subjects().await.unwrap(), vec!["funcs.echo"]);
    }

    #[tokio::test]
    async fn missing_subject_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.rhai"), "--* name: x\nbody").unwrap();

        let err = FileScriptStore::new(dir.path().to_str().unwrap(), None).unwrap_err();
        assert!(matches!(err, StoreError::InvalidScript { .. }));
    }

    #[tokio::test]
    async fn libraries_load_in_order_with_duplicates() {
        let scripts_dir = tempfile::tempdir().unwrap();
        let libs_dir = tempfile::tempdir().unwrap();
        std::fs::write(libs_dir.path().join("strings.rhai"), "fn upper(s) { s }").unwrap();

        let store = FileScriptStore::new(
            scripts_dir.path().to_str().unwrap(),
            Some(libs_dir.path().to_str().unwrap()),
        )
        .unwrap();

        let keys = vec!["strings".to_string(), "strings".to_string()];
        let libs = store.load_libraries(&keys).await.unwrap();
        assert_eq!(libs.len(), 2);
        assert_eq!(libs[0], libs[1]);
    }

    #[tokio::test]
    async fn missing_library_fails_the_whole_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileScriptStore::new(dir.path().to_str().unwrap(), None).unwrap();

        let keys = vec!["absent".to_string()];
        let err = store.load_libraries(&keys).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingLibrary(k) if k == "absent"));
    }

    #[tokio::test]
    async fn locks_always_succeed_locally() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileScriptStore::new(dir.path().to_str().unwrap(), None).unwrap();
        assert!(store.take_lock("e1").await.unwrap());
        store.release_lock("e1").await.unwrap();
    }

    #[tokio::test]
    async fn watch_emits_the_initial_synthetic_event() {
        let store = FileScriptStore::from_parts(HashMap::new(), HashMap::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);

        store
            .watch(
                "funcs.echo",
                Box::new(move |event| {
                    assert_eq!(event.subject, "funcs.echo");
                    assert!(!event.deleted);
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn diff_reports_adds_changes_and_removals() {
        let mut old: SubjectIndex = HashMap::new();
        old.entry("s".to_string()).or_default().insert("kept".to_string(), b"same".to_vec());
        old.entry("s".to_string()).or_default().insert("changed".to_string(), b"v1".to_vec());
        old.entry("s".to_string()).or_default().insert("removed".to_string(), b"gone".to_vec());

        let mut new: SubjectIndex = HashMap::new();
        new.entry("s".to_string()).or_default().insert("kept".to_string(), b"same".to_vec());
        new.entry("s".to_string()).or_default().insert("changed".to_string(), b"v2".to_vec());
        new.entry("s".to_string()).or_default().insert("added".to_string(), b"new".to_vec());

        let events = diff_scripts(&old, &new);
        assert_eq!(events.len(), 3);
        assert!(events.iter().any(|e| e.name == "changed" && !e.deleted && e.content == b"v2"));
        assert!(events.iter().any(|e| e.name == "added" && !e.deleted));
        assert!(events.iter().any(|e| e.name == "removed" && e.deleted));
    }
}
