//! Filesystem access scoped to the invocation's working directory.
//!
//! Each interpreter invocation gets a fresh temporary directory; scripts
//! cannot reach outside it. Paths must be relative and free of `..`.

use std::path::{Component, Path, PathBuf};

use rhai::{Array, Dynamic, Module};

use super::runtime_error;

fn resolve(workdir: &Path, relative: &str) -> Result<PathBuf, Box<rhai::EvalAltResult>> {
    let path = Path::new(relative);
    if path.is_absolute()
        || path.components().any(|c| matches!(c, Component::ParentDir | Component::RootDir))
    {
        return Err(runtime_error(format!("path '{relative}' escapes the working directory")));
    }
    Ok(workdir.join(path))
}

/// Builds the `fs` module over `workdir`: `read`, `write`, `exists`,
/// `remove`, `list`.
pub fn module(workdir: &Path) -> Module {
    let mut module = Module::new();

    let read_root = workdir.to_path_buf();
    module.set_native_fn("read", move |path: &str| {
        let full = resolve(&read_root, path)?;
        std::fs::read_to_string(&full)
            .map_err(|e| runtime_error(format!("failed to read '{path}': {e}")))
    });

    let write_root = workdir.to_path_buf();
    module.set_native_fn("write", move |path: &str, contents: &str| {
        let full = resolve(&write_root, path)?;
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| runtime_error(format!("failed to create '{path}': {e}")))?;
        }
        std::fs::write(&full, contents)
            .map_err(|e| runtime_error(format!("failed to write '{path}': {e}")))?;
        Ok(())
    });

    let exists_root = workdir.to_path_buf();
    module.set_native_fn("exists", move |path: &str| Ok(resolve(&exists_root, path)?.exists()));

    let remove_root = workdir.to_path_buf();
    module.set_native_fn("remove", move |path: &str| {
        let full = resolve(&remove_root, path)?;
        std::fs::remove_file(&full)
            .map_err(|e| runtime_error(format!("failed to remove '{path}': {e}")))?;
        Ok(())
    });

    let list_root = workdir.to_path_buf();
    module.set_native_fn("list", move |path: &str| {
        let full = resolve(&list_root, path)?;
        let entries = std::fs::read_dir(&full)
            .map_err(|e| runtime_error(format!("failed to list '{path}': {e}")))?;

        let mut names = Array::new();
        for entry in entries {
            let entry = entry.map_err(|e| runtime_error(format!("failed to list '{path}': {e}")))?;
            names.push(Dynamic::from(entry.file_name().to_string_lossy().to_string()));
        }
        Ok(names)
    });

    module
}
