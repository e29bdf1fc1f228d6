//! Directory-backed context
//!
//! ConfigMap and Secret contexts are mounted into the probe pod as a
//! directory with one file per key. Files are listed up front and read on
//! first access.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use super::ContextError;

/// Lazily loaded directory of files, keyed by file name
#[derive(Debug)]
pub struct LazyDirectory {
    root: PathBuf,
    entries: RwLock<BTreeMap<String, Option<String>>>,
}

impl LazyDirectory {
    /// List the regular, non-hidden files under `root`.
    ///
    /// Kubelet mounts ConfigMaps with `..data` symlinks next to the real keys;
    /// the hidden entries are skipped.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, ContextError> {
        let root = root.as_ref().to_path_buf();
        let read_dir = std::fs::read_dir(&root).map_err(|source| ContextError::Io {
            path: root.display().to_string(),
            source,
        })?;

        let mut entries = BTreeMap::new();
        for entry in read_dir {
            let entry = entry.map_err(|source| ContextError::Io {
                path: root.display().to_string(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.path().is_file() {
                continue;
            }
            entries.insert(name, None);
        }

        tracing::debug!(
            "Opened directory context {:?} with {} files",
            root,
            entries.len()
        );

        Ok(Self {
            root,
            entries: RwLock::new(entries),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File names available in this directory
    pub fn keys(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.keys().cloned().collect()
    }

    /// Whether `key`'s contents have been read yet
    pub fn is_loaded(&self, key: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        matches!(entries.get(key), Some(Some(_)))
    }

    /// Contents of the file named `key`, read from disk on first access.
    ///
    /// Keys containing a path separator or starting with `.` are rejected, and
    /// the resolved path must stay inside the directory.
    pub fn get(&self, key: &str) -> Result<String, ContextError> {
        validate_key(key)?;

        {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            match entries.get(key) {
                None => return Err(ContextError::MissingKey(key.to_string())),
                Some(Some(contents)) => return Ok(contents.clone()),
                Some(None) => {}
            }
        }

        let path = self.resolve(key)?;
        let contents = std::fs::read_to_string(&path).map_err(|source| ContextError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), Some(contents.clone()));
        Ok(contents)
    }

    /// Load every file and return a plain map of file name to contents
    pub fn materialize(&self) -> Result<serde_json::Map<String, serde_json::Value>, ContextError> {
        let mut map = serde_json::Map::new();
        for key in self.keys() {
            let contents = self.get(&key)?;
            map.insert(key, serde_json::Value::String(contents));
        }
        Ok(map)
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, ContextError> {
        let invalid = |_| ContextError::InvalidKey(key.to_string());
        let root = self.root.canonicalize().map_err(invalid)?;
        let path = self.root.join(key).canonicalize().map_err(invalid)?;
        if path == root || !path.starts_with(&root) {
            return Err(ContextError::PathTraversal(key.to_string()));
        }
        Ok(path)
    }
}

fn validate_key(key: &str) -> Result<(), ContextError> {
    if key.is_empty() || key.contains('/') || key.contains('\\') || key.starts_with('.') {
        return Err(ContextError::InvalidKey(key.to_string()));
    }
    Ok(())
}
