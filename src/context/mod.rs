//! Context resolution and template substitution
//!
//! Contexts are named data sources made available to templates and
//! validation rules:
//! - `inline` - literal data, template-substituted with the contexts defined
//!   before it
//! - `file` - a JSON file parsed at resolution time
//! - `directory` - one key per file, loaded lazily (see [`LazyDirectory`])

mod directory;
mod template;

pub use directory::LazyDirectory;
pub use template::{TemplateRenderer, replace_templates};

use serde_json::Value;

use crate::models::ContextEntry;
use crate::validation::{Activation, EvalError};

/// Context resolution errors
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse JSON from {path}: {source}")]
    InvalidJson {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid key: {0}. Path separators and relative paths are not allowed.")]
    InvalidKey(String),

    #[error("Path traversal detected: {0}")]
    PathTraversal(String),

    #[error("Key not found: {0}")]
    MissingKey(String),

    #[error("Template activation was not initialised")]
    NotInitialised,

    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// A resolved context value
#[derive(Debug)]
pub enum ContextValue {
    Value(Value),
    Directory(LazyDirectory),
}

impl ContextValue {
    /// Plain JSON form; directories are fully loaded
    pub fn materialize(&self) -> Result<Value, ContextError> {
        match self {
            ContextValue::Value(value) => Ok(value.clone()),
            ContextValue::Directory(dir) => dir.materialize().map(Value::Object),
        }
    }
}

/// Ordered map of context name to value
#[derive(Debug, Default)]
pub struct ContextMap {
    entries: Vec<(String, ContextValue)>,
}

impl ContextMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a context
    pub fn insert(&mut self, name: impl Into<String>, value: ContextValue) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ContextValue> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every context as `(name, JSON value)`, loading directories
    pub fn materialize(&self) -> Result<Vec<(&str, Value)>, ContextError> {
        self.entries
            .iter()
            .map(|(name, value)| Ok((name.as_str(), value.materialize()?)))
            .collect()
    }

    /// Activation with every context bound by name
    pub fn to_activation(&self) -> Result<Activation, ContextError> {
        let mut activation = Activation::new();
        for (name, value) in self.materialize()? {
            activation.insert(name, &value);
        }
        Ok(activation)
    }
}

/// Resolve context definitions in order.
///
/// Inline data may reference contexts defined earlier in the list.
pub fn resolve_contexts(entries: &[ContextEntry]) -> Result<ContextMap, ContextError> {
    let mut contexts = ContextMap::new();

    for entry in entries {
        let value = match entry {
            ContextEntry::File { path, .. } => {
                let contents = std::fs::read_to_string(path).map_err(|source| ContextError::Io {
                    path: path.clone(),
                    source,
                })?;
                let parsed = serde_json::from_str(&contents).map_err(|source| {
                    ContextError::InvalidJson {
                        path: path.clone(),
                        source,
                    }
                })?;
                ContextValue::Value(parsed)
            }
            ContextEntry::Inline { data, .. } => {
                ContextValue::Value(replace_templates(data, &contexts)?)
            }
            ContextEntry::Directory { path, .. } => {
                ContextValue::Directory(LazyDirectory::open(path)?)
            }
        };
        tracing::debug!("Resolved context '{}'", entry.name());
        contexts.insert(entry.name(), value);
    }

    Ok(contexts)
}
