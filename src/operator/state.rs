//! Shared operator state
//!
//! Per-key handler locks and the set of pods currently being monitored.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// `namespace/name`
pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// One async mutex per object key. Handlers for the same key run one at a
/// time; different keys never contend.
#[derive(Clone, Default)]
pub struct LockTable {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(key.to_string()).or_default().clone()
        };
        mutex.lock_owned().await
    }

    /// Drop the mutex for `key` if nobody holds or waits on it
    pub fn remove(&self, key: &str) {
        let mut locks = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(key)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            locks.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pods with a running monitor task
#[derive(Clone, Default)]
pub struct MonitorRegistry {
    inner: Arc<RwLock<HashSet<String>>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `key`. Returns `None` when it is already tracked;
    /// otherwise a guard that stops tracking when dropped.
    pub fn track(&self, key: &str) -> Option<MonitorGuard> {
        let mut active = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if !active.insert(key.to_string()) {
            return None;
        }
        Some(MonitorGuard {
            registry: self.clone(),
            key: key.to_string(),
        })
    }

    pub fn is_tracked(&self, key: &str) -> bool {
        let active = self.inner.read().unwrap_or_else(|e| e.into_inner());
        active.contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: &str) {
        let mut active = self.inner.write().unwrap_or_else(|e| e.into_inner());
        active.remove(key);
    }
}

/// Releases a tracked pod on drop
pub struct MonitorGuard {
    registry: MonitorRegistry,
    key: String,
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}
