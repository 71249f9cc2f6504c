//! Shared buffer store for received files.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Concurrency-safe map from transfer identifier to received bytes.
///
/// Cloning the store clones the handle; all clones write into the same map.
/// The lock is only held for the map operation itself.
#[derive(Debug, Clone, Default)]
pub struct BufferStore {
    inner: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl BufferStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts `bytes` under `key`. A later put for the same key wins.
    pub fn put(&self, key: impl Into<String>, bytes: Vec<u8>) {
        let key = key.into();
        let size = bytes.len();
        let replaced = self.lock().insert(key.clone(), bytes).is_some();
        debug!(key = %key, size, replaced, "Stored received file");
    }

    /// Returns a copy of the whole map as it is right now.
    pub fn snapshot(&self) -> HashMap<String, Vec<u8>> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
