//! Shared Provided Data
//!
//! Values produced by completed workflows (e.g. `discovered_ports`).
//! Every access goes through one mutex; workers only ever receive
//! copies taken with [`ProvidedData::snapshot`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;

/// Concurrency-safe key/value store shared across workflow tasks.
#[derive(Debug, Clone, Default)]
pub struct ProvidedData {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl ProvidedData {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Immutable copy of the current contents.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.lock().clone()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        debug!("Provided data: {} = {}", key, value);
        self.lock().insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
