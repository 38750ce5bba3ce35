//! Login token persistence.
//!
//! The login routines keep the resume token in a [`Storage`] under the key
//! `"{endpoint}__login_token__"`. [`MemoryStorage`] is the default; plug a
//! persistent implementation in with
//! [`ClientBuilder::storage`](crate::ClientBuilder::storage).

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::Result;

// ============================================================================
// Storage
// ============================================================================

/// Async key/value store for credentials.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Returns the value under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Stores `value` under `key`.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Removes `key`. Missing keys are not an error.
    async fn del(&self, key: &str) -> Result<()>;
}

// ============================================================================
// MemoryStorage
// ============================================================================

/// Process-local [`Storage`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<FxHashMap<String, String>>,
}

impl MemoryStorage {
    /// Creates an empty store.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if nothing is stored.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_del() {
        let storage = MemoryStorage::new();
        assert!(storage.is_empty());

        storage.set("k", "v").await.expect("set");
        assert_eq!(storage.get("k").await.expect("get"), Some("v".to_string()));
        assert_eq!(storage.len(), 1);

        storage.del("k").await.expect("del");
        storage.del("k").await.expect("del missing");
        assert_eq!(storage.get("k").await.expect("get"), None);
    }
}
