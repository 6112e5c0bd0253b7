//! Storage Abstractions
//!
//! Provides the durable, origin-scoped key-value store that holds session
//! state, and the observer trait through which the core learns about writes
//! made by *other* handles on the same origin (other tabs, other processes).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Durable key-value storage trait
///
/// Abstracts origin-scoped string storage:
/// - Web: localStorage
/// - Desktop: SQLite database shared by every process of the same profile
/// - Tests: in-memory map
///
/// Values are opaque strings; callers serialise structured data themselves.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::KeyValueStore;
///
/// async fn remember_email(store: &dyn KeyValueStore, email: &str) -> Result<()> {
///     store.set_string("smart_check:last_email", email).await?;
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Store a string value, replacing any previous value
    async fn set_string(&self, key: &str, value: &str) -> Result<()>;

    /// Retrieve a string value
    ///
    /// # Returns
    ///
    /// Returns `Ok(None)` if the key doesn't exist.
    async fn get_string(&self, key: &str) -> Result<Option<String>>;

    /// Delete a value
    ///
    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check if a key exists
    async fn has_key(&self, key: &str) -> Result<bool> {
        Ok(self.get_string(key).await?.is_some())
    }

    /// List all keys
    async fn list_keys(&self) -> Result<Vec<String>>;

    /// Clear every key in the store
    async fn clear_all(&self) -> Result<()>;
}

/// A single change made to the store by another handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageChange {
    /// Changed key, or `None` when the whole store was cleared
    pub key: Option<String>,
    /// Value before the change
    pub old_value: Option<String>,
    /// Value after the change (`None` means the key was removed)
    pub new_value: Option<String>,
}

impl StorageChange {
    pub fn new(
        key: impl Into<String>,
        old_value: Option<String>,
        new_value: Option<String>,
    ) -> Self {
        Self {
            key: Some(key.into()),
            old_value,
            new_value,
        }
    }

    /// A change describing `clear_all()`.
    pub fn cleared() -> Self {
        Self {
            key: None,
            old_value: None,
            new_value: None,
        }
    }

    /// True if this change concerns `key` (a clear concerns every key).
    pub fn affects(&self, key: &str) -> bool {
        match &self.key {
            Some(k) => k == key,
            None => true,
        }
    }

    /// The key was absent before and holds a value now.
    pub fn is_added(&self) -> bool {
        self.old_value.is_none() && self.new_value.is_some()
    }

    /// The key held a value before and is absent now.
    pub fn is_removed(&self) -> bool {
        self.key.is_none() || (self.old_value.is_some() && self.new_value.is_none())
    }
}

/// External storage change observer
///
/// Mirrors the browser `storage` event: a subscriber only sees writes made
/// through *other* handles of the same origin, never its own.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::StorageObserver;
///
/// async fn watch(observer: &dyn StorageObserver) -> Result<()> {
///     let mut stream = observer.subscribe_changes().await?;
///     while let Some(change) = stream.next().await {
///         println!("{:?} changed", change.key);
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait StorageObserver: Send + Sync {
    /// Subscribe to changes made by other handles
    async fn subscribe_changes(&self) -> Result<Box<dyn StorageChangeStream>>;
}

/// Stream of external storage changes
#[async_trait]
pub trait StorageChangeStream: Send {
    /// Get the next change
    ///
    /// Returns `None` when the stream is closed.
    async fn next(&mut self) -> Option<StorageChange>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_change_classification() {
        let added = StorageChange::new("token", None, Some("abc".to_string()));
        assert!(added.is_added());
        assert!(!added.is_removed());
        assert!(added.affects("token"));
        assert!(!added.affects("user"));

        let removed = StorageChange::new("token", Some("abc".to_string()), None);
        assert!(removed.is_removed());
        assert!(!removed.is_added());

        let replaced = StorageChange::new("token", Some("a".to_string()), Some("b".to_string()));
        assert!(!replaced.is_added());
        assert!(!replaced.is_removed());
    }

    #[test]
    fn test_cleared_affects_every_key() {
        let cleared = StorageChange::cleared();
        assert!(cleared.affects("anything"));
        assert!(cleared.is_removed());
    }
}
