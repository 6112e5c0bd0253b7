//! In-memory origin with per-tab handles
//!
//! Models browser `localStorage` semantics in-process: every handle opened on
//! the same origin reads and writes one shared map, and each handle's
//! observer receives the writes made through the *other* handles only.

use async_trait::async_trait;
use bridge_traits::{
    error::Result,
    storage::{KeyValueStore, StorageChange, StorageChangeStream, StorageObserver},
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const CHANGE_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone)]
struct OriginChange {
    source_tab: u64,
    change: StorageChange,
}

struct Origin {
    data: Mutex<HashMap<String, String>>,
    changes: broadcast::Sender<OriginChange>,
    next_tab: AtomicU64,
}

impl Origin {
    fn data(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, source_tab: u64, change: StorageChange) {
        // No receivers just means no other tab is listening.
        let _ = self.changes.send(OriginChange { source_tab, change });
    }
}

/// One tab's handle onto a shared in-memory origin
///
/// # Example
///
/// ```ignore
/// let tab_a = MemoryKeyValueStore::new_origin();
/// let tab_b = tab_a.open_tab();
///
/// let mut changes = tab_b.subscribe_changes().await?;
/// tab_a.set_string("token", "abc").await?;
/// assert_eq!(changes.next().await.unwrap().key.as_deref(), Some("token"));
/// ```
#[derive(Clone)]
pub struct MemoryKeyValueStore {
    origin: Arc<Origin>,
    tab_id: u64,
}

impl MemoryKeyValueStore {
    /// Create a fresh origin and return its first tab.
    pub fn new_origin() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER_SIZE);
        let origin = Arc::new(Origin {
            data: Mutex::new(HashMap::new()),
            changes,
            next_tab: AtomicU64::new(1),
        });
        Self { origin, tab_id: 0 }
    }

    /// Open another tab on the same origin.
    pub fn open_tab(&self) -> Self {
        let tab_id = self.origin.next_tab.fetch_add(1, Ordering::Relaxed);
        debug!(tab_id, "Opened in-memory storage tab");
        Self {
            origin: Arc::clone(&self.origin),
            tab_id,
        }
    }

    pub fn tab_id(&self) -> u64 {
        self.tab_id
    }

    /// Copy of everything currently stored in the origin.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.origin.data().clone()
    }
}

impl Default for MemoryKeyValueStore {
    fn default() -> Self {
        Self::new_origin()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn set_string(&self, key: &str, value: &str) -> Result<()> {
        let old_value = self
            .origin
            .data()
            .insert(key.to_string(), value.to_string());

        if old_value.as_deref() != Some(value) {
            self.origin.publish(
                self.tab_id,
                StorageChange::new(key, old_value, Some(value.to_string())),
            );
        }
        Ok(())
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.origin.data().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let old_value = self.origin.data().remove(key);
        if old_value.is_some() {
            self.origin
                .publish(self.tab_id, StorageChange::new(key, old_value, None));
        }
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.origin.data().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn clear_all(&self) -> Result<()> {
        let had_entries = {
            let mut data = self.origin.data();
            let had_entries = !data.is_empty();
            data.clear();
            had_entries
        };
        if had_entries {
            self.origin.publish(self.tab_id, StorageChange::cleared());
        }
        Ok(())
    }
}

#[async_trait]
impl StorageObserver for MemoryKeyValueStore {
    async fn subscribe_changes(&self) -> Result<Box<dyn StorageChangeStream>> {
        Ok(Box::new(MemoryChangeStream {
            receiver: self.origin.changes.subscribe(),
            tab_id: self.tab_id,
        }))
    }
}

struct MemoryChangeStream {
    receiver: broadcast::Receiver<OriginChange>,
    tab_id: u64,
}

#[async_trait]
impl StorageChangeStream for MemoryChangeStream {
    async fn next(&mut self) -> Option<StorageChange> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.source_tab == self.tab_id => continue,
                Ok(event) => return Some(event.change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(tab_id = self.tab_id, skipped, "Storage change stream lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_tabs_share_data() {
        let tab_a = MemoryKeyValueStore::new_origin();
        let tab_b = tab_a.open_tab();

        tab_a.set_string("token", "abc").await.unwrap();
        assert_eq!(tab_b.get_string("token").await.unwrap(), Some("abc".to_string()));
        assert_ne!(tab_a.tab_id(), tab_b.tab_id());

        tab_b.delete("token").await.unwrap();
        assert!(!tab_a.has_key("token").await.unwrap());
    }

    #[tokio::test]
    async fn test_other_tab_sees_write() {
        let tab_a = MemoryKeyValueStore::new_origin();
        let tab_b = tab_a.open_tab();
        let mut changes = tab_b.subscribe_changes().await.unwrap();

        tab_a.set_string("token", "abc").await.unwrap();

        let change = changes.next().await.unwrap();
        assert_eq!(change.key.as_deref(), Some("token"));
        assert!(change.is_added());
        assert_eq!(change.new_value.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_own_writes_are_not_observed() {
        let tab_a = MemoryKeyValueStore::new_origin();
        let tab_b = tab_a.open_tab();
        let mut own = tab_a.subscribe_changes().await.unwrap();

        tab_a.set_string("mine", "1").await.unwrap();
        tab_b.set_string("theirs", "2").await.unwrap();

        let change = own.next().await.unwrap();
        assert_eq!(change.key.as_deref(), Some("theirs"));
    }

    #[tokio::test]
    async fn test_unchanged_write_is_silent() {
        let tab_a = MemoryKeyValueStore::new_origin();
        let tab_b = tab_a.open_tab();
        tab_a.set_string("k", "v").await.unwrap();

        let mut changes = tab_b.subscribe_changes().await.unwrap();
        tab_a.set_string("k", "v").await.unwrap();
        tab_a.delete("missing").await.unwrap();

        let next = timeout(Duration::from_millis(50), changes.next()).await;
        assert!(next.is_err(), "no change expected");
    }

    #[tokio::test]
    async fn test_clear_is_observed_as_keyless_change() {
        let tab_a = MemoryKeyValueStore::new_origin();
        let tab_b = tab_a.open_tab();
        tab_a.set_string("k", "v").await.unwrap();

        let mut changes = tab_b.subscribe_changes().await.unwrap();
        tab_a.clear_all().await.unwrap();

        let change = changes.next().await.unwrap();
        assert_eq!(change, StorageChange::cleared());
        assert!(tab_b.snapshot().is_empty());
    }
}
