//! Polling storage observer
//!
//! Detects writes made by other processes sharing the same durable store
//! (typically an SQLite file) by snapshotting the watched keys on an
//! interval and emitting the differences.
//!
//! The observer is also a write-through [`KeyValueStore`] decorator: writes
//! made through it update the snapshot in the same critical section, so the
//! local process never observes its own writes.

use async_trait::async_trait;
use bridge_traits::{
    error::Result,
    storage::{KeyValueStore, StorageChange, StorageChangeStream, StorageObserver},
};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CHANGE_BUFFER_SIZE: usize = 64;

/// Which keys a [`PollingStorageObserver`] watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchSet {
    /// An explicit list of keys
    Keys(Vec<String>),
    /// Every key starting with the prefix
    Prefix(String),
}

impl WatchSet {
    pub fn contains(&self, key: &str) -> bool {
        match self {
            WatchSet::Keys(keys) => keys.iter().any(|k| k == key),
            WatchSet::Prefix(prefix) => key.starts_with(prefix.as_str()),
        }
    }
}

type Snapshot = HashMap<String, String>;

struct PollingInner {
    store: Arc<dyn KeyValueStore>,
    watch: WatchSet,
    interval: Duration,
    snapshot: AsyncMutex<Option<Snapshot>>,
    changes: broadcast::Sender<StorageChange>,
    poller: Mutex<Option<CancellationToken>>,
}

impl Drop for PollingInner {
    fn drop(&mut self) {
        if let Some(token) = self.poller.get_mut().ok().and_then(|p| p.take()) {
            token.cancel();
        }
    }
}

impl PollingInner {
    /// Read every watched key that currently holds a value.
    ///
    /// Returns `None` if the store could not be read; the poll is skipped so
    /// a transient failure is not mistaken for a removal.
    async fn read_all(&self) -> Option<Snapshot> {
        let keys = match &self.watch {
            WatchSet::Keys(keys) => keys.clone(),
            WatchSet::Prefix(prefix) => match self.store.list_keys().await {
                Ok(keys) => keys.into_iter().filter(|k| k.starts_with(prefix.as_str())).collect(),
                Err(e) => {
                    warn!(error = %e, "Failed to list keys while polling");
                    return None;
                }
            },
        };

        let mut values = HashMap::with_capacity(keys.len());
        for key in keys {
            match self.store.get_string(&key).await {
                Ok(Some(value)) => {
                    values.insert(key, value);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to read watched key");
                    return None;
                }
            }
        }
        Some(values)
    }

    async fn poll_once(&self) -> usize {
        let mut guard = self.snapshot.lock().await;
        let Some(current) = self.read_all().await else {
            return 0;
        };

        let Some(previous) = guard.as_ref() else {
            *guard = Some(current);
            return 0;
        };

        let keys: BTreeSet<&String> = previous.keys().chain(current.keys()).collect();
        let mut emitted = 0;
        for key in keys {
            let old_value = previous.get(key);
            let new_value = current.get(key);
            if old_value != new_value {
                let _ = self.changes.send(StorageChange::new(
                    key.as_str(),
                    old_value.cloned(),
                    new_value.cloned(),
                ));
                emitted += 1;
            }
        }
        *guard = Some(current);

        if emitted > 0 {
            debug!(emitted, "Detected external storage changes");
        }
        emitted
    }
}

/// Interval-based [`StorageObserver`] over any [`KeyValueStore`]
pub struct PollingStorageObserver {
    inner: Arc<PollingInner>,
}

impl PollingStorageObserver {
    /// Watch `keys` in `store`, polling every `interval`.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        keys: impl IntoIterator<Item = impl Into<String>>,
        interval: Duration,
    ) -> Self {
        Self::with_watch_set(
            store,
            WatchSet::Keys(keys.into_iter().map(Into::into).collect()),
            interval,
        )
    }

    /// Watch every key under `prefix` in `store`, polling every `interval`.
    pub fn with_prefix(
        store: Arc<dyn KeyValueStore>,
        prefix: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self::with_watch_set(store, WatchSet::Prefix(prefix.into()), interval)
    }

    pub fn with_watch_set(store: Arc<dyn KeyValueStore>, watch: WatchSet, interval: Duration) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER_SIZE);
        Self {
            inner: Arc::new(PollingInner {
                store,
                watch,
                interval,
                snapshot: AsyncMutex::new(None),
                changes,
                poller: Mutex::new(None),
            }),
        }
    }

    pub fn watch_set(&self) -> &WatchSet {
        &self.inner.watch
    }

    /// Poll immediately, returning the number of changes emitted.
    ///
    /// The first poll only records the baseline.
    pub async fn poll_now(&self) -> usize {
        self.inner.poll_once().await
    }

    fn ensure_polling(&self) {
        let mut poller = self.inner.poller.lock().unwrap_or_else(|e| e.into_inner());
        if poller.is_some() {
            return;
        }

        let token = CancellationToken::new();
        *poller = Some(token.clone());

        let weak: Weak<PollingInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.interval;
        tokio::spawn(async move {
            debug!(interval_ms = interval.as_millis() as u64, "Storage polling started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.poll_once().await;
                    }
                }
            }
            debug!("Storage polling stopped");
        });
    }
}

#[async_trait]
impl KeyValueStore for PollingStorageObserver {
    async fn set_string(&self, key: &str, value: &str) -> Result<()> {
        if !self.inner.watch.contains(key) {
            return self.inner.store.set_string(key, value).await;
        }
        // Hold the snapshot lock so a concurrent poll cannot see this write
        // before it is recorded.
        let mut guard = self.inner.snapshot.lock().await;
        self.inner.store.set_string(key, value).await?;
        if let Some(snapshot) = guard.as_mut() {
            snapshot.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        self.inner.store.get_string(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if !self.inner.watch.contains(key) {
            return self.inner.store.delete(key).await;
        }
        let mut guard = self.inner.snapshot.lock().await;
        self.inner.store.delete(key).await?;
        if let Some(snapshot) = guard.as_mut() {
            snapshot.remove(key);
        }
        Ok(())
    }

    async fn has_key(&self, key: &str) -> Result<bool> {
        self.inner.store.has_key(key).await
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        self.inner.store.list_keys().await
    }

    async fn clear_all(&self) -> Result<()> {
        let mut guard = self.inner.snapshot.lock().await;
        self.inner.store.clear_all().await?;
        if let Some(snapshot) = guard.as_mut() {
            snapshot.clear();
        }
        Ok(())
    }
}

#[async_trait]
impl StorageObserver for PollingStorageObserver {
    async fn subscribe_changes(&self) -> Result<Box<dyn StorageChangeStream>> {
        let receiver = self.inner.changes.subscribe();
        {
            let mut guard = self.inner.snapshot.lock().await;
            if guard.is_none() {
                *guard = self.inner.read_all().await;
            }
        }
        self.ensure_polling();
        Ok(Box::new(PollingChangeStream { receiver }))
    }
}

struct PollingChangeStream {
    receiver: broadcast::Receiver<StorageChange>,
}

#[async_trait]
impl StorageChangeStream for PollingChangeStream {
    async fn next(&mut self) -> Option<StorageChange> {
        loop {
            match self.receiver.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Polled storage change stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryKeyValueStore;

    fn observer_over(store: &MemoryKeyValueStore) -> PollingStorageObserver {
        PollingStorageObserver::new(
            Arc::new(store.clone()),
            ["token", "user"],
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn test_external_write_is_detected() {
        let shared = MemoryKeyValueStore::new_origin();
        let observer = observer_over(&shared);
        let mut changes = observer.subscribe_changes().await.unwrap();

        // Another process writes directly to the shared store.
        shared.open_tab().set_string("token", "abc").await.unwrap();
        assert_eq!(observer.poll_now().await, 1);

        let change = changes.next().await.unwrap();
        assert_eq!(change.key.as_deref(), Some("token"));
        assert!(change.is_added());
    }

    #[tokio::test]
    async fn test_local_writes_are_not_reported() {
        let shared = MemoryKeyValueStore::new_origin();
        let observer = observer_over(&shared);
        let _changes = observer.subscribe_changes().await.unwrap();

        observer.set_string("token", "mine").await.unwrap();
        observer.delete("user").await.unwrap();
        observer.clear_all().await.unwrap();

        assert_eq!(observer.poll_now().await, 0);
    }

    #[tokio::test]
    async fn test_unwatched_keys_are_ignored() {
        let shared = MemoryKeyValueStore::new_origin();
        let observer = observer_over(&shared);
        let _changes = observer.subscribe_changes().await.unwrap();

        shared.set_string("theme", "dark").await.unwrap();
        assert_eq!(observer.poll_now().await, 0);
        assert!(observer.watch_set().contains("token"));
        assert!(!observer.watch_set().contains("theme"));
    }

    #[tokio::test]
    async fn test_prefix_watch_detects_new_and_removed_keys() {
        let shared = MemoryKeyValueStore::new_origin();
        shared.set_string("app:old", "1").await.unwrap();

        let observer = PollingStorageObserver::with_prefix(
            Arc::new(shared.clone()),
            "app:",
            Duration::from_secs(2),
        );
        let mut changes = observer.subscribe_changes().await.unwrap();

        shared.delete("app:old").await.unwrap();
        shared.set_string("app:new", "2").await.unwrap();
        shared.set_string("other:key", "3").await.unwrap();
        assert_eq!(observer.poll_now().await, 2);

        // Keys are diffed in sorted order.
        let first = changes.next().await.unwrap();
        assert_eq!(first.key.as_deref(), Some("app:new"));
        assert!(first.is_added());
        let second = changes.next().await.unwrap();
        assert_eq!(second.key.as_deref(), Some("app:old"));
        assert!(second.is_removed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_polling_emits_removal() {
        let shared = MemoryKeyValueStore::new_origin();
        shared.set_string("user", "{}").await.unwrap();

        let observer = observer_over(&shared);
        let mut changes = observer.subscribe_changes().await.unwrap();

        shared.delete("user").await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;

        let change = changes.next().await.unwrap();
        assert_eq!(change.key.as_deref(), Some("user"));
        assert!(change.is_removed());
    }
}
