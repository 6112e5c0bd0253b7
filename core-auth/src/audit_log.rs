//! Bounded, persisted audit trail of auth-state changes.

use crate::error::{AuthError, Result};
use bridge_traits::{storage::KeyValueStore, time::Clock};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

/// Default number of retained entries.
pub const DEFAULT_AUDIT_LOG_CAPACITY: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub data: Value,
}

/// FIFO buffer of the last `capacity` entries, stored as one JSON array.
pub struct AuditLog {
    store: Arc<dyn KeyValueStore>,
    key: String,
    capacity: usize,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        key: impl Into<String>,
        capacity: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            capacity: capacity.max(1),
            clock,
            write_lock: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an entry, evicting the oldest ones beyond capacity.
    pub async fn append(&self, event: &str, data: Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut entries = self.entries().await;
        entries.push(AuditEntry {
            timestamp: self.clock.now(),
            event: event.to_string(),
            data,
        });
        if entries.len() > self.capacity {
            let excess = entries.len() - self.capacity;
            entries.drain(..excess);
        }

        let raw = serde_json::to_string(&entries)
            .map_err(|e| AuthError::Validation(format!("Failed to serialize audit log: {}", e)))?;
        self.store
            .set_string(&self.key, &raw)
            .await
            .map_err(AuthError::from_storage)
    }

    /// Entries oldest first. Missing or corrupt data reads as empty.
    pub async fn entries(&self) -> Vec<AuditEntry> {
        let raw = match self.store.get_string(&self.key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(error = %e, "Failed to read audit log");
                return Vec::new();
            }
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!(error = %e, "Discarding corrupt audit log");
            Vec::new()
        })
    }

    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store
            .delete(&self.key)
            .await
            .map_err(AuthError::from_storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_desktop::MemoryKeyValueStore;
    use bridge_traits::time::ManualClock;
    use serde_json::json;

    fn audit_log(capacity: usize) -> (AuditLog, MemoryKeyValueStore) {
        let kv = MemoryKeyValueStore::new_origin();
        let log = AuditLog::new(
            Arc::new(kv.clone()),
            "test:auth_audit_log",
            capacity,
            Arc::new(ManualClock::default()),
        );
        (log, kv)
    }

    #[tokio::test]
    async fn test_append_evicts_oldest_beyond_capacity() {
        let (log, _) = audit_log(DEFAULT_AUDIT_LOG_CAPACITY);
        for i in 0..=DEFAULT_AUDIT_LOG_CAPACITY {
            log.append("LOGIN_SUCCESS", json!({ "seq": i })).await.unwrap();
        }

        let entries = log.entries().await;
        assert_eq!(entries.len(), DEFAULT_AUDIT_LOG_CAPACITY);
        assert_eq!(entries[0].data, json!({ "seq": 1 }));
        assert_eq!(
            entries.last().unwrap().data,
            json!({ "seq": DEFAULT_AUDIT_LOG_CAPACITY })
        );
    }

    #[tokio::test]
    async fn test_corrupt_log_reads_as_empty_and_is_replaced() {
        let (log, kv) = audit_log(5);
        kv.set_string("test:auth_audit_log", "{{{").await.unwrap();
        assert!(log.entries().await.is_empty());

        log.append("LOGOUT", json!({ "reason": "USER_INITIATED" }))
            .await
            .unwrap();
        let entries = log.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, "LOGOUT");
    }

    #[tokio::test]
    async fn test_clear() {
        let (log, kv) = audit_log(5);
        log.append("PASSWORD_CHANGED", json!({})).await.unwrap();
        log.clear().await.unwrap();
        assert!(log.entries().await.is_empty());
        assert!(!kv.has_key("test:auth_audit_log").await.unwrap());
    }
}
