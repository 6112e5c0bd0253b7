//! Key-Value Storage using SQLite

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::KeyValueStore,
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    Row,
};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::OnceCell;
use tracing::debug;

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS kv_store (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )
"#;

/// File name used under the data directory when no explicit path is given.
pub const DEFAULT_DB_FILE: &str = "session.db";

/// SQLite-backed key-value store implementation
///
/// Every process that opens the same database file shares one "origin".
/// Pair it with a [`PollingStorageObserver`](crate::PollingStorageObserver)
/// to hear about writes made by the other processes.
pub struct SqliteKeyValueStore {
    pool: SqlitePool,
    schema: OnceCell<()>,
}

impl SqliteKeyValueStore {
    /// Open (or create) a store at the given database path
    pub async fn new(db_path: PathBuf) -> Result<Self> {
        let store = Self::open_lazy(db_path)?;
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Open a store without touching the database yet.
    ///
    /// Connections and the schema are created on first use, inside whatever
    /// runtime performs that first operation. Usable from synchronous code.
    pub fn open_lazy(db_path: PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(BridgeError::Io)?;
        }

        // SQLite URLs use forward slashes on every platform
        let path_str = db_path.to_string_lossy().replace('\\', "/");
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path_str))
            .map_err(|e| BridgeError::StorageError(format!("Invalid DB path: {}", e)))?
            .create_if_missing(true);

        // Without idle/lifetime reaping the pool spawns no maintenance task,
        // so it can be created outside a runtime.
        let pool = SqlitePoolOptions::new()
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_lazy_with(options);
        debug!(path = ?db_path, "Opened key-value store");

        Ok(Self {
            pool,
            schema: OnceCell::new(),
        })
    }

    /// Open the store in the platform data directory
    ///
    /// Resolves to `<data_dir>/<app_dir>/session.db`, e.g.
    /// `~/.local/share/smart-check/session.db` on Linux.
    pub async fn in_data_dir(app_dir: &str) -> Result<Self> {
        Self::new(Self::default_path(app_dir)?).await
    }

    /// Default database location for `app_dir`.
    pub fn default_path(app_dir: &str) -> Result<PathBuf> {
        let base = dirs::data_local_dir()
            .or_else(dirs::data_dir)
            .ok_or_else(|| {
                BridgeError::NotAvailable("No platform data directory available".to_string())
            })?;
        Ok(Self::path_under(&base, app_dir))
    }

    fn path_under(base: &Path, app_dir: &str) -> PathBuf {
        base.join(app_dir).join(DEFAULT_DB_FILE)
    }

    /// Create an in-memory store (for testing)
    ///
    /// A single pooled connection keeps every query on the same memory DB.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| BridgeError::StorageError(format!("Failed to connect to DB: {}", e)))?;

        let store = Self {
            pool,
            schema: OnceCell::new(),
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema
            .get_or_try_init(|| async {
                sqlx::query(CREATE_TABLE)
                    .execute(&self.pool)
                    .await
                    .map(|_| ())
                    .map_err(|e| {
                        BridgeError::StorageError(format!("Failed to create table: {}", e))
                    })
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.ensure_schema().await?;
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| BridgeError::StorageError(format!("Failed to set value: {}", e)))?;

        debug!(key = key, "Stored value");
        Ok(())
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        self.ensure_schema().await?;
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BridgeError::StorageError(format!("Failed to get value: {}", e)))?;

        Ok(row.map(|row| row.get(0)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_schema().await?;
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| BridgeError::StorageError(format!("Failed to delete value: {}", e)))?;

        debug!(key = key, "Deleted value");
        Ok(())
    }

    async fn has_key(&self, key: &str) -> Result<bool> {
        self.ensure_schema().await?;
        let row = sqlx::query("SELECT 1 FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BridgeError::StorageError(format!("Failed to check key: {}", e)))?;

        Ok(row.is_some())
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        self.ensure_schema().await?;
        let rows = sqlx::query("SELECT key FROM kv_store ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BridgeError::StorageError(format!("Failed to list keys: {}", e)))?;

        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }

    async fn clear_all(&self) -> Result<()> {
        self.ensure_schema().await?;
        sqlx::query("DELETE FROM kv_store")
            .execute(&self.pool)
            .await
            .map_err(|e| BridgeError::StorageError(format!("Failed to clear store: {}", e)))?;

        debug!("Cleared key-value store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_string_operations() {
        let store = SqliteKeyValueStore::in_memory().await.unwrap();

        store.set_string("test_key", "test_value").await.unwrap();
        let value = store.get_string("test_key").await.unwrap();
        assert_eq!(value, Some("test_value".to_string()));

        store.set_string("test_key", "replaced").await.unwrap();
        assert_eq!(
            store.get_string("test_key").await.unwrap(),
            Some("replaced".to_string())
        );

        store.delete("test_key").await.unwrap();
        let value = store.get_string("test_key").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_list_keys_and_clear() {
        let store = SqliteKeyValueStore::in_memory().await.unwrap();

        store.set_string("key2", "value2").await.unwrap();
        store.set_string("key1", "value1").await.unwrap();

        let keys = store.list_keys().await.unwrap();
        assert_eq!(keys, vec!["key1", "key2"]);
        assert!(store.has_key("key1").await.unwrap());

        store.clear_all().await.unwrap();
        assert!(store.list_keys().await.unwrap().is_empty());
        assert!(!store.has_key("key1").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_backed_store_is_shared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(DEFAULT_DB_FILE);

        let first = SqliteKeyValueStore::new(path.clone()).await.unwrap();
        let second = SqliteKeyValueStore::new(path).await.unwrap();

        first.set_string("shared", "yes").await.unwrap();
        assert_eq!(
            second.get_string("shared").await.unwrap(),
            Some("yes".to_string())
        );
    }

    #[tokio::test]
    async fn test_lazy_store_creates_schema_on_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteKeyValueStore::open_lazy(dir.path().join(DEFAULT_DB_FILE)).unwrap();

        assert!(store.list_keys().await.unwrap().is_empty());
        store.set_string("k", "v").await.unwrap();
        assert_eq!(store.get_string("k").await.unwrap(), Some("v".to_string()));
    }

    #[test]
    fn test_path_under_data_dir() {
        let path = SqliteKeyValueStore::path_under(Path::new("/data"), "smart-check");
        assert_eq!(path, PathBuf::from("/data/smart-check/session.db"));
    }
}
