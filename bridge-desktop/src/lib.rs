//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop hosts
//! (macOS, Windows, Linux) and for tests.
//!
//! ## Overview
//!
//! - `HttpClient` using `reqwest`
//! - `KeyValueStore` backed by SQLite (`SqliteKeyValueStore`) or memory
//!   (`MemoryKeyValueStore`, which can open several "tabs" on one origin)
//! - `StorageObserver` via per-tab memory channels or interval polling
//!   (`PollingStorageObserver`) for processes sharing an SQLite file
//! - `LifecycleObserver` as always-foreground no-op, or host-driven through
//!   `ChannelLifecycleObserver`
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{ReqwestHttpClient, SqliteKeyValueStore};
//!
//! #[tokio::main]
//! async fn main() -> bridge_traits::error::Result<()> {
//!     let http_client = ReqwestHttpClient::new();
//!     let storage = SqliteKeyValueStore::in_data_dir("smart-check").await?;
//!
//!     // Use in core configuration
//!     Ok(())
//! }
//! ```

mod background;
mod http;
mod kv_store;
mod memory;
mod polling;

pub use background::{ChannelLifecycleObserver, DesktopLifecycleObserver};
pub use http::ReqwestHttpClient;
pub use kv_store::{SqliteKeyValueStore, DEFAULT_DB_FILE};
pub use memory::MemoryKeyValueStore;
pub use polling::{PollingStorageObserver, WatchSet};
