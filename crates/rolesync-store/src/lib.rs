//! # rolesync store
//!
//! Durable state of the synchronizer: the action queue, the per-service
//! audit cursors and the record of failed actions.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rolesync_store::{SqliteStore, Store};
//!
//! async fn example() {
//!     let store = SqliteStore::open("sync.db").unwrap();
//!     let pending = store.load_all_pending().await.unwrap();
//! }
//! ```

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::Store;
