//! Vellum Document Store
//!
//! Embedded, append-only document store for read-heavy workloads on a
//! single host. Opaque document payloads are keyed by caller-supplied ids
//! and made crash-consistent by a write-ahead log replayed on startup.
//!
//! ## Architecture
//! - Durability: segmented, checksummed WAL with rotation and replay
//! - Storage: append-only data file + in-memory primary index + tombstones
//! - Read path: document cache → bloom admission filter → index → data file
//! - Coordination: OS advisory file locks, one lock file per component
//!
//! ## Example
//! ```no_run
//! use vellum::{Database, Document};
//! use serde_json::json;
//!
//! let mut db = Database::open("/tmp/my-store")?;
//! let mut doc = Document::new();
//! doc.insert("title".to_string(), json!("hello"));
//! db.put("note:1", doc)?;
//! db.commit()?;
//! assert!(db.get("note:1")?.is_some());
//! # Ok::<(), vellum::StoreError>(())
//! ```

pub mod bloom;
pub mod cache;
pub mod config;
pub mod database;
pub mod lock;
pub mod storage;
pub mod wal;

mod error;

pub use bloom::BloomFilter;
pub use cache::{CacheStats, DocumentCache};
pub use config::{DbConfig, WalConfig};
pub use database::Database;
pub use error::{Result, StoreError};
pub use storage::{DocumentIter, Record, StorageEngine};
pub use wal::{Wal, WalEntry, WalOp};

/// Opaque document payload: a nested key/value tree with string keys.
/// The store never inspects the fields.
pub type Document = serde_json::Map<String, serde_json::Value>;
