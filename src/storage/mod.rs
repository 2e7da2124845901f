//! Storage layer
//!
//! Owns the append-only data file, the in-memory primary index, the
//! tombstone set, the bloom admission filter and the hot-document cache.

mod compaction;
mod engine;
mod snapshot;

pub use engine::{DocumentIter, Record, StorageEngine};
