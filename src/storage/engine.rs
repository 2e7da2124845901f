//! Append-only storage engine
//!
//! Records are appended to `data.db` as line-delimited JSON and located
//! through an in-memory id→offset index. Deletes are tombstones: the index
//! entry disappears, the bytes stay until compaction. Point lookups run
//! through the document cache, then the bloom filter, then the index.
//!
//! ## Files under the data directory
//! - `data.db` — append-only records, one JSON line each
//! - `index.bin` — atomic snapshot of the id→offset map
//! - `access.log` — looked-up ids, replayed as a cache-warmup hint
//! - `storage.lock` — advisory lock

use super::snapshot;
use crate::bloom::BloomFilter;
use crate::cache::{CacheStats, DocumentCache};
use crate::lock::{LockFile, LockGuard};
use crate::{Document, Result, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub(super) const DATA_FILE: &str = "data.db";
pub(super) const ACCESS_LOG_FILE: &str = "access.log";
const LOCK_FILE: &str = "storage.lock";

/// Expected live documents when sizing the bloom filter
const BLOOM_EXPECTED_ITEMS: usize = 1_000_000;
/// Target bloom false-positive rate
const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;

/// Initial block size for point reads; doubled until a newline is found
const READ_BLOCK_SIZE: usize = 8 * 1024;

/// Index mutations between automatic snapshot writes
const INDEX_SNAPSHOT_INTERVAL: u64 = 1000;

/// Primary index: document id to byte offset of its latest record
pub(super) type OffsetIndex = HashMap<String, u64, ahash::RandomState>;

/// Ids deleted since the last compaction
pub(super) type TombstoneSet = HashSet<String, ahash::RandomState>;

/// On-disk record wrapping a document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev")]
    pub rev: String,
    pub data: Document,
}

/// Append-only document storage with an in-memory primary index
pub struct StorageEngine {
    pub(super) data_dir: PathBuf,

    /// id → offset of the latest record in `data.db`
    pub(super) index: OffsetIndex,

    /// Deleted ids, suppressed from lookup and iteration
    pub(super) tombstones: TombstoneSet,

    /// Admission filter; contains every id ever written this run
    pub(super) bloom: BloomFilter,

    /// Hot-document cache
    pub(super) cache: DocumentCache,

    /// Advisory lock file
    pub(super) lock: LockFile,

    /// Index mutations since the last snapshot write
    pub(super) writes_since_snapshot: u64,
}

impl StorageEngine {
    /// Open (or create) the engine rooted at `data_dir`.
    ///
    /// Loads the index snapshot, rebuilds the bloom filter from the indexed
    /// ids, and warms the cache from the access log.
    pub fn open<P: AsRef<Path>>(data_dir: P, cache_capacity: usize) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let lock = LockFile::open(data_dir.join(LOCK_FILE))?;
        let index = snapshot::load_index(&data_dir)?;

        // Ensure the data file exists even before the first write.
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(data_dir.join(DATA_FILE))?;

        let mut bloom = BloomFilter::new(BLOOM_EXPECTED_ITEMS, BLOOM_FALSE_POSITIVE_RATE);
        for id in index.keys() {
            bloom.add(id.as_bytes());
        }

        let engine = Self {
            data_dir,
            index,
            tombstones: TombstoneSet::default(),
            bloom,
            cache: DocumentCache::new(cache_capacity),
            lock,
            writes_since_snapshot: 0,
        };
        engine.warm_cache(cache_capacity);
        Ok(engine)
    }

    /// Durably append a record for `id` and update index, bloom and cache.
    pub fn write(&mut self, id: &str, document: Document) -> Result<()> {
        let _guard = self.lock.exclusive()?;

        let record = Record {
            id: id.to_string(),
            rev: fresh_revision(),
            data: document,
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let data_path = self.data_dir.join(DATA_FILE);
        let mut file = OpenOptions::new().append(true).open(&data_path)?;
        let pos = file.metadata()?.len();
        file.write_all(line.as_bytes())?;

        self.index.insert(record.id.clone(), pos);
        self.tombstones.remove(&record.id);
        self.bloom.add(record.id.as_bytes());
        self.cache.insert(record.id, record.data);

        self.writes_since_snapshot += 1;
        if self.writes_since_snapshot >= INDEX_SNAPSHOT_INTERVAL {
            snapshot::persist_index(&self.data_dir, &self.index)?;
            self.writes_since_snapshot = 0;
        }
        Ok(())
    }

    /// Point lookup: cache, then bloom filter, then index, then data file.
    pub fn get(&self, id: &str) -> Result<Option<Document>> {
        if let Some(document) = self.cache.get(id) {
            return Ok(Some(document));
        }

        let _guard = self.lock.shared()?;

        if !self.bloom.might_contain(id.as_bytes()) {
            return Ok(None);
        }
        let offset = match self.index.get(id) {
            Some(offset) => *offset,
            None => return Ok(None),
        };

        let record = match self.read_record_at(offset)? {
            Some(record) => record,
            None => return Ok(None),
        };

        self.log_access(id);
        self.cache.insert(id.to_string(), record.data.clone());
        Ok(Some(record.data))
    }

    /// Tombstone `id`: drop it from index and cache, persist the index
    /// snapshot immediately. The record bytes stay until compaction and the
    /// bloom filter keeps the bit pattern.
    pub fn delete(&mut self, id: &str) -> Result<()> {
        let _guard = self.lock.exclusive()?;

        self.tombstones.insert(id.to_string());
        self.cache.remove(id);
        self.index.remove(id);

        snapshot::persist_index(&self.data_dir, &self.index)?;
        self.writes_since_snapshot = 0;
        Ok(())
    }

    /// Stream live documents in file order (earliest write first).
    ///
    /// Tombstoned ids are skipped, and so are superseded records: a line is
    /// yielded only when its offset is the one the live index holds for its
    /// id, so each id appears at most once.
    pub fn iterate(&self) -> Result<DocumentIter<'_>> {
        let guard = self.lock.shared()?;
        let file = File::open(self.data_dir.join(DATA_FILE))?;
        Ok(DocumentIter {
            _guard: guard,
            reader: BufReader::new(file),
            pos: 0,
            index: &self.index,
            tombstones: &self.tombstones,
            done: false,
        })
    }

    /// Number of live documents
    pub fn live_count(&self) -> usize {
        self.index.len()
    }

    /// Cache hit/miss statistics
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // Internal helpers

    /// Read the record starting at `offset`. The first read covers a fixed
    /// block; if no newline shows up the block is doubled, so records larger
    /// than the initial block are still read whole. Returns `None` when the
    /// line fails to decode.
    fn read_record_at(&self, offset: u64) -> Result<Option<Record>> {
        let mut file = File::open(self.data_dir.join(DATA_FILE))?;
        let mut block = READ_BLOCK_SIZE;

        loop {
            file.seek(SeekFrom::Start(offset))?;
            let mut buf = Vec::with_capacity(block);
            std::io::Read::by_ref(&mut file).take(block as u64).read_to_end(&mut buf)?;
            let eof = buf.len() < block;

            if let Some(newline) = buf.iter().position(|&b| b == b'\n') {
                buf.truncate(newline);
            } else if !eof {
                block *= 2;
                continue;
            }

            return match serde_json::from_slice::<Record>(&buf) {
                Ok(record) => Ok(Some(record)),
                Err(err) => {
                    log::warn!(
                        "undecodable record at offset {} in {}: {}",
                        offset,
                        self.data_dir.join(DATA_FILE).display(),
                        err
                    );
                    Ok(None)
                }
            };
        }
    }

    /// Best-effort append of a looked-up id to the access log.
    fn log_access(&self, id: &str) {
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.data_dir.join(ACCESS_LOG_FILE))
            .and_then(|mut file| writeln!(file, "{}", id));
        if let Err(err) = result {
            log::warn!("failed to record access for {:?}: {}", id, err);
        }
    }

    /// Resolve the most recently looked-up ids from the access log and
    /// preload them, oldest first so the newest end up most recently used.
    fn warm_cache(&self, limit: usize) {
        let path = self.data_dir.join(ACCESS_LOG_FILE);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(_) => return, // no trace yet
        };

        let ids: Vec<String> = BufReader::new(file)
            .lines()
            .map_while(|line| line.ok())
            .filter(|line| !line.is_empty())
            .collect();
        let tail = ids.len().saturating_sub(limit);

        for id in &ids[tail..] {
            let offset = match self.index.get(id) {
                Some(offset) => *offset,
                None => continue,
            };
            match self.read_record_at(offset) {
                Ok(Some(record)) => self.cache.insert(id.clone(), record.data),
                Ok(None) => {}
                Err(err) => {
                    log::warn!("cache warmup stopped at {:?}: {}", id, err);
                    return;
                }
            }
        }
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        // Snapshot whatever the periodic interval has not covered yet.
        if self.writes_since_snapshot > 0 {
            if let Err(err) = snapshot::persist_index(&self.data_dir, &self.index) {
                log::error!("index snapshot on drop failed: {}", err);
            }
        }
    }
}

/// Revision tag: short opaque hash of a time-derived, salted seed.
/// Uniqueness is best-effort and nothing relies on it.
fn fresh_revision() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let salt: u64 = rand::random();
    format!("{:08x}", crc32fast::hash(format!("{}-{}", nanos, salt).as_bytes()))
}

/// Lazy cursor over live records in `data.db`
pub struct DocumentIter<'a> {
    _guard: LockGuard<'a>,
    reader: BufReader<File>,
    pos: u64,
    index: &'a OffsetIndex,
    tombstones: &'a TombstoneSet,
    done: bool,
}

impl Iterator for DocumentIter<'_> {
    type Item = Result<(String, Document)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut line = String::new();
        loop {
            line.clear();
            let read = match self.reader.read_line(&mut line) {
                Ok(read) => read,
                Err(err) => {
                    self.done = true;
                    return Some(Err(StoreError::Io(err)));
                }
            };
            if read == 0 {
                self.done = true;
                return None;
            }
            let line_start = self.pos;
            self.pos += read as u64;

            let record = match serde_json::from_str::<Record>(line.trim_end()) {
                Ok(record) => record,
                Err(err) => {
                    log::warn!("skipping undecodable data line at offset {}: {}", line_start, err);
                    continue;
                }
            };
            if self.tombstones.contains(&record.id) {
                continue;
            }
            if self.index.get(&record.id) != Some(&line_start) {
                continue; // superseded by a later write
            }
            return Some(Ok((record.id, record.data)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn doc(v: i64) -> Document {
        let mut d = Document::new();
        d.insert("v".to_string(), json!(v));
        d
    }

    fn open(dir: &TempDir) -> StorageEngine {
        StorageEngine::open(dir.path().join("data"), 100).unwrap()
    }

    #[test]
    fn test_write_then_get() {
        let dir = TempDir::new().unwrap();
        let mut engine = open(&dir);

        engine.write("a", doc(1)).unwrap();
        assert_eq!(engine.get("a").unwrap(), Some(doc(1)));
        assert_eq!(engine.get("missing").unwrap(), None);
    }

    #[test]
    fn test_overwrite_last_writer_wins() {
        let dir = TempDir::new().unwrap();
        let mut engine = open(&dir);

        engine.write("k", doc(1)).unwrap();
        engine.write("k", doc(2)).unwrap();
        assert_eq!(engine.get("k").unwrap(), Some(doc(2)));
        assert_eq!(engine.live_count(), 1);
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let mut engine = open(&dir);

        engine.write("a", doc(1)).unwrap();
        engine.delete("a").unwrap();
        assert_eq!(engine.get("a").unwrap(), None);
        assert_eq!(engine.live_count(), 0);

        // Deleting an absent id is a no-op.
        engine.delete("never-written").unwrap();
    }

    #[test]
    fn test_reinsert_after_delete() {
        let dir = TempDir::new().unwrap();
        let mut engine = open(&dir);

        engine.write("a", doc(1)).unwrap();
        engine.delete("a").unwrap();
        engine.write("a", doc(2)).unwrap();
        assert_eq!(engine.get("a").unwrap(), Some(doc(2)));

        let pairs: Vec<(String, Document)> =
            engine.iterate().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(pairs, vec![("a".to_string(), doc(2))]);
    }

    #[test]
    fn test_iterate_file_order_and_dedup() {
        let dir = TempDir::new().unwrap();
        let mut engine = open(&dir);

        engine.write("a", doc(1)).unwrap();
        engine.write("b", doc(2)).unwrap();
        engine.write("a", doc(3)).unwrap(); // supersedes the first "a"
        engine.write("c", doc(4)).unwrap();
        engine.delete("b").unwrap();

        let pairs: Vec<(String, Document)> =
            engine.iterate().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(
            pairs,
            vec![("a".to_string(), doc(3)), ("c".to_string(), doc(4))]
        );
    }

    #[test]
    fn test_record_encoding_fields() {
        let dir = TempDir::new().unwrap();
        let mut engine = open(&dir);
        engine.write("a", doc(1)).unwrap();

        let content =
            std::fs::read_to_string(dir.path().join("data").join(DATA_FILE)).unwrap();
        let line = content.lines().next().unwrap();
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(value["_id"], "a");
        assert!(value["_rev"].is_string());
        assert_eq!(value["data"]["v"], 1);
    }

    #[test]
    fn test_large_document_read_grows_past_block() {
        let dir = TempDir::new().unwrap();
        let mut engine = open(&dir);

        let mut big = Document::new();
        big.insert("blob".to_string(), json!("x".repeat(3 * READ_BLOCK_SIZE)));
        engine.write("small", doc(1)).unwrap();
        engine.write("big", big.clone()).unwrap();
        engine.write("after", doc(2)).unwrap();

        assert_eq!(engine.get("big").unwrap(), Some(big));
        assert_eq!(engine.get("after").unwrap(), Some(doc(2)));
    }

    #[test]
    fn test_index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut engine = open(&dir);
            for i in 0..10 {
                engine.write(&format!("d{}", i), doc(i)).unwrap();
            }
            // Dropped here; the index snapshot is persisted on drop.
        }

        let engine = open(&dir);
        for i in 0..10 {
            assert_eq!(engine.get(&format!("d{}", i)).unwrap(), Some(doc(i)));
        }
        assert_eq!(engine.live_count(), 10);
    }

    #[test]
    fn test_cache_warmup_from_access_log() {
        let dir = TempDir::new().unwrap();
        {
            let mut engine = open(&dir);
            engine.write("hot", doc(42)).unwrap();
            engine.write("cold", doc(7)).unwrap();
            // A disk-path lookup records the id in the access log.
            engine.cache.remove("hot");
            assert_eq!(engine.get("hot").unwrap(), Some(doc(42)));
        }

        let engine = open(&dir);
        assert_eq!(engine.get("hot").unwrap(), Some(doc(42)));
        // The warmed entry was served from cache.
        assert_eq!(engine.cache_stats().hits, 1);
    }

    #[test]
    fn test_corrupt_data_line_skipped_in_iteration() {
        let dir = TempDir::new().unwrap();
        let data_path = dir.path().join("data").join(DATA_FILE);
        let mut engine = open(&dir);

        engine.write("a", doc(1)).unwrap();
        let good_len = std::fs::metadata(&data_path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&data_path).unwrap();
            file.write_all(b"{ not json }\n").unwrap();
        }
        // Rebuild with the index pointing past the corrupt line.
        engine.write("b", doc(2)).unwrap();
        assert!(engine.index["b"] > good_len);

        let pairs: Vec<(String, Document)> =
            engine.iterate().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(
            pairs,
            vec![("a".to_string(), doc(1)), ("b".to_string(), doc(2))]
        );
    }

    #[test]
    fn test_bloom_rejects_unknown_ids() {
        let dir = TempDir::new().unwrap();
        let mut engine = open(&dir);
        for i in 0..100 {
            engine.write(&format!("known_{}", i), doc(i)).unwrap();
        }
        for i in 0..100 {
            assert_eq!(engine.get(&format!("unknown_{}", i)).unwrap(), None);
        }
    }
}
