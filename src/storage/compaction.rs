//! Data-file compaction
//!
//! Overwrites and deletes leave dead bytes in the append-only data file.
//! Compaction streams the file once, copies only live records (those whose
//! offset the index still points at) into a new file in the same order, and
//! atomically renames it over the old one. The index is rewritten to the
//! new offsets and the tombstone set is cleared: every record the
//! tombstones suppressed is gone from the file.

use super::engine::{OffsetIndex, Record, StorageEngine, DATA_FILE};
use super::snapshot;
use crate::Result;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};

impl StorageEngine {
    /// Fraction of the data file occupied by dead bytes (superseded records,
    /// deleted records, undecodable lines). 0.0 for an empty file.
    pub fn dead_ratio(&self) -> Result<f64> {
        let data_path = self.data_dir.join(DATA_FILE);
        let total = fs::metadata(&data_path)?.len();
        if total == 0 {
            return Ok(0.0);
        }

        let mut live: u64 = 0;
        let mut pos: u64 = 0;
        let mut reader = BufReader::new(File::open(&data_path)?);
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line)?;
            if read == 0 {
                break;
            }
            if let Ok(record) = serde_json::from_str::<Record>(line.trim_end()) {
                if self.index.get(&record.id) == Some(&pos) {
                    live += read as u64;
                }
            }
            pos += read as u64;
        }
        Ok(1.0 - live as f64 / total as f64)
    }

    /// Whether the dead-byte ratio has reached `threshold`.
    pub fn needs_compaction(&self, threshold: f64) -> Result<bool> {
        Ok(self.dead_ratio()? >= threshold)
    }

    /// Rewrite the data file keeping only live records.
    ///
    /// The new file is fully written and synced before an atomic rename
    /// replaces the old one, so a crash mid-compaction leaves the original
    /// file intact. The index snapshot is persisted immediately after the
    /// swap.
    pub fn compact(&mut self) -> Result<()> {
        let _guard = self.lock.exclusive()?;

        let data_path = self.data_dir.join(DATA_FILE);
        let tmp_path = self.data_dir.join(format!("{}.compact", DATA_FILE));
        let old_size = fs::metadata(&data_path)?.len();

        let mut new_index = OffsetIndex::default();
        let mut new_pos: u64 = 0;
        {
            let mut reader = BufReader::new(File::open(&data_path)?);
            let out = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut writer = BufWriter::new(out);

            let mut pos: u64 = 0;
            let mut line = String::new();
            loop {
                line.clear();
                let read = reader.read_line(&mut line)?;
                if read == 0 {
                    break;
                }
                if let Ok(record) = serde_json::from_str::<Record>(line.trim_end()) {
                    if self.index.get(&record.id) == Some(&pos) {
                        writer.write_all(line.as_bytes())?;
                        new_index.insert(record.id, new_pos);
                        new_pos += read as u64;
                    }
                }
                pos += read as u64;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        fs::rename(&tmp_path, &data_path)?;
        snapshot::sync_dir(&self.data_dir)?;

        self.index = new_index;
        self.tombstones.clear();
        snapshot::persist_index(&self.data_dir, &self.index)?;
        self.writes_since_snapshot = 0;

        log::info!(
            "compacted {}: {} -> {} bytes, {} live record(s)",
            data_path.display(),
            old_size,
            new_pos,
            self.index.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Document;
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
    fn test_dead_ratio() {
        let dir = TempDir::new().unwrap();
        let mut engine = open(&dir);

        engine.write("a", doc(1)).unwrap();
        assert_eq!(engine.dead_ratio().unwrap(), 0.0);

        engine.write("a", doc(2)).unwrap();
        let ratio = engine.dead_ratio().unwrap();
        assert!(ratio > 0.4 && ratio < 0.6, "unexpected ratio {}", ratio);
    }

    #[test]
    fn test_compact_reclaims_space_and_preserves_reads() {
        let dir = TempDir::new().unwrap();
        let data_path = dir.path().join("data").join(DATA_FILE);
        let mut engine = open(&dir);

        for i in 0..10 {
            engine.write(&format!("d{}", i), doc(i)).unwrap();
        }
        for i in 0..10 {
            engine.write(&format!("d{}", i), doc(i * 100)).unwrap();
        }
        engine.delete("d9").unwrap();

        let before = fs::metadata(&data_path).unwrap().len();
        assert!(engine.needs_compaction(0.5).unwrap());
        engine.compact().unwrap();
        let after = fs::metadata(&data_path).unwrap().len();
        assert!(after < before);
        assert_eq!(engine.dead_ratio().unwrap(), 0.0);

        for i in 0..9 {
            assert_eq!(engine.get(&format!("d{}", i)).unwrap(), Some(doc(i * 100)));
        }
        assert_eq!(engine.get("d9").unwrap(), None);

        let pairs: Vec<(String, Document)> =
            engine.iterate().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(pairs.len(), 9);
    }

    #[test]
    fn test_compact_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut engine = open(&dir);
            engine.write("keep", doc(1)).unwrap();
            engine.write("drop", doc(2)).unwrap();
            engine.delete("drop").unwrap();
            engine.compact().unwrap();
        }

        let engine = open(&dir);
        assert_eq!(engine.get("keep").unwrap(), Some(doc(1)));
        assert_eq!(engine.get("drop").unwrap(), None);
    }
}
