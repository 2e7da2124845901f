//! Index snapshot persistence
//!
//! The id→offset map is serialized to `index.bin` by writing a temporary
//! file, fsyncing it, and renaming it over the old snapshot. The rename is
//! the atomic commit point; the parent directory is fsynced afterwards so
//! the rename itself survives a crash.

use super::engine::OffsetIndex;
use crate::Result;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

pub(super) const INDEX_FILE: &str = "index.bin";

/// Atomically replace the on-disk snapshot with `index`.
pub(super) fn persist_index(data_dir: &Path, index: &OffsetIndex) -> Result<()> {
    let tmp_path = data_dir.join(format!("{}.tmp", INDEX_FILE));

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)?;
    let mut writer = BufWriter::new(file);
    bincode::serialize_into(&mut writer, index)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;

    fs::rename(&tmp_path, data_dir.join(INDEX_FILE))?;
    sync_dir(data_dir)?;
    Ok(())
}

/// Load the snapshot if one exists. A snapshot that fails to decode is
/// treated as absent: the WAL replay that follows restores the state the
/// snapshot would have carried.
pub(super) fn load_index(data_dir: &Path) -> Result<OffsetIndex> {
    let path = data_dir.join(INDEX_FILE);
    if !path.exists() {
        return Ok(OffsetIndex::default());
    }

    let file = File::open(&path)?;
    match bincode::deserialize_from(std::io::BufReader::new(file)) {
        Ok(index) => Ok(index),
        Err(err) => {
            log::warn!(
                "discarding undecodable index snapshot {}: {}",
                path.display(),
                err
            );
            Ok(OffsetIndex::default())
        }
    }
}

/// Fsync a directory so a rename inside it is durable.
#[cfg(unix)]
pub(super) fn sync_dir(dir: &Path) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let handle = File::open(dir)?;
    let rc = unsafe { libc::fsync(handle.as_raw_fd()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(not(unix))]
pub(super) fn sync_dir(_dir: &Path) -> Result<()> {
    // Directory fsync is not available; the file-level syncs above are the
    // best the platform offers.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_persist_and_load() {
        let dir = TempDir::new().unwrap();
        let mut index = OffsetIndex::default();
        index.insert("a".to_string(), 0);
        index.insert("b".to_string(), 137);

        persist_index(dir.path(), &index).unwrap();
        let loaded = load_index(dir.path()).unwrap();
        assert_eq!(loaded, index);
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(load_index(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_load_corrupt_is_empty() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(INDEX_FILE), b"\xff\xfe not bincode").unwrap();
        assert!(load_index(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_persist_overwrites() {
        let dir = TempDir::new().unwrap();
        let mut index = OffsetIndex::default();
        index.insert("a".to_string(), 1);
        persist_index(dir.path(), &index).unwrap();

        index.insert("b".to_string(), 2);
        index.remove("a");
        persist_index(dir.path(), &index).unwrap();

        let loaded = load_index(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get("b"), Some(&2));
    }
}
