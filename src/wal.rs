//! Write-Ahead Logging
//!
//! Every mutation is logged before it is applied to the data file, so that
//! startup replay can reconstruct committed state after a crash.
//!
//! The log is a sequence of numbered segment files `<base>.<N>`. Entries
//! accumulate in memory and are flushed as one line-delimited JSON batch per
//! flush. Each entry carries a checksum so that torn or corrupted batches
//! are detected and skipped during replay instead of aborting recovery.

use crate::config::WalConfig;
use crate::lock::LockFile;
use crate::{Document, Result, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Logged operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WalOp {
    Put,
    Delete,
}

impl WalOp {
    fn as_str(self) -> &'static str {
        match self {
            WalOp::Put => "PUT",
            WalOp::Delete => "DELETE",
        }
    }
}

/// One logged mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Wall-clock seconds at log time
    pub timestamp: f64,
    /// PUT or DELETE
    pub operation: WalOp,
    /// Target document id
    pub id: String,
    /// Document payload; absent for deletes
    pub data: Option<Document>,
    /// 64-bit checksum over the other fields, 16 hex digits
    pub checksum: String,
}

impl WalEntry {
    fn new(operation: WalOp, id: &str, data: Option<&Document>) -> Result<Self> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let data = data.cloned();
        let checksum = entry_checksum(timestamp, operation, id, &data)?;
        Ok(Self {
            timestamp,
            operation,
            id: id.to_string(),
            data,
            checksum,
        })
    }

    /// Recompute the checksum from the payload fields and compare it to the
    /// stored one.
    pub fn verify(&self) -> bool {
        match entry_checksum(self.timestamp, self.operation, &self.id, &self.data) {
            Ok(expected) => expected == self.checksum,
            Err(_) => false,
        }
    }
}

/// Checksum over `timestamp || operation || id || encode(data)`.
///
/// Two CRC32 values (payload, reversed payload) packed into a u64 and
/// rendered as 16 lower-hex digits. The algorithm is part of the on-disk
/// format and must not change.
fn entry_checksum(
    timestamp: f64,
    operation: WalOp,
    id: &str,
    data: &Option<Document>,
) -> Result<String> {
    let payload = format!(
        "{}|{}|{}|{}",
        timestamp,
        operation.as_str(),
        id,
        serde_json::to_string(data)?
    );
    let bytes = payload.as_bytes();
    let h1 = crc32fast::hash(bytes) as u64;
    let reversed: Vec<u8> = bytes.iter().rev().copied().collect();
    let h2 = crc32fast::hash(&reversed) as u64;
    Ok(format!("{:016x}", (h1 << 32) | h2))
}

/// Segmented write-ahead log
pub struct Wal {
    /// Base path; segments live at `<base>.<N>`
    base_path: PathBuf,

    config: WalConfig,

    /// Active segment number (strictly positive)
    segment_no: u64,

    /// Append handle for the active segment
    writer: BufWriter<File>,

    /// Entries logged since the last flush
    pending: Vec<WalEntry>,

    /// Advisory lock, held exclusively during flush and rotation
    lock: LockFile,
}

impl Wal {
    /// Open the log rooted at `base_path`, resuming the highest existing
    /// segment or creating segment 1.
    pub fn open<P: AsRef<Path>>(base_path: P, config: WalConfig) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        if let Some(dir) = base_path.parent() {
            fs::create_dir_all(dir)?;
        }

        let mut lock_name = base_path.as_os_str().to_owned();
        lock_name.push(".lock");
        let lock = LockFile::open(PathBuf::from(lock_name))?;

        let segment_no = live_segments(&base_path)?
            .last()
            .map(|(n, _)| *n)
            .unwrap_or(1);
        let writer = open_segment(&segment_path(&base_path, segment_no))?;

        Ok(Self {
            base_path,
            config,
            segment_no,
            writer,
            pending: Vec::new(),
            lock,
        })
    }

    /// Queue an entry. No file I/O happens until `flush`.
    pub fn log(&mut self, operation: WalOp, id: &str, data: Option<&Document>) -> Result<()> {
        self.pending.push(WalEntry::new(operation, id, data)?);
        Ok(())
    }

    /// Number of entries waiting to be flushed
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Write the pending entries as one batch line, force it to the OS and
    /// clear the pending list. Rolls to a new segment when the active one
    /// would cross the per-segment cap, and rotates the whole log when the
    /// summed segment size crosses the rotation threshold.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.exclusive()?;

        let mut line = serde_json::to_string(&self.pending)?;
        line.push('\n');

        let active_len = self.writer.get_ref().metadata()?.len();
        if active_len > 0 && active_len + line.len() as u64 > self.config.optimal_file_size {
            self.writer.flush()?;
            self.writer.get_ref().sync_data()?;
            self.segment_no += 1;
            self.writer = open_segment(&segment_path(&self.base_path, self.segment_no))?;
        }

        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.pending.clear();

        let total: u64 = live_segments(&self.base_path)?
            .iter()
            .map(|(_, path)| fs::metadata(path).map(|m| m.len()).unwrap_or(0))
            .sum();
        if total > self.config.max_log_size_mb * 1024 * 1024 {
            Self::rotate_segments(&self.base_path, &mut self.segment_no, &mut self.writer)?;
        }
        Ok(())
    }

    /// Archive every live segment and restart the log at segment 1.
    pub fn rotate(&mut self) -> Result<()> {
        let _guard = self.lock.exclusive()?;
        Self::rotate_segments(&self.base_path, &mut self.segment_no, &mut self.writer)
    }

    /// Takes the fields it touches instead of `&mut self` so callers can
    /// hold the lock guard (which borrows `self.lock`) across the call.
    fn rotate_segments(
        base_path: &Path,
        segment_no: &mut u64,
        writer: &mut BufWriter<File>,
    ) -> Result<()> {
        writer.flush()?;
        writer.get_ref().sync_data()?;

        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let segments = live_segments(base_path)?;
        for (_, path) in &segments {
            let mut archived = path.as_os_str().to_owned();
            archived.push(format!(".{}.old", epoch));
            fs::rename(path, PathBuf::from(archived))?;
        }
        log::info!(
            "rotated WAL at {}: archived {} segment(s)",
            base_path.display(),
            segments.len()
        );

        *segment_no = 1;
        *writer = open_segment(&segment_path(base_path, 1))?;
        Ok(())
    }

    /// Lazily yield every entry from every live segment, oldest first.
    /// Torn or corrupted lines and entries failing their checksum are
    /// skipped; an unreadable segment is fatal.
    pub fn replay(&self) -> Result<WalReplay> {
        let segments = live_segments(&self.base_path)?
            .into_iter()
            .map(|(_, path)| path)
            .collect();
        Ok(WalReplay {
            segments,
            reader: None,
            queue: VecDeque::new(),
            failed: false,
        })
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        // Persist anything still pending so replay can recover it.
        if let Err(err) = self.flush() {
            log::error!("WAL flush on drop failed: {}", err);
        }
    }
}

/// Cursor over live segments, yielding checksum-verified entries
pub struct WalReplay {
    segments: VecDeque<PathBuf>,
    reader: Option<(PathBuf, BufReader<File>)>,
    queue: VecDeque<WalEntry>,
    failed: bool,
}

impl Iterator for WalReplay {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(entry) = self.queue.pop_front() {
                return Some(Ok(entry));
            }

            if self.reader.is_none() {
                let path = self.segments.pop_front()?;
                match File::open(&path) {
                    Ok(file) => self.reader = Some((path, BufReader::new(file))),
                    Err(err) => {
                        self.failed = true;
                        return Some(Err(StoreError::Io(err)));
                    }
                }
            }

            let (path, reader) = self.reader.as_mut()?;
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) => {
                    self.reader = None;
                    continue;
                }
                Ok(_) => {}
                Err(err) => {
                    self.failed = true;
                    return Some(Err(StoreError::Io(err)));
                }
            }
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<Vec<WalEntry>>(&line) {
                Ok(batch) => {
                    for entry in batch {
                        if entry.verify() {
                            self.queue.push_back(entry);
                        } else {
                            log::warn!(
                                "WAL replay: checksum mismatch for id {:?} in {}, skipping entry",
                                entry.id,
                                path.display()
                            );
                        }
                    }
                }
                Err(err) => {
                    log::warn!(
                        "WAL replay: undecodable batch line in {}, skipping: {}",
                        path.display(),
                        err
                    );
                }
            }
        }
    }
}

fn segment_path(base: &Path, n: u64) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{}", n));
    PathBuf::from(name)
}

fn open_segment(path: &Path) -> Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

/// Live (non-archived) segments next to `base`, sorted by segment number.
/// Archived `<base>.<N>.<epoch>.old` files do not match because their suffix
/// is not a bare integer.
fn live_segments(base: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let dir = base.parent().map(Path::to_path_buf).unwrap_or_default();
    let prefix = match base.file_name() {
        Some(name) => {
            let mut p = name.to_os_string();
            p.push(".");
            p.to_string_lossy().into_owned()
        }
        None => return Err(StoreError::Corruption(format!(
            "WAL base path has no file name: {}",
            base.display()
        ))),
    };

    let mut segments = Vec::new();
    for dirent in fs::read_dir(&dir)? {
        let dirent = dirent?;
        let name = dirent.file_name().to_string_lossy().into_owned();
        if let Some(suffix) = name.strip_prefix(&prefix) {
            if let Ok(n) = suffix.parse::<u64>() {
                segments.push((n, dirent.path()));
            }
        }
    }
    segments.sort_by_key(|(n, _)| *n);
    Ok(segments)
}
