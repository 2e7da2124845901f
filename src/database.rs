//! Database façade
//!
//! Composes the write-ahead log and the storage engine behind a small
//! put/get/delete/iterate surface. Mutations are queued in a pending batch
//! and logged to the WAL as they arrive; `commit` applies the batch to
//! storage in submission order and flushes the WAL. Construction replays
//! surviving WAL entries so committed-but-unapplied state is recovered.
//!
//! Reads see the pending batch: a queued PUT is returned and a queued
//! DELETE hides the stored document, so `put` followed by `get` observes
//! the written value even before the batch commits.

use crate::config::DbConfig;
use crate::lock::{LockFile, LockGuard};
use crate::storage::{DocumentIter, StorageEngine};
use crate::wal::{Wal, WalOp};
use crate::{Document, Result, StoreError};
use std::path::{Path, PathBuf};

const DB_LOCK_FILE: &str = "db.lock";
const WAL_BASE_FILE: &str = "wal.log";
const DATA_DIR: &str = "data";

/// A queued, not-yet-applied mutation
enum BatchOp {
    Put { id: String, document: Document },
    Delete { id: String },
}

/// Embedded document store handle
pub struct Database {
    config: DbConfig,
    wal: Wal,
    storage: StorageEngine,

    /// Operations queued since the last commit, in submission order
    pending: Vec<BatchOp>,

    /// Commit automatically when the batch reaches `config.max_batch_size`;
    /// suspended while an explicit batch is open
    auto_commit: bool,

    /// An explicit batch holds the exclusive database lock until `end_batch`
    batch_open: bool,

    lock: LockFile,
    path: PathBuf,
}

impl Database {
    /// Open (or create) a store at `path` with default configuration,
    /// replaying any surviving WAL entries.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, DbConfig::default())
    }

    /// Open (or create) a store at `path`.
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: DbConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let lock = LockFile::open(path.join(DB_LOCK_FILE))?;
        let storage = StorageEngine::open(path.join(DATA_DIR), config.cache_capacity)?;
        let wal = Wal::open(path.join(WAL_BASE_FILE), config.wal.clone())?;

        let auto_commit = config.auto_commit;
        let mut db = Self {
            config,
            wal,
            storage,
            pending: Vec::new(),
            auto_commit,
            batch_open: false,
            lock,
            path,
        };
        db.recover()?;
        Ok(db)
    }

    /// Queue a PUT for `id` and log it to the WAL. Commits the batch when
    /// auto-commit is on and the batch threshold is reached.
    pub fn put(&mut self, id: &str, document: Document) -> Result<()> {
        validate_id(id)?;
        let _guard = op_guard(&self.lock, self.batch_open)?;

        self.wal.log(WalOp::Put, id, Some(&document))?;
        self.pending.push(BatchOp::Put {
            id: id.to_string(),
            document,
        });
        if self.auto_commit && self.pending.len() >= self.config.max_batch_size {
            commit_batch(&mut self.pending, &mut self.storage, &mut self.wal, &self.config)?;
        }
        Ok(())
    }

    /// Queue a DELETE for `id` and log it to the WAL. Commits the batch when
    /// auto-commit is on and the batch threshold is reached.
    pub fn delete(&mut self, id: &str) -> Result<()> {
        validate_id(id)?;
        let _guard = op_guard(&self.lock, self.batch_open)?;

        self.wal.log(WalOp::Delete, id, None)?;
        self.pending.push(BatchOp::Delete { id: id.to_string() });
        if self.auto_commit && self.pending.len() >= self.config.max_batch_size {
            commit_batch(&mut self.pending, &mut self.storage, &mut self.wal, &self.config)?;
        }
        Ok(())
    }

    /// Look up `id`, observing the pending batch first, then storage.
    pub fn get(&self, id: &str) -> Result<Option<Document>> {
        validate_id(id)?;
        let _guard = if self.batch_open {
            None
        } else {
            Some(self.lock.shared()?)
        };

        for op in self.pending.iter().rev() {
            match op {
                BatchOp::Put { id: queued, document } if queued == id => {
                    return Ok(Some(document.clone()));
                }
                BatchOp::Delete { id: queued } if queued == id => return Ok(None),
                _ => {}
            }
        }
        self.storage.get(id)
    }

    /// Stream committed live documents in file order. Pending operations are
    /// not reflected until they commit.
    pub fn iterate(&self) -> Result<DocumentIter<'_>> {
        self.storage.iterate()
    }

    /// Apply the pending batch to storage in submission order and flush the
    /// WAL. On a storage failure the batch is cleared before the error is
    /// surfaced; the database stays usable.
    pub fn commit(&mut self) -> Result<()> {
        let _guard = op_guard(&self.lock, self.batch_open)?;
        commit_batch(&mut self.pending, &mut self.storage, &mut self.wal, &self.config)
    }

    /// Open an explicit batch: acquire the exclusive database lock and
    /// suspend auto-commit until `end_batch`. A no-op if a batch is already
    /// open.
    pub fn begin_batch(&mut self) -> Result<()> {
        if self.batch_open {
            return Ok(());
        }
        self.lock.acquire_exclusive()?;
        self.batch_open = true;
        self.auto_commit = false;
        Ok(())
    }

    /// Commit the open batch, restore auto-commit and release the exclusive
    /// lock. The lock is released even when the commit fails.
    pub fn end_batch(&mut self) -> Result<()> {
        if !self.batch_open {
            return Ok(());
        }
        let commit_result =
            commit_batch(&mut self.pending, &mut self.storage, &mut self.wal, &self.config);
        self.batch_open = false;
        self.auto_commit = self.config.auto_commit;
        let release_result = self.lock.release();
        commit_result?;
        release_result
    }

    /// Rewrite the data file keeping only live records.
    pub fn compact(&mut self) -> Result<()> {
        let _guard = op_guard(&self.lock, self.batch_open)?;
        self.storage.compact()
    }

    /// Filesystem root of this store
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay surviving WAL entries into storage. Torn entries were already
    /// skipped by the replay cursor; any remaining failure is unrecoverable.
    fn recover(&mut self) -> Result<()> {
        let _guard = self.lock.exclusive()?;

        let mut applied = 0usize;
        for entry in self.wal.replay()? {
            let entry =
                entry.map_err(|err| StoreError::Recovery(format!("WAL replay: {}", err)))?;
            let result = match entry.operation {
                WalOp::Put => self
                    .storage
                    .write(&entry.id, entry.data.unwrap_or_default()),
                WalOp::Delete => self.storage.delete(&entry.id),
            };
            result.map_err(|err| {
                StoreError::Recovery(format!(
                    "replaying {:?} for {:?}: {}",
                    entry.operation, entry.id, err
                ))
            })?;
            applied += 1;
        }
        if applied > 0 {
            log::info!(
                "recovered {} WAL entr{} at {}",
                applied,
                if applied == 1 { "y" } else { "ies" },
                self.path.display()
            );
        }
        Ok(())
    }
}

fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(StoreError::InvalidDocumentId(
            "document id must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Exclusive per-operation lock, skipped while an explicit batch already
/// holds the descriptor (re-locking would release the batch lock when the
/// guard drops).
fn op_guard(lock: &LockFile, batch_open: bool) -> Result<Option<LockGuard<'_>>> {
    if batch_open {
        Ok(None)
    } else {
        Ok(Some(lock.exclusive()?))
    }
}

/// Apply the pending operations to storage in submission order, flush the
/// WAL, then compact opportunistically. The batch is taken (cleared) before
/// the first application, so a mid-batch failure leaves the database usable
/// with an empty batch.
fn commit_batch(
    pending: &mut Vec<BatchOp>,
    storage: &mut StorageEngine,
    wal: &mut Wal,
    config: &DbConfig,
) -> Result<()> {
    if pending.is_empty() && wal.pending_len() == 0 {
        return Ok(());
    }

    let ops = std::mem::take(pending);
    for op in ops {
        match op {
            BatchOp::Put { id, document } => storage.write(&id, document)?,
            BatchOp::Delete { id } => storage.delete(&id)?,
        }
    }
    wal.flush()?;

    if let Some(threshold) = config.compaction_threshold {
        if storage.needs_compaction(threshold)? {
            storage.compact()?;
        }
    }
    Ok(())
}
