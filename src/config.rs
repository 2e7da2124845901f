//! Store configuration
//!
//! Provides configuration for the database façade and the write-ahead log,
//! with defaults tuned for read-heavy single-host workloads.

use serde::{Deserialize, Serialize};

/// Write-ahead log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Total-size rotation threshold (MiB). When the summed size of all live
    /// segments crosses this after a flush, every segment is archived and the
    /// log restarts at segment 1.
    pub max_log_size_mb: u64,

    /// Per-segment cap (bytes). A flush that would push the active segment
    /// past this size opens a new segment first.
    pub optimal_file_size: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            max_log_size_mb: 100,
            optimal_file_size: 64 * 1024 * 1024, // 64MiB
        }
    }
}

impl WalConfig {
    /// Tiny segment and rotation thresholds so tests can exercise segment
    /// rollover and rotation without writing megabytes.
    pub fn for_testing() -> Self {
        Self {
            max_log_size_mb: 1,
            optimal_file_size: 4 * 1024,
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// Number of pending operations that triggers an automatic commit
    /// (and therefore a WAL flush) when `auto_commit` is on.
    pub max_batch_size: usize,

    /// Commit automatically once the pending batch reaches `max_batch_size`.
    /// Turned off for the duration of an explicit batch.
    pub auto_commit: bool,

    /// Maximum number of documents held in the hot-document cache.
    pub cache_capacity: usize,

    /// Dead-byte ratio (0.0..1.0) above which the data file is compacted
    /// after a commit. `None` disables automatic compaction; `compact()` can
    /// still be called explicitly.
    pub compaction_threshold: Option<f64>,

    /// Write-ahead log configuration.
    pub wal: WalConfig,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            auto_commit: true,
            cache_capacity: 1000,
            compaction_threshold: None,
            wal: WalConfig::default(),
        }
    }
}

impl DbConfig {
    /// Small thresholds for tests: batches commit after a handful of
    /// operations and WAL rollover happens within kilobytes.
    pub fn for_testing() -> Self {
        Self {
            max_batch_size: 4,
            cache_capacity: 8,
            wal: WalConfig::for_testing(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.max_batch_size, 1000);
        assert!(config.auto_commit);
        assert!(config.compaction_threshold.is_none());
        assert_eq!(config.wal.optimal_file_size, 64 * 1024 * 1024);
    }

    #[test]
    fn test_testing_preset() {
        let config = DbConfig::for_testing();
        assert!(config.max_batch_size < DbConfig::default().max_batch_size);
        assert!(config.wal.optimal_file_size < WalConfig::default().optimal_file_size);
    }
}
