use std::path::PathBuf;

use crate::record::{MAX_VARINT_BYTES, end_checkpoint_size};
use crate::wal::FRAME_HEADER_SIZE;

/// Size of one log page. End-checkpoint records are sized to fit in one.
pub const DEFAULT_LOG_PAGE_SIZE: usize = 4096;

/// Size of one data page in the in-memory buffer layer.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

pub const WAL_FILE_NAME: &str = "keel.wal";
pub const MASTER_FILE_NAME: &str = "keel.master";

/// Where the log lives.
#[derive(Debug, Clone, Default)]
pub struct LogManagerConfig {
    /// Directory holding the log and master record files. `None` keeps the
    /// log in memory, which is only useful for tests.
    pub log_dir: Option<PathBuf>,
}

impl LogManagerConfig {
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: Some(dir.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Encoded size limit of a single end-checkpoint record, excluding its
    /// frame header and LSN. A checkpoint
    /// whose tables do not fit is split over several records.
    pub checkpoint_record_bytes: usize,
}

impl RecoveryConfig {
    /// Whether an end-checkpoint record with `dpt_entries` dirty pages and
    /// `txn_entries` transactions stays within the configured size.
    pub fn fits_in_one_record(&self, dpt_entries: usize, txn_entries: usize) -> bool {
        end_checkpoint_size(dpt_entries, txn_entries) <= self.checkpoint_record_bytes
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            checkpoint_record_bytes: DEFAULT_LOG_PAGE_SIZE - FRAME_HEADER_SIZE - MAX_VARINT_BYTES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryBufferConfig {
    pub page_size: usize,
}

impl Default for MemoryBufferConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}
