//! ARIES-style write-ahead logging and crash recovery.
//!
//! [`AriesRecoveryManager`] is told about every change a transaction makes
//! before the change reaches a page, and writes it to the log kept by
//! [`LogManager`]. After a crash, [`AriesRecoveryManager::restart`] rebuilds
//! the dirty page and transaction tables from the log, repeats history, and
//! rolls back the transactions that never finished.
//!
//! The buffer and disk layers are consumed through the traits in [`buffer`];
//! [`MemoryStore`] is an in-memory implementation of both.

pub mod buffer;
pub mod config;
pub mod error;
pub mod log_manager;
pub mod manager;
pub mod memory_store;
pub mod record;
mod restart;
pub mod wal;

pub use buffer::{
    BufferManager, DiskSpaceManager, FlushHooks, LOG_PARTITION, PageHandle, PageNum, PartNum,
    page_num, part_num,
};
pub use config::{LogManagerConfig, MemoryBufferConfig, RecoveryConfig};
pub use error::{RecoveryError, RecoveryResult, WalError, WalResult};
pub use log_manager::LogManager;
pub use manager::{AriesRecoveryManager, TransactionTableEntry};
pub use memory_store::MemoryStore;
pub use record::LogRecord;
pub use wal::{FileLogStorage, LogStorage, MemoryLogStorage};

/// Log sequence number. LSN 0 is the master record; every appended record
/// gets the next number.
pub type Lsn = u64;
