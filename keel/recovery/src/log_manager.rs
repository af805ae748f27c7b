use parking_lot::Mutex;

use crate::Lsn;
use crate::config::LogManagerConfig;
use crate::error::{RecoveryError, RecoveryResult, WalError};
use crate::record::LogRecord;
use crate::wal::{FileLogStorage, LogStorage, MemoryLogStorage};

struct LogState {
    storage: Box<dyn LogStorage>,
    /// Every record, indexed by LSN. `records[0]` is the master record.
    records: Vec<LogRecord>,
    flushed_lsn: Lsn,
}

impl LogState {
    fn last_lsn(&self) -> Lsn {
        (self.records.len() - 1) as Lsn
    }
}

/// The write-ahead log.
///
/// LSNs are dense: the master record is LSN 0 and each appended record gets
/// the LSN after the last one. Appends are buffered in memory until
/// [`LogManager::flush_to_lsn`] writes them to storage.
pub struct LogManager {
    state: Mutex<LogState>,
}

impl LogManager {
    pub fn with_config(config: &LogManagerConfig) -> RecoveryResult<Self> {
        match &config.log_dir {
            Some(dir) => Self::open(Box::new(FileLogStorage::open(dir)?)),
            None => Self::open(Box::new(MemoryLogStorage::new())),
        }
    }

    /// Open the log kept in `storage`. Records that were never flushed before
    /// the storage was last closed are gone. A new log starts with a master
    /// record pointing at LSN 0.
    pub fn open(mut storage: Box<dyn LogStorage>) -> RecoveryResult<Self> {
        let last_checkpoint_lsn = match storage.read_master()? {
            Some(lsn) => lsn,
            None => {
                storage.write_master(0)?;
                0
            }
        };

        let mut records = vec![LogRecord::Master {
            last_checkpoint_lsn,
        }];
        for (lsn, record) in storage.read_records()? {
            let expected = records.len() as Lsn;
            if lsn != expected {
                return Err(WalError::DeserializationFailed(format!(
                    "log is not contiguous: expected LSN {expected}, found {lsn}"
                ))
                .into());
            }
            records.push(record);
        }

        let flushed_lsn = (records.len() - 1) as Lsn;
        tracing::debug!(last_checkpoint_lsn, flushed_lsn, "opened log");
        Ok(Self {
            state: Mutex::new(LogState {
                storage,
                records,
                flushed_lsn,
            }),
        })
    }

    /// Append `record` and return its LSN. The master record can only be
    /// replaced through [`LogManager::rewrite_master`].
    pub fn append(&self, record: LogRecord) -> RecoveryResult<Lsn> {
        let mut state = self.state.lock();
        let lsn = state.records.len() as Lsn;
        if matches!(record, LogRecord::Master { .. }) {
            return Err(RecoveryError::UnexpectedRecord {
                lsn,
                expected: "non-master",
            });
        }
        tracing::trace!(lsn, %record, "append");
        state.records.push(record);
        Ok(lsn)
    }

    pub fn fetch(&self, lsn: Lsn) -> Option<LogRecord> {
        let state = self.state.lock();
        usize::try_from(lsn)
            .ok()
            .and_then(|index| state.records.get(index))
            .cloned()
    }

    /// Iterate over the log from `lsn` on. Records appended while the scan
    /// runs are included.
    pub fn scan_from(&self, lsn: Lsn) -> LogScan<'_> {
        LogScan { log: self, next: lsn }
    }

    /// Make every record up to and including `lsn` durable.
    pub fn flush_to_lsn(&self, lsn: Lsn) -> RecoveryResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let target = lsn.min(state.last_lsn());
        if target <= state.flushed_lsn {
            return Ok(());
        }

        let start = state.flushed_lsn + 1;
        for (offset, record) in state.records[start as usize..=target as usize]
            .iter()
            .enumerate()
        {
            state.storage.append(start + offset as Lsn, record)?;
        }
        state.storage.sync()?;
        state.flushed_lsn = target;
        tracing::debug!(flushed_lsn = target, "flushed log");
        Ok(())
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.state.lock().flushed_lsn
    }

    pub fn last_lsn(&self) -> Lsn {
        self.state.lock().last_lsn()
    }

    /// Durably point the master record at `last_checkpoint_lsn`.
    pub fn rewrite_master(&self, last_checkpoint_lsn: Lsn) -> RecoveryResult<()> {
        let mut state = self.state.lock();
        state.storage.write_master(last_checkpoint_lsn)?;
        state.records[0] = LogRecord::Master {
            last_checkpoint_lsn,
        };
        Ok(())
    }

    /// Flush everything.
    pub fn close(&self) -> RecoveryResult<()> {
        self.flush_to_lsn(Lsn::MAX)
    }
}

/// Forward iterator over the log, see [`LogManager::scan_from`].
pub struct LogScan<'a> {
    log: &'a LogManager,
    next: Lsn,
}

impl Iterator for LogScan<'_> {
    type Item = (Lsn, LogRecord);

    fn next(&mut self) -> Option<Self::Item> {
        let lsn = self.next;
        let record = self.log.fetch(lsn)?;
        self.next += 1;
        Some((lsn, record))
    }
}
