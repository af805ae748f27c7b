use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use keel_transaction::{Transaction, TransactionFactory, TransactionStatus, TxnNum};
use parking_lot::RwLock;

use crate::Lsn;
use crate::buffer::{
    BufferManager, DiskSpaceManager, FlushHooks, LOG_PARTITION, PageNum, PartNum, part_num,
};
use crate::config::RecoveryConfig;
use crate::error::{RecoveryError, RecoveryResult};
use crate::log_manager::LogManager;
use crate::record::LogRecord;

/// A transaction known to the recovery manager.
pub struct TransactionTableEntry {
    pub transaction: Arc<dyn Transaction>,
    /// LSN of the last record written for the transaction, 0 before the
    /// first one.
    pub last_lsn: Lsn,
    pub(crate) savepoints: HashMap<String, Lsn>,
}

impl TransactionTableEntry {
    pub fn new(transaction: Arc<dyn Transaction>) -> Self {
        Self {
            transaction,
            last_lsn: 0,
            savepoints: HashMap::new(),
        }
    }
}

/// ARIES recovery manager.
///
/// Forward-processing calls may run concurrently for different transactions.
/// Checkpoints and restart take the phase lock exclusively, so none of them
/// interleave with forward processing.
pub struct AriesRecoveryManager {
    pub(crate) config: RecoveryConfig,
    pub(crate) disk: Arc<dyn DiskSpaceManager>,
    pub(crate) buffer: Arc<dyn BufferManager>,
    pub(crate) log: LogManager,
    pub(crate) new_transaction: TransactionFactory,
    pub(crate) dirty_page_table: DashMap<PageNum, Lsn>,
    pub(crate) transaction_table: DashMap<TxnNum, TransactionTableEntry>,
    /// Pages written to disk are only dropped from the dirty page table once
    /// redo has finished.
    pub(crate) redo_complete: AtomicBool,
    pub(crate) phase_lock: RwLock<()>,
}

impl AriesRecoveryManager {
    pub fn new(
        config: RecoveryConfig,
        disk: Arc<dyn DiskSpaceManager>,
        buffer: Arc<dyn BufferManager>,
        log: LogManager,
        new_transaction: TransactionFactory,
    ) -> Self {
        Self {
            config,
            disk,
            buffer,
            log,
            new_transaction,
            dirty_page_table: DashMap::new(),
            transaction_table: DashMap::new(),
            redo_complete: AtomicBool::new(false),
            phase_lock: RwLock::new(()),
        }
    }

    /// Set up a fresh database: point the master record at LSN 0 and take the
    /// first checkpoint. Call this instead of [`Self::restart`] on first use.
    pub fn initialize(&self) -> RecoveryResult<()> {
        let _phase = self.phase_lock.write();
        self.log.rewrite_master(0)?;
        self.redo_complete.store(true, Ordering::Release);
        self.checkpoint_locked()
    }

    pub fn start_transaction(&self, transaction: Arc<dyn Transaction>) {
        let _phase = self.phase_lock.read();
        let trans_num = transaction.trans_num();
        tracing::debug!(txn = trans_num, "start transaction");
        self.transaction_table
            .insert(trans_num, TransactionTableEntry::new(transaction));
    }

    /// Write the commit record and make it durable.
    pub fn commit(&self, trans_num: TxnNum) -> RecoveryResult<Lsn> {
        let _phase = self.phase_lock.read();
        let lsn = self.append_for(trans_num, |prev_lsn| LogRecord::CommitTransaction {
            trans_num,
            prev_lsn,
        })?;
        self.log.flush_to_lsn(lsn)?;
        self.transaction(trans_num)?
            .set_status(TransactionStatus::Committing);
        Ok(lsn)
    }

    /// Write the abort record. Nothing is undone until [`Self::end`].
    pub fn abort(&self, trans_num: TxnNum) -> RecoveryResult<Lsn> {
        let _phase = self.phase_lock.read();
        let lsn = self.append_for(trans_num, |prev_lsn| LogRecord::AbortTransaction {
            trans_num,
            prev_lsn,
        })?;
        self.transaction(trans_num)?
            .set_status(TransactionStatus::Aborting);
        Ok(lsn)
    }

    /// Finish a committed or aborted transaction, rolling it back first if it
    /// was aborting.
    pub fn end(&self, trans_num: TxnNum) -> RecoveryResult<Lsn> {
        let _phase = self.phase_lock.read();
        let transaction = self.transaction(trans_num)?;
        if transaction.status() == TransactionStatus::Aborting {
            self.rollback_to_lsn(trans_num, 0)?;
        }
        let lsn = self.append_for(trans_num, |prev_lsn| LogRecord::EndTransaction {
            trans_num,
            prev_lsn,
        })?;
        self.transaction_table.remove(&trans_num);
        transaction.set_status(TransactionStatus::Complete);
        Ok(lsn)
    }

    /// Log a write of `after` over `before` at `offset` in `page`. Must be
    /// called before the page itself is changed.
    pub fn log_page_write(
        &self,
        trans_num: TxnNum,
        page: PageNum,
        offset: u16,
        before: &[u8],
        after: &[u8],
    ) -> RecoveryResult<Lsn> {
        if before.len() != after.len() {
            return Err(RecoveryError::InvalidUpdate(format!(
                "before image has {} bytes but after image has {}",
                before.len(),
                after.len()
            )));
        }
        let _phase = self.phase_lock.read();
        let lsn = self.append_for(trans_num, |prev_lsn| LogRecord::UpdatePage {
            trans_num,
            page_num: page,
            prev_lsn,
            offset,
            before: before.to_vec(),
            after: after.to_vec(),
        })?;
        self.dirty_page(page, lsn);
        Ok(lsn)
    }

    /// Log the allocation of `part`. Returns `None` for the log partition,
    /// which is never logged.
    pub fn log_alloc_part(&self, trans_num: TxnNum, part: PartNum) -> RecoveryResult<Option<Lsn>> {
        if part == LOG_PARTITION {
            return Ok(None);
        }
        self.log_and_flush(trans_num, |prev_lsn| LogRecord::AllocPart {
            trans_num,
            part_num: part,
            prev_lsn,
        })
        .map(Some)
    }

    pub fn log_free_part(&self, trans_num: TxnNum, part: PartNum) -> RecoveryResult<Option<Lsn>> {
        if part == LOG_PARTITION {
            return Ok(None);
        }
        self.log_and_flush(trans_num, |prev_lsn| LogRecord::FreePart {
            trans_num,
            part_num: part,
            prev_lsn,
        })
        .map(Some)
    }

    pub fn log_alloc_page(&self, trans_num: TxnNum, page: PageNum) -> RecoveryResult<Option<Lsn>> {
        if part_num(page) == LOG_PARTITION {
            return Ok(None);
        }
        self.log_and_flush(trans_num, |prev_lsn| LogRecord::AllocPage {
            trans_num,
            page_num: page,
            prev_lsn,
        })
        .map(Some)
    }

    /// Log freeing `page`. The page leaves the dirty page table since its
    /// contents no longer matter.
    pub fn log_free_page(&self, trans_num: TxnNum, page: PageNum) -> RecoveryResult<Option<Lsn>> {
        if part_num(page) == LOG_PARTITION {
            return Ok(None);
        }
        let lsn = self.log_and_flush(trans_num, |prev_lsn| LogRecord::FreePage {
            trans_num,
            page_num: page,
            prev_lsn,
        })?;
        self.dirty_page_table.remove(&page);
        Ok(Some(lsn))
    }

    /// Create or move the savepoint `name` to the transaction's last record.
    pub fn savepoint(&self, trans_num: TxnNum, name: &str) -> RecoveryResult<()> {
        let _phase = self.phase_lock.read();
        let mut entry = self
            .transaction_table
            .get_mut(&trans_num)
            .ok_or(RecoveryError::TransactionNotFound(trans_num))?;
        let lsn = entry.last_lsn;
        entry.savepoints.insert(name.to_string(), lsn);
        Ok(())
    }

    pub fn release_savepoint(&self, trans_num: TxnNum, name: &str) -> RecoveryResult<()> {
        let _phase = self.phase_lock.read();
        let mut entry = self
            .transaction_table
            .get_mut(&trans_num)
            .ok_or(RecoveryError::TransactionNotFound(trans_num))?;
        entry
            .savepoints
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RecoveryError::SavepointNotFound {
                trans_num,
                name: name.to_string(),
            })
    }

    /// Undo everything the transaction did after the savepoint `name`. The
    /// transaction keeps running.
    pub fn rollback_to_savepoint(&self, trans_num: TxnNum, name: &str) -> RecoveryResult<()> {
        let _phase = self.phase_lock.read();
        let target = self
            .transaction_table
            .get(&trans_num)
            .ok_or(RecoveryError::TransactionNotFound(trans_num))?
            .savepoints
            .get(name)
            .copied()
            .ok_or_else(|| RecoveryError::SavepointNotFound {
                trans_num,
                name: name.to_string(),
            })?;
        self.rollback_to_lsn(trans_num, target)
    }

    /// Write a fuzzy checkpoint and point the master record at it.
    pub fn checkpoint(&self) -> RecoveryResult<()> {
        let _phase = self.phase_lock.write();
        self.checkpoint_locked()
    }

    /// Checkpoint while the phase lock is already held exclusively.
    pub(crate) fn checkpoint_locked(&self) -> RecoveryResult<()> {
        let begin_lsn = self.log.append(LogRecord::BeginCheckpoint)?;

        let mut dirty_pages: Vec<(PageNum, Lsn)> = self
            .dirty_page_table
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        dirty_pages.sort_unstable();
        let mut transactions: Vec<(TxnNum, (TransactionStatus, Lsn))> = self
            .transaction_table
            .iter()
            .map(|entry| (*entry.key(), (entry.transaction.status(), entry.last_lsn)))
            .collect();
        transactions.sort_unstable_by_key(|(trans_num, _)| *trans_num);

        let mut dirty_page_table = BTreeMap::new();
        let mut transaction_table = BTreeMap::new();
        let mut records = 0;
        for (page, rec_lsn) in dirty_pages {
            if !self
                .config
                .fits_in_one_record(dirty_page_table.len() + 1, transaction_table.len())
            {
                self.log.append(LogRecord::EndCheckpoint {
                    dirty_page_table: mem::take(&mut dirty_page_table),
                    transaction_table: mem::take(&mut transaction_table),
                })?;
                records += 1;
            }
            dirty_page_table.insert(page, rec_lsn);
        }
        for (trans_num, state) in transactions {
            if !self
                .config
                .fits_in_one_record(dirty_page_table.len(), transaction_table.len() + 1)
            {
                self.log.append(LogRecord::EndCheckpoint {
                    dirty_page_table: mem::take(&mut dirty_page_table),
                    transaction_table: mem::take(&mut transaction_table),
                })?;
                records += 1;
            }
            transaction_table.insert(trans_num, state);
        }
        let end_lsn = self.log.append(LogRecord::EndCheckpoint {
            dirty_page_table,
            transaction_table,
        })?;
        records += 1;

        self.log.flush_to_lsn(end_lsn)?;
        self.log.rewrite_master(begin_lsn)?;
        tracing::info!(begin_lsn, end_lsn, records, "checkpoint complete");
        Ok(())
    }

    pub fn flush_to_lsn(&self, lsn: Lsn) -> RecoveryResult<()> {
        self.log.flush_to_lsn(lsn)
    }

    /// Note that `page` was dirtied by the record at `lsn`. An existing entry
    /// keeps the smaller recLSN.
    pub fn dirty_page(&self, page: PageNum, lsn: Lsn) {
        self.dirty_page_table
            .entry(page)
            .and_modify(|rec_lsn| *rec_lsn = (*rec_lsn).min(lsn))
            .or_insert(lsn);
    }

    /// Take a final checkpoint and flush the log.
    pub fn close(&self) -> RecoveryResult<()> {
        let _phase = self.phase_lock.write();
        self.checkpoint_locked()?;
        self.log.close()
    }

    /// Snapshot of the dirty page table.
    pub fn dirty_page_table(&self) -> BTreeMap<PageNum, Lsn> {
        self.dirty_page_table
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// Numbers of the transactions in the transaction table, ascending.
    pub fn active_transactions(&self) -> Vec<TxnNum> {
        let mut active: Vec<TxnNum> = self
            .transaction_table
            .iter()
            .map(|entry| *entry.key())
            .collect();
        active.sort_unstable();
        active
    }

    pub fn last_lsn(&self, trans_num: TxnNum) -> Option<Lsn> {
        self.transaction_table
            .get(&trans_num)
            .map(|entry| entry.last_lsn)
    }

    pub fn log(&self) -> &LogManager {
        &self.log
    }

    /// Append the record built from the transaction's lastLSN and make it the
    /// new lastLSN. The table entry stays locked across the append so a
    /// transaction's chain follows LSN order.
    pub(crate) fn append_for(
        &self,
        trans_num: TxnNum,
        make: impl FnOnce(Lsn) -> LogRecord,
    ) -> RecoveryResult<Lsn> {
        let mut entry = self
            .transaction_table
            .get_mut(&trans_num)
            .ok_or(RecoveryError::TransactionNotFound(trans_num))?;
        let lsn = self.log.append(make(entry.last_lsn))?;
        entry.last_lsn = lsn;
        Ok(lsn)
    }

    fn log_and_flush(
        &self,
        trans_num: TxnNum,
        make: impl FnOnce(Lsn) -> LogRecord,
    ) -> RecoveryResult<Lsn> {
        let _phase = self.phase_lock.read();
        let lsn = self.append_for(trans_num, make)?;
        self.log.flush_to_lsn(lsn)?;
        Ok(lsn)
    }

    pub(crate) fn transaction(&self, trans_num: TxnNum) -> RecoveryResult<Arc<dyn Transaction>> {
        self.transaction_table
            .get(&trans_num)
            .map(|entry| entry.transaction.clone())
            .ok_or(RecoveryError::TransactionNotFound(trans_num))
    }

    pub(crate) fn fetch(&self, lsn: Lsn) -> RecoveryResult<LogRecord> {
        self.log
            .fetch(lsn)
            .ok_or(RecoveryError::LogRecordNotFound(lsn))
    }

    /// Write the CLR compensating `record` (found at `lsn`) and apply it.
    pub(crate) fn undo_record(
        &self,
        trans_num: TxnNum,
        lsn: Lsn,
        record: &LogRecord,
    ) -> RecoveryResult<()> {
        let (clr, clr_lsn) = {
            let mut entry = self
                .transaction_table
                .get_mut(&trans_num)
                .ok_or(RecoveryError::TransactionNotFound(trans_num))?;
            let clr = record
                .undo(entry.last_lsn)
                .ok_or(RecoveryError::UnexpectedRecord {
                    lsn,
                    expected: "undoable record",
                })?;
            let clr_lsn = self.log.append(clr.clone())?;
            entry.last_lsn = clr_lsn;
            (clr, clr_lsn)
        };
        // Allocation changes reach disk immediately, so their CLRs must be
        // durable first.
        if !matches!(clr, LogRecord::UndoUpdatePage { .. }) {
            self.log.flush_to_lsn(clr_lsn)?;
        }
        tracing::debug!(txn = trans_num, undone = lsn, clr_lsn, %clr, "undo");
        self.apply(clr_lsn, &clr)
    }

    /// Apply the effect of the redoable `record` written at `lsn`.
    pub(crate) fn apply(&self, lsn: Lsn, record: &LogRecord) -> RecoveryResult<()> {
        match record {
            LogRecord::UpdatePage {
                page_num,
                offset,
                after,
                ..
            }
            | LogRecord::UndoUpdatePage {
                page_num,
                offset,
                after,
                ..
            } => {
                {
                    let mut page = self.buffer.fetch_page(*page_num)?;
                    page.write(usize::from(*offset), after)?;
                    page.set_page_lsn(lsn);
                }
                self.dirty_page(*page_num, lsn);
            }
            LogRecord::AllocPart { part_num, .. } | LogRecord::UndoFreePart { part_num, .. } => {
                if !self.disk.alloc_part(*part_num)? {
                    tracing::warn!(lsn, part = *part_num, "partition already allocated");
                }
            }
            LogRecord::FreePart { part_num, .. } | LogRecord::UndoAllocPart { part_num, .. } => {
                if !self.disk.free_part(*part_num)? {
                    tracing::warn!(lsn, part = *part_num, "partition already freed");
                }
            }
            LogRecord::AllocPage { page_num, .. } | LogRecord::UndoFreePage { page_num, .. } => {
                if !self.disk.alloc_page(*page_num)? {
                    tracing::warn!(lsn, page = *page_num, "page already allocated");
                }
            }
            LogRecord::FreePage { page_num, .. } | LogRecord::UndoAllocPage { page_num, .. } => {
                if !self.disk.free_page(*page_num)? {
                    tracing::warn!(lsn, page = *page_num, "page already freed");
                }
                self.dirty_page_table.remove(page_num);
            }
            LogRecord::Master { .. }
            | LogRecord::BeginCheckpoint
            | LogRecord::EndCheckpoint { .. }
            | LogRecord::CommitTransaction { .. }
            | LogRecord::AbortTransaction { .. }
            | LogRecord::EndTransaction { .. } => {}
        }
        Ok(())
    }

    /// Undo the transaction's records newer than `target`, newest first.
    pub(crate) fn rollback_to_lsn(&self, trans_num: TxnNum, target: Lsn) -> RecoveryResult<()> {
        let mut current = self
            .last_lsn(trans_num)
            .ok_or(RecoveryError::TransactionNotFound(trans_num))?;
        while current > target {
            let record = self.fetch(current)?;
            if record.is_undoable() {
                self.undo_record(trans_num, current, &record)?;
            }
            current = next_to_undo(&record);
        }
        Ok(())
    }
}

/// The next record of the same transaction that still needs undoing after
/// `record`. CLRs skip over what they already compensated.
pub(crate) fn next_to_undo(record: &LogRecord) -> Lsn {
    record
        .undo_next_lsn()
        .or(record.prev_lsn())
        .unwrap_or(0)
}

impl FlushHooks for AriesRecoveryManager {
    fn page_flush_hook(&self, page_lsn: Lsn) -> RecoveryResult<()> {
        self.log.flush_to_lsn(page_lsn)
    }

    fn disk_io_hook(&self, page: PageNum) {
        if self.redo_complete.load(Ordering::Acquire) {
            self.dirty_page_table.remove(&page);
        }
    }
}

#[cfg(test)]
mod tests {
    use keel_transaction::TransactionContext;

    use super::*;
    use crate::buffer::page_num;
    use crate::memory_store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        rm: AriesRecoveryManager,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::default());
        let factory: TransactionFactory = Arc::new(|trans_num: TxnNum| {
            Arc::new(TransactionContext::new(trans_num)) as Arc<dyn Transaction>
        });
        let log = LogManager::open(Box::new(crate::wal::MemoryLogStorage::new())).unwrap();
        let rm = AriesRecoveryManager::new(
            RecoveryConfig::default(),
            store.clone(),
            store.clone(),
            log,
            factory,
        );
        rm.initialize().unwrap();
        store.alloc_part(1).unwrap();
        store.alloc_page(page_num(1, 0)).unwrap();
        Fixture { store, rm }
    }

    fn begin(rm: &AriesRecoveryManager, trans_num: TxnNum) -> Arc<TransactionContext> {
        let txn = Arc::new(TransactionContext::new(trans_num));
        rm.start_transaction(txn.clone());
        txn
    }

    #[test]
    fn test_page_write_chains_prev_lsn() {
        let f = fixture();
        let page = page_num(1, 0);
        begin(&f.rm, 1);

        let first = f.rm.log_page_write(1, page, 0, &[0], &[1]).unwrap();
        let second = f.rm.log_page_write(1, page, 4, &[0], &[2]).unwrap();
        assert_eq!(f.rm.last_lsn(1), Some(second));
        assert_eq!(f.rm.log().fetch(first).and_then(|r| r.prev_lsn()), Some(0));
        assert_eq!(f.rm.log().fetch(second).and_then(|r| r.prev_lsn()), Some(first));
        assert_eq!(f.rm.dirty_page_table(), BTreeMap::from([(page, first)]));
    }

    #[test]
    fn test_mismatched_images_rejected() {
        let f = fixture();
        begin(&f.rm, 1);
        assert!(matches!(
            f.rm.log_page_write(1, page_num(1, 0), 0, &[0, 0], &[1]),
            Err(RecoveryError::InvalidUpdate(_))
        ));
        assert_eq!(f.rm.last_lsn(1), Some(0));
    }

    #[test]
    fn test_commit_is_durable() {
        let f = fixture();
        let txn = begin(&f.rm, 1);
        f.rm.log_page_write(1, page_num(1, 0), 0, &[0], &[1]).unwrap();
        let lsn = f.rm.commit(1).unwrap();
        assert!(f.rm.log().flushed_lsn() >= lsn);
        assert_eq!(txn.status(), TransactionStatus::Committing);

        f.rm.end(1).unwrap();
        assert_eq!(txn.status(), TransactionStatus::Complete);
        assert!(f.rm.active_transactions().is_empty());
    }

    #[test]
    fn test_unknown_transaction() {
        let f = fixture();
        assert!(matches!(
            f.rm.commit(9),
            Err(RecoveryError::TransactionNotFound(9))
        ));
        assert!(matches!(
            f.rm.savepoint(9, "sp"),
            Err(RecoveryError::TransactionNotFound(9))
        ));
    }

    #[test]
    fn test_log_partition_not_logged() {
        let f = fixture();
        begin(&f.rm, 1);
        let last = f.rm.log().last_lsn();
        assert_eq!(f.rm.log_alloc_part(1, LOG_PARTITION).unwrap(), None);
        assert_eq!(f.rm.log_alloc_page(1, page_num(LOG_PARTITION, 3)).unwrap(), None);
        assert_eq!(f.rm.log().last_lsn(), last);

        let lsn = f.rm.log_alloc_part(1, 2).unwrap().unwrap();
        assert_eq!(f.rm.log().flushed_lsn(), lsn);
    }

    #[test]
    fn test_free_page_leaves_dirty_page_table() {
        let f = fixture();
        let page = page_num(1, 0);
        begin(&f.rm, 1);
        f.rm.log_page_write(1, page, 0, &[0], &[1]).unwrap();
        f.rm.log_free_page(1, page).unwrap();
        assert!(f.rm.dirty_page_table().is_empty());
    }

    #[test]
    fn test_dirty_page_keeps_smallest_rec_lsn() {
        let f = fixture();
        f.rm.dirty_page(5, 30);
        f.rm.dirty_page(5, 20);
        f.rm.dirty_page(5, 40);
        assert_eq!(f.rm.dirty_page_table().get(&5), Some(&20));
    }

    #[test]
    fn test_abort_end_restores_page() {
        let f = fixture();
        let page = page_num(1, 0);
        let txn = begin(&f.rm, 1);
        f.rm.log_page_write(1, page, 2, &[0, 0], &[5, 6]).unwrap();
        {
            let mut handle = f.store.fetch_page(page).unwrap();
            handle.write(2, &[5, 6]).unwrap();
        }

        f.rm.abort(1).unwrap();
        assert_eq!(txn.status(), TransactionStatus::Aborting);
        let end_lsn = f.rm.end(1).unwrap();

        let handle = f.store.fetch_page(page).unwrap();
        assert_eq!(handle.read(2, 2).unwrap(), vec![0, 0]);
        assert_eq!(handle.page_lsn(), end_lsn - 1);
        assert!(matches!(
            f.rm.log().fetch(end_lsn - 1),
            Some(LogRecord::UndoUpdatePage { undo_next_lsn: 0, .. })
        ));
        assert_eq!(txn.status(), TransactionStatus::Complete);
    }

    #[test]
    fn test_savepoint_lifecycle() {
        let f = fixture();
        begin(&f.rm, 1);
        f.rm.savepoint(1, "a").unwrap();
        f.rm.release_savepoint(1, "a").unwrap();
        assert!(matches!(
            f.rm.release_savepoint(1, "a"),
            Err(RecoveryError::SavepointNotFound { trans_num: 1, .. })
        ));
        assert!(f.rm.rollback_to_savepoint(1, "a").is_err());
    }

    #[test]
    fn test_undo_of_page_allocation_frees_it() {
        let f = fixture();
        let page = page_num(1, 7);
        begin(&f.rm, 1);
        f.rm.log_alloc_page(1, page).unwrap();
        f.store.alloc_page(page).unwrap();

        f.rm.abort(1).unwrap();
        f.rm.end(1).unwrap();
        assert!(!f.store.page_allocated(page));
    }

    #[test]
    fn test_disk_io_hook_drops_written_page() {
        let f = fixture();
        let page = page_num(1, 0);
        begin(&f.rm, 1);
        f.rm.log_page_write(1, page, 0, &[0], &[1]).unwrap();
        f.rm.disk_io_hook(page);
        assert!(f.rm.dirty_page_table().is_empty());
    }

    #[test]
    fn test_checkpoint_points_master_at_begin() {
        let f = fixture();
        begin(&f.rm, 1);
        f.rm.log_page_write(1, page_num(1, 0), 0, &[0], &[1]).unwrap();
        let before = f.rm.log().last_lsn();
        f.rm.checkpoint().unwrap();

        assert_eq!(
            f.rm.log().fetch(0),
            Some(LogRecord::Master {
                last_checkpoint_lsn: before + 1
            })
        );
        match f.rm.log().fetch(before + 2) {
            Some(LogRecord::EndCheckpoint {
                dirty_page_table,
                transaction_table,
            }) => {
                assert_eq!(dirty_page_table.len(), 1);
                assert_eq!(
                    transaction_table.get(&1),
                    Some(&(TransactionStatus::Running, before))
                );
            }
            other => panic!("expected end checkpoint, got {other:?}"),
        }
        assert_eq!(f.rm.log().flushed_lsn(), before + 2);
    }
}
