//! Restart recovery: analysis, redo and undo.

use std::collections::{BTreeMap, BinaryHeap, HashSet};
use std::sync::atomic::Ordering;

use keel_transaction::{TransactionStatus, TxnNum};

use crate::Lsn;
use crate::buffer::PageNum;
use crate::error::{RecoveryError, RecoveryResult};
use crate::manager::{AriesRecoveryManager, TransactionTableEntry, next_to_undo};
use crate::record::LogRecord;

impl AriesRecoveryManager {
    /// Bring the database back to a consistent state after a crash.
    ///
    /// Analysis rebuilds the dirty page and transaction tables from the last
    /// checkpoint, redo repeats history from the oldest recLSN, and undo rolls
    /// back every transaction that had not committed. A checkpoint is taken
    /// at the end. Nothing else runs on the manager in the meantime.
    pub fn restart(&self) -> RecoveryResult<()> {
        let _phase = self.phase_lock.write();
        self.redo_complete.store(false, Ordering::Release);

        let checkpoint_lsn = self.restart_analysis()?;
        tracing::info!(
            checkpoint_lsn,
            dirty_pages = self.dirty_page_table.len(),
            transactions = self.transaction_table.len(),
            "analysis complete"
        );

        let redone = self.restart_redo(checkpoint_lsn)?;
        self.redo_complete.store(true, Ordering::Release);
        tracing::info!(redone, "redo complete");

        self.clean_dirty_page_table();
        let undone = self.restart_undo()?;
        tracing::info!(undone, "undo complete");

        self.checkpoint_locked()
    }

    /// Returns the LSN analysis started from.
    pub(crate) fn restart_analysis(&self) -> RecoveryResult<Lsn> {
        let checkpoint_lsn = match self.fetch(0)? {
            LogRecord::Master {
                last_checkpoint_lsn,
            } => last_checkpoint_lsn,
            _ => {
                return Err(RecoveryError::UnexpectedRecord {
                    lsn: 0,
                    expected: "master",
                });
            }
        };

        let mut ended = HashSet::new();
        for (lsn, record) in self.log.scan_from(checkpoint_lsn) {
            if let Some(trans_num) = record.trans_num() {
                self.transaction_table
                    .entry(trans_num)
                    .or_insert_with(|| self.new_entry(trans_num))
                    .last_lsn = lsn;
            }

            match &record {
                LogRecord::UpdatePage { page_num, .. }
                | LogRecord::UndoUpdatePage { page_num, .. } => {
                    self.dirty_page_table.entry(*page_num).or_insert(lsn);
                }
                LogRecord::FreePage { page_num, .. }
                | LogRecord::UndoAllocPage { page_num, .. } => {
                    self.dirty_page_table.remove(page_num);
                }
                LogRecord::CommitTransaction { trans_num, .. } => {
                    self.transaction(*trans_num)?
                        .set_status(TransactionStatus::Committing);
                }
                LogRecord::AbortTransaction { trans_num, .. } => {
                    self.transaction(*trans_num)?
                        .set_status(TransactionStatus::RecoveryAborting);
                }
                LogRecord::EndTransaction { trans_num, .. } => {
                    if let Some((_, entry)) = self.transaction_table.remove(trans_num) {
                        entry.transaction.cleanup();
                        entry.transaction.set_status(TransactionStatus::Complete);
                    }
                    ended.insert(*trans_num);
                }
                LogRecord::EndCheckpoint {
                    dirty_page_table,
                    transaction_table,
                } => {
                    self.merge_checkpoint(dirty_page_table, transaction_table, &ended);
                }
                _ => {}
            }
        }

        let mut remaining: Vec<TxnNum> = self
            .transaction_table
            .iter()
            .map(|entry| *entry.key())
            .collect();
        remaining.sort_unstable();
        for trans_num in remaining {
            let transaction = self.transaction(trans_num)?;
            match transaction.status() {
                TransactionStatus::Committing => self.finish_transaction(trans_num)?,
                TransactionStatus::Running => {
                    transaction.set_status(TransactionStatus::RecoveryAborting);
                    self.append_for(trans_num, |prev_lsn| LogRecord::AbortTransaction {
                        trans_num,
                        prev_lsn,
                    })?;
                }
                TransactionStatus::Aborting => {
                    transaction.set_status(TransactionStatus::RecoveryAborting);
                }
                TransactionStatus::RecoveryAborting => {}
                TransactionStatus::Complete => {
                    self.transaction_table.remove(&trans_num);
                }
            }
        }
        Ok(checkpoint_lsn)
    }

    fn merge_checkpoint(
        &self,
        dirty_page_table: &BTreeMap<PageNum, Lsn>,
        transaction_table: &BTreeMap<TxnNum, (TransactionStatus, Lsn)>,
        ended: &HashSet<TxnNum>,
    ) {
        for (page, rec_lsn) in dirty_page_table {
            self.dirty_page_table.insert(*page, *rec_lsn);
        }
        for (trans_num, (status, last_lsn)) in transaction_table {
            if ended.contains(trans_num) {
                continue;
            }
            let transaction = {
                let mut entry = self
                    .transaction_table
                    .entry(*trans_num)
                    .or_insert_with(|| self.new_entry(*trans_num));
                entry.last_lsn = entry.last_lsn.max(*last_lsn);
                entry.transaction.clone()
            };
            let current = transaction.status();
            if status.supersedes(current) {
                let status = match status {
                    TransactionStatus::Aborting => TransactionStatus::RecoveryAborting,
                    other => *other,
                };
                tracing::debug!(
                    txn = *trans_num,
                    from = %current,
                    to = %status,
                    "status from checkpoint"
                );
                transaction.set_status(status);
            }
        }
    }

    /// Repeat history. Returns the number of records replayed.
    pub(crate) fn restart_redo(&self, checkpoint_lsn: Lsn) -> RecoveryResult<usize> {
        let start = self
            .dirty_page_table
            .iter()
            .map(|entry| *entry.value())
            .min()
            .unwrap_or(checkpoint_lsn);

        let mut redone = 0;
        for (lsn, record) in self.log.scan_from(start) {
            if !record.is_redoable() {
                continue;
            }
            let replay = match &record {
                LogRecord::AllocPart { .. }
                | LogRecord::FreePart { .. }
                | LogRecord::UndoAllocPart { .. }
                | LogRecord::UndoFreePart { .. }
                | LogRecord::AllocPage { .. }
                | LogRecord::UndoFreePage { .. } => true,
                LogRecord::UpdatePage { page_num, .. }
                | LogRecord::UndoUpdatePage { page_num, .. }
                | LogRecord::UndoAllocPage { page_num, .. }
                | LogRecord::FreePage { page_num, .. } => self.page_needs_redo(*page_num, lsn)?,
                _ => false,
            };
            if replay {
                tracing::debug!(lsn, %record, "redo");
                self.apply(lsn, &record)?;
                redone += 1;
            }
        }
        Ok(redone)
    }

    fn page_needs_redo(&self, page: PageNum, lsn: Lsn) -> RecoveryResult<bool> {
        let Some(rec_lsn) = self.dirty_page_table.get(&page).map(|rec_lsn| *rec_lsn) else {
            return Ok(false);
        };
        if lsn < rec_lsn {
            return Ok(false);
        }
        if !self.disk.page_allocated(page) {
            tracing::debug!(lsn, page, "skipping redo on unallocated page");
            return Ok(false);
        }
        let page_lsn = self.buffer.fetch_page(page)?.page_lsn();
        Ok(page_lsn < lsn)
    }

    /// Keep only the pages the buffer layer still holds dirty.
    fn clean_dirty_page_table(&self) {
        let mut dirty = HashSet::new();
        self.buffer.iter_page_nums(&mut |page, is_dirty| {
            if is_dirty {
                dirty.insert(page);
            }
        });
        self.dirty_page_table.retain(|page, _| dirty.contains(page));
    }

    /// Roll back every recovery-aborting transaction, always undoing the
    /// newest outstanding record first. Returns the number of CLRs written.
    pub(crate) fn restart_undo(&self) -> RecoveryResult<usize> {
        let mut to_undo: BinaryHeap<(Lsn, TxnNum)> = self
            .transaction_table
            .iter()
            .filter(|entry| entry.transaction.status() == TransactionStatus::RecoveryAborting)
            .map(|entry| (entry.last_lsn, *entry.key()))
            .collect();

        let mut undone = 0;
        while let Some((lsn, trans_num)) = to_undo.pop() {
            let record = self.fetch(lsn)?;
            if record.is_undoable() {
                self.undo_record(trans_num, lsn, &record)?;
                undone += 1;
            }
            match next_to_undo(&record) {
                0 => self.finish_transaction(trans_num)?,
                next => to_undo.push((next, trans_num)),
            }
        }
        Ok(undone)
    }

    fn new_entry(&self, trans_num: TxnNum) -> TransactionTableEntry {
        tracing::debug!(txn = trans_num, "transaction found in log");
        TransactionTableEntry::new((self.new_transaction)(trans_num))
    }

    /// Clean up a transaction restart has brought to its end and write its
    /// end record.
    fn finish_transaction(&self, trans_num: TxnNum) -> RecoveryResult<()> {
        let (_, entry) = self
            .transaction_table
            .remove(&trans_num)
            .ok_or(RecoveryError::TransactionNotFound(trans_num))?;
        entry.transaction.cleanup();
        entry.transaction.set_status(TransactionStatus::Complete);
        self.log.append(LogRecord::EndTransaction {
            trans_num,
            prev_lsn: entry.last_lsn,
        })?;
        Ok(())
    }
}
