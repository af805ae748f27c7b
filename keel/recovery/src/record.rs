use std::collections::BTreeMap;
use std::fmt;

use keel_transaction::{TransactionStatus, TxnNum};
use serde::{Deserialize, Serialize};

use crate::Lsn;
use crate::buffer::{PageNum, PartNum};

/// Longest postcard varint encoding of a `u64`.
pub const MAX_VARINT_BYTES: usize = 10;
/// Bytes of an end-checkpoint record besides its table entries: a variant tag
/// and two map lengths.
pub const END_CHECKPOINT_HEADER_BYTES: usize = 1 + 2 * MAX_VARINT_BYTES;
/// Page number and recLSN.
pub const DPT_ENTRY_BYTES: usize = 2 * MAX_VARINT_BYTES;
/// Transaction number, status and lastLSN.
pub const TXN_TABLE_ENTRY_BYTES: usize = MAX_VARINT_BYTES + 1 + MAX_VARINT_BYTES;

/// Worst-case encoded size of an end-checkpoint record.
pub fn end_checkpoint_size(dpt_entries: usize, txn_entries: usize) -> usize {
    END_CHECKPOINT_HEADER_BYTES
        + dpt_entries * DPT_ENTRY_BYTES
        + txn_entries * TXN_TABLE_ENTRY_BYTES
}

/// A record in the write-ahead log.
///
/// Records written on behalf of a transaction carry `prev_lsn`, the LSN of the
/// transaction's previous record, or 0 for its first one. The `Undo*`
/// variants are compensation log records (CLRs): they are written while
/// rolling back and carry `undo_next_lsn`, the next record of the transaction
/// that still has to be undone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    /// Always at LSN 0. Points at the begin-checkpoint record of the last
    /// complete checkpoint.
    Master {
        last_checkpoint_lsn: Lsn,
    },
    BeginCheckpoint,
    EndCheckpoint {
        dirty_page_table: BTreeMap<PageNum, Lsn>,
        transaction_table: BTreeMap<TxnNum, (TransactionStatus, Lsn)>,
    },
    UpdatePage {
        trans_num: TxnNum,
        page_num: PageNum,
        prev_lsn: Lsn,
        offset: u16,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    UndoUpdatePage {
        trans_num: TxnNum,
        page_num: PageNum,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
        offset: u16,
        after: Vec<u8>,
    },
    CommitTransaction {
        trans_num: TxnNum,
        prev_lsn: Lsn,
    },
    AbortTransaction {
        trans_num: TxnNum,
        prev_lsn: Lsn,
    },
    EndTransaction {
        trans_num: TxnNum,
        prev_lsn: Lsn,
    },
    AllocPart {
        trans_num: TxnNum,
        part_num: PartNum,
        prev_lsn: Lsn,
    },
    UndoAllocPart {
        trans_num: TxnNum,
        part_num: PartNum,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
    },
    FreePart {
        trans_num: TxnNum,
        part_num: PartNum,
        prev_lsn: Lsn,
    },
    UndoFreePart {
        trans_num: TxnNum,
        part_num: PartNum,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
    },
    AllocPage {
        trans_num: TxnNum,
        page_num: PageNum,
        prev_lsn: Lsn,
    },
    UndoAllocPage {
        trans_num: TxnNum,
        page_num: PageNum,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
    },
    FreePage {
        trans_num: TxnNum,
        page_num: PageNum,
        prev_lsn: Lsn,
    },
    UndoFreePage {
        trans_num: TxnNum,
        page_num: PageNum,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
    },
}

impl LogRecord {
    pub fn name(&self) -> &'static str {
        match self {
            LogRecord::Master { .. } => "master",
            LogRecord::BeginCheckpoint => "begin checkpoint",
            LogRecord::EndCheckpoint { .. } => "end checkpoint",
            LogRecord::UpdatePage { .. } => "update page",
            LogRecord::UndoUpdatePage { .. } => "undo update page",
            LogRecord::CommitTransaction { .. } => "commit",
            LogRecord::AbortTransaction { .. } => "abort",
            LogRecord::EndTransaction { .. } => "end",
            LogRecord::AllocPart { .. } => "alloc part",
            LogRecord::UndoAllocPart { .. } => "undo alloc part",
            LogRecord::FreePart { .. } => "free part",
            LogRecord::UndoFreePart { .. } => "undo free part",
            LogRecord::AllocPage { .. } => "alloc page",
            LogRecord::UndoAllocPage { .. } => "undo alloc page",
            LogRecord::FreePage { .. } => "free page",
            LogRecord::UndoFreePage { .. } => "undo free page",
        }
    }

    pub fn trans_num(&self) -> Option<TxnNum> {
        match self {
            LogRecord::Master { .. }
            | LogRecord::BeginCheckpoint
            | LogRecord::EndCheckpoint { .. } => None,
            LogRecord::UpdatePage { trans_num, .. }
            | LogRecord::UndoUpdatePage { trans_num, .. }
            | LogRecord::CommitTransaction { trans_num, .. }
            | LogRecord::AbortTransaction { trans_num, .. }
            | LogRecord::EndTransaction { trans_num, .. }
            | LogRecord::AllocPart { trans_num, .. }
            | LogRecord::UndoAllocPart { trans_num, .. }
            | LogRecord::FreePart { trans_num, .. }
            | LogRecord::UndoFreePart { trans_num, .. }
            | LogRecord::AllocPage { trans_num, .. }
            | LogRecord::UndoAllocPage { trans_num, .. }
            | LogRecord::FreePage { trans_num, .. }
            | LogRecord::UndoFreePage { trans_num, .. } => Some(*trans_num),
        }
    }

    pub fn prev_lsn(&self) -> Option<Lsn> {
        match self {
            LogRecord::Master { .. }
            | LogRecord::BeginCheckpoint
            | LogRecord::EndCheckpoint { .. } => None,
            LogRecord::UpdatePage { prev_lsn, .. }
            | LogRecord::UndoUpdatePage { prev_lsn, .. }
            | LogRecord::CommitTransaction { prev_lsn, .. }
            | LogRecord::AbortTransaction { prev_lsn, .. }
            | LogRecord::EndTransaction { prev_lsn, .. }
            | LogRecord::AllocPart { prev_lsn, .. }
            | LogRecord::UndoAllocPart { prev_lsn, .. }
            | LogRecord::FreePart { prev_lsn, .. }
            | LogRecord::UndoFreePart { prev_lsn, .. }
            | LogRecord::AllocPage { prev_lsn, .. }
            | LogRecord::UndoAllocPage { prev_lsn, .. }
            | LogRecord::FreePage { prev_lsn, .. }
            | LogRecord::UndoFreePage { prev_lsn, .. } => Some(*prev_lsn),
        }
    }

    /// Set on CLRs only.
    pub fn undo_next_lsn(&self) -> Option<Lsn> {
        match self {
            LogRecord::UndoUpdatePage { undo_next_lsn, .. }
            | LogRecord::UndoAllocPart { undo_next_lsn, .. }
            | LogRecord::UndoFreePart { undo_next_lsn, .. }
            | LogRecord::UndoAllocPage { undo_next_lsn, .. }
            | LogRecord::UndoFreePage { undo_next_lsn, .. } => Some(*undo_next_lsn),
            _ => None,
        }
    }

    pub fn page_num(&self) -> Option<PageNum> {
        match self {
            LogRecord::UpdatePage { page_num, .. }
            | LogRecord::UndoUpdatePage { page_num, .. }
            | LogRecord::AllocPage { page_num, .. }
            | LogRecord::UndoAllocPage { page_num, .. }
            | LogRecord::FreePage { page_num, .. }
            | LogRecord::UndoFreePage { page_num, .. } => Some(*page_num),
            _ => None,
        }
    }

    pub fn part_num(&self) -> Option<PartNum> {
        match self {
            LogRecord::AllocPart { part_num, .. }
            | LogRecord::UndoAllocPart { part_num, .. }
            | LogRecord::FreePart { part_num, .. }
            | LogRecord::UndoFreePart { part_num, .. } => Some(*part_num),
            _ => None,
        }
    }

    /// Whether replaying the record changes pages or allocations.
    pub fn is_redoable(&self) -> bool {
        !matches!(
            self,
            LogRecord::Master { .. }
                | LogRecord::BeginCheckpoint
                | LogRecord::EndCheckpoint { .. }
                | LogRecord::CommitTransaction { .. }
                | LogRecord::AbortTransaction { .. }
                | LogRecord::EndTransaction { .. }
        )
    }

    /// Whether rolling back a transaction has to compensate this record.
    /// CLRs are never undone.
    pub fn is_undoable(&self) -> bool {
        matches!(
            self,
            LogRecord::UpdatePage { .. }
                | LogRecord::AllocPart { .. }
                | LogRecord::FreePart { .. }
                | LogRecord::AllocPage { .. }
                | LogRecord::FreePage { .. }
        )
    }

    /// The CLR that compensates this record, chained after `last_lsn`, the
    /// transaction's most recent record. `None` if the record is not undoable.
    pub fn undo(&self, last_lsn: Lsn) -> Option<LogRecord> {
        let clr = match self {
            LogRecord::UpdatePage {
                trans_num,
                page_num,
                prev_lsn,
                offset,
                before,
                ..
            } => LogRecord::UndoUpdatePage {
                trans_num: *trans_num,
                page_num: *page_num,
                prev_lsn: last_lsn,
                undo_next_lsn: *prev_lsn,
                offset: *offset,
                after: before.clone(),
            },
            LogRecord::AllocPart {
                trans_num,
                part_num,
                prev_lsn,
            } => LogRecord::UndoAllocPart {
                trans_num: *trans_num,
                part_num: *part_num,
                prev_lsn: last_lsn,
                undo_next_lsn: *prev_lsn,
            },
            LogRecord::FreePart {
                trans_num,
                part_num,
                prev_lsn,
            } => LogRecord::UndoFreePart {
                trans_num: *trans_num,
                part_num: *part_num,
                prev_lsn: last_lsn,
                undo_next_lsn: *prev_lsn,
            },
            LogRecord::AllocPage {
                trans_num,
                page_num,
                prev_lsn,
            } => LogRecord::UndoAllocPage {
                trans_num: *trans_num,
                page_num: *page_num,
                prev_lsn: last_lsn,
                undo_next_lsn: *prev_lsn,
            },
            LogRecord::FreePage {
                trans_num,
                page_num,
                prev_lsn,
            } => LogRecord::UndoFreePage {
                trans_num: *trans_num,
                page_num: *page_num,
                prev_lsn: last_lsn,
                undo_next_lsn: *prev_lsn,
            },
            _ => return None,
        };
        Some(clr)
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())?;
        if let Some(trans_num) = self.trans_num() {
            write!(f, " T{trans_num}")?;
        }
        if let Some(page_num) = self.page_num() {
            write!(f, " page {page_num}")?;
        }
        if let Some(part_num) = self.part_num() {
            write!(f, " part {part_num}")?;
        }
        Ok(())
    }
}
