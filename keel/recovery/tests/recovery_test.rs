mod common;

use std::collections::BTreeMap;
use std::thread;

use common::{TestDb, init_tracing, page};
use keel_recovery::record::end_checkpoint_size;
use keel_recovery::{
    DiskSpaceManager, LOG_PARTITION, LogManagerConfig, LogRecord, RecoveryConfig, page_num,
};
use keel_transaction::{Transaction, TransactionStatus};
use serial_test::serial;

fn count_clrs(db: &TestDb, trans_num: u64) -> usize {
    db.records()
        .iter()
        .filter(|(_, record)| {
            matches!(record, LogRecord::UndoUpdatePage { .. })
                && record.trans_num() == Some(trans_num)
        })
        .count()
}

fn has_end_record(db: &TestDb, trans_num: u64) -> bool {
    db.records().iter().any(|(_, record)| {
        matches!(record, LogRecord::EndTransaction { trans_num: t, .. } if *t == trans_num)
    })
}

#[test]
#[serial]
fn test_committed_write_survives_crash() {
    init_tracing();
    let db = TestDb::new();
    db.begin(1);
    db.write(1, page(0), 0, &[9]);
    db.rm.commit(1).unwrap();

    let db = db.crash();
    assert_eq!(db.read(page(0), 0, 1), vec![0]);
    db.rm.restart().unwrap();

    assert_eq!(db.read(page(0), 0, 1), vec![9]);
    assert!(has_end_record(&db, 1));
    assert!(db.rm.active_transactions().is_empty());
    let restored = db.restored(1).unwrap();
    assert_eq!(restored.status(), TransactionStatus::Complete);
    assert!(restored.is_cleaned_up());
    assert_eq!(count_clrs(&db, 1), 0);
}

#[test]
fn test_uncommitted_write_rolled_back_on_restart() {
    let db = TestDb::new();
    db.begin(1);
    db.begin(2);
    db.write(1, page(0), 4, &[5, 5]);
    db.write(2, page(1), 0, &[7]);
    db.rm.commit(2).unwrap();
    // The loser's update reaches disk.
    db.store.flush_page(page(0)).unwrap();
    assert_eq!(db.store.disk_image(page(0)).unwrap().0[4..6], [5, 5]);

    let db = db.crash_and_restart();
    assert_eq!(db.read(page(0), 4, 2), vec![0, 0]);
    assert_eq!(db.read(page(1), 0, 1), vec![7]);
    assert_eq!(count_clrs(&db, 1), 1);
    assert!(has_end_record(&db, 1));
    assert_eq!(
        db.restored(1).unwrap().status(),
        TransactionStatus::Complete
    );

    db.store.flush_all().unwrap();
    assert_eq!(db.store.disk_image(page(0)).unwrap().0[4..6], [0, 0]);
}

#[test]
fn test_unflushed_transaction_disappears() {
    let db = TestDb::new();
    db.begin(1);
    db.write(1, page(0), 0, &[3]);

    let db = db.crash_and_restart();
    assert_eq!(db.read(page(0), 0, 1), vec![0]);
    assert!(db.restored(1).is_none());
    assert!(db.rm.active_transactions().is_empty());
}

#[test]
fn test_restart_skips_transaction_numbers_in_log() {
    let db = TestDb::new();
    let first = db.begin_next();
    assert_eq!(first.trans_num(), 1);
    db.begin(7);
    let lsn = db.write(7, page(0), 0, &[1]);
    db.rm.flush_to_lsn(lsn).unwrap();

    let db = db.crash_and_restart();
    assert!(db.restored(7).is_some());
    assert_eq!(db.begin_next().trans_num(), 8);
}

#[test]
fn test_restart_is_repeatable() {
    let db = TestDb::new();
    db.begin(1);
    db.write(1, page(2), 0, &[1, 2, 3]);
    let lsn = db.write(1, page(2), 1, &[8]);
    db.rm.flush_to_lsn(lsn).unwrap();

    let db = db.crash_and_restart();
    assert_eq!(db.read(page(2), 0, 3), vec![0, 0, 0]);
    assert_eq!(count_clrs(&db, 1), 2);

    // Restart again before any page reached disk: the CLRs are redone, not
    // undone again.
    let db = db.crash_and_restart();
    assert_eq!(db.read(page(2), 0, 3), vec![0, 0, 0]);
    assert_eq!(count_clrs(&db, 1), 2);
    assert!(db.restored(1).is_none());
}

#[test]
fn test_aborted_transaction_rolled_back_on_restart() {
    let db = TestDb::new();
    db.begin(1);
    db.write(1, page(0), 0, &[1]);
    db.write(1, page(1), 0, &[2]);
    db.rm.abort(1).unwrap();
    db.rm.flush_to_lsn(u64::MAX).unwrap();

    let db = db.crash_and_restart();
    assert_eq!(db.read(page(0), 0, 1), vec![0]);
    assert_eq!(db.read(page(1), 0, 1), vec![0]);
    assert_eq!(count_clrs(&db, 1), 2);
    assert!(has_end_record(&db, 1));
}

#[test]
fn test_partial_rollback_to_savepoint() {
    let db = TestDb::new();
    let txn = db.begin(1);
    db.write(1, page(0), 0, &[1]);
    db.write(1, page(1), 0, &[2]);
    db.rm.savepoint(1, "sp").unwrap();
    db.write(1, page(2), 0, &[3]);

    let before = db.rm.log().last_lsn();
    db.rm.rollback_to_savepoint(1, "sp").unwrap();

    assert_eq!(db.rm.log().last_lsn(), before + 1);
    assert_eq!(count_clrs(&db, 1), 1);
    assert_eq!(db.rm.last_lsn(1), Some(before + 1));
    assert_eq!(db.read(page(0), 0, 1), vec![1]);
    assert_eq!(db.read(page(1), 0, 1), vec![2]);
    assert_eq!(db.read(page(2), 0, 1), vec![0]);
    assert_eq!(txn.status(), TransactionStatus::Running);

    // Rolling back again has nothing left to undo.
    db.rm.rollback_to_savepoint(1, "sp").unwrap();
    assert_eq!(count_clrs(&db, 1), 1);

    db.rm.commit(1).unwrap();
    db.rm.end(1).unwrap();
    let db = db.crash_and_restart();
    assert_eq!(db.read(page(0), 0, 1), vec![1]);
    assert_eq!(db.read(page(2), 0, 1), vec![0]);
}

#[test]
fn test_savepoint_overwrite_moves_marker() {
    let db = TestDb::new();
    db.begin(1);
    db.rm.savepoint(1, "sp").unwrap();
    db.write(1, page(0), 0, &[1]);
    db.rm.savepoint(1, "sp").unwrap();
    db.write(1, page(1), 0, &[2]);

    db.rm.rollback_to_savepoint(1, "sp").unwrap();
    assert_eq!(db.read(page(0), 0, 1), vec![1]);
    assert_eq!(db.read(page(1), 0, 1), vec![0]);
}

#[test]
fn test_abort_and_end_roll_back_everything() {
    let db = TestDb::new();
    let txn = db.begin(1);
    db.write(1, page(0), 0, &[1, 1]);
    db.write(1, page(0), 1, &[2]);
    db.write(1, page(3), 0, &[3]);
    db.rm.abort(1).unwrap();
    assert_eq!(db.read(page(0), 0, 2), vec![1, 2]);

    db.rm.end(1).unwrap();
    assert_eq!(db.read(page(0), 0, 2), vec![0, 0]);
    assert_eq!(db.read(page(3), 0, 1), vec![0]);
    assert_eq!(count_clrs(&db, 1), 3);
    assert_eq!(txn.status(), TransactionStatus::Complete);
    assert!(db.rm.active_transactions().is_empty());
}

#[test]
fn test_checkpoint_splits_large_tables() {
    let config = RecoveryConfig {
        checkpoint_record_bytes: end_checkpoint_size(2, 1),
    };
    let db = TestDb::with_config(config.clone());
    for trans_num in 1..=3 {
        db.begin(trans_num);
    }
    db.write(1, page(0), 0, &[1]);
    db.write(1, page(1), 0, &[1]);
    db.write(2, page(2), 0, &[2]);
    db.write(3, page(3), 0, &[3]);
    db.rm.checkpoint().unwrap();

    let Some(LogRecord::Master {
        last_checkpoint_lsn,
    }) = db.rm.log().fetch(0)
    else {
        panic!("missing master record");
    };
    assert_eq!(
        db.rm.log().fetch(last_checkpoint_lsn),
        Some(LogRecord::BeginCheckpoint)
    );

    let mut dirty_pages = BTreeMap::new();
    let mut transactions = BTreeMap::new();
    let mut records = 0;
    for (_, record) in db.rm.log().scan_from(last_checkpoint_lsn + 1) {
        let LogRecord::EndCheckpoint {
            dirty_page_table,
            transaction_table,
        } = record
        else {
            break;
        };
        assert!(config.fits_in_one_record(dirty_page_table.len(), transaction_table.len()));
        dirty_pages.extend(dirty_page_table);
        transactions.extend(transaction_table);
        records += 1;
    }
    assert!(records > 1);
    assert_eq!(dirty_pages, db.rm.dirty_page_table());
    assert_eq!(transactions.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(db.rm.log().flushed_lsn() >= last_checkpoint_lsn + records);

    let db = db.crash_and_restart();
    for index in 0..4 {
        assert_eq!(db.read(page(index), 0, 1), vec![0]);
    }
    assert!(db.rm.active_transactions().is_empty());
}

#[test]
fn test_restart_from_checkpoint_sees_earlier_commit() {
    let db = TestDb::new();
    db.begin(1);
    db.write(1, page(0), 0, &[4]);
    db.begin(2);
    db.write(2, page(1), 0, &[5]);
    db.rm.commit(1).unwrap();
    db.rm.checkpoint().unwrap();
    db.write(2, page(1), 1, &[6]);
    db.rm.flush_to_lsn(u64::MAX).unwrap();

    let db = db.crash_and_restart();
    assert_eq!(db.read(page(0), 0, 1), vec![4]);
    assert_eq!(db.read(page(1), 0, 2), vec![0, 0]);
    assert!(has_end_record(&db, 1));
    assert!(has_end_record(&db, 2));
}

#[test]
fn test_allocations_are_durable_and_undone() {
    let db = TestDb::new();
    db.begin(1);
    assert_eq!(db.rm.log_alloc_part(1, LOG_PARTITION).unwrap(), None);
    assert_eq!(
        db.rm.log_alloc_page(1, page_num(LOG_PARTITION, 1)).unwrap(),
        None
    );

    let new_page = page_num(2, 0);
    let lsn = db.rm.log_alloc_part(1, 2).unwrap().unwrap();
    db.store.alloc_part(2).unwrap();
    assert_eq!(db.rm.log().flushed_lsn(), lsn);
    let lsn = db.rm.log_alloc_page(1, new_page).unwrap().unwrap();
    db.store.alloc_page(new_page).unwrap();
    assert_eq!(db.rm.log().flushed_lsn(), lsn);

    let db = db.crash_and_restart();
    assert!(!db.store.page_allocated(new_page));
    assert!(db.store.alloc_page(new_page).is_err());
    assert!(db.restored(1).is_some());
}

#[test]
fn test_free_page_rolled_back() {
    let db = TestDb::new();
    db.begin(1);
    db.rm.log_free_page(1, page(5)).unwrap();
    db.store.free_page(page(5)).unwrap();
    db.rm.abort(1).unwrap();
    db.rm.end(1).unwrap();
    assert!(db.store.page_allocated(page(5)));
}

#[test]
fn test_flushing_page_obeys_write_ahead_rule() {
    let db = TestDb::new();
    db.begin(1);
    let lsn = db.write(1, page(0), 0, &[1]);
    assert!(db.rm.log().flushed_lsn() < lsn);
    assert!(db.rm.dirty_page_table().contains_key(&page(0)));

    db.store.flush_page(page(0)).unwrap();
    assert!(db.rm.log().flushed_lsn() >= lsn);
    assert!(!db.rm.dirty_page_table().contains_key(&page(0)));
}

#[test]
#[serial]
fn test_file_log_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let db = TestDb::with_log_dir(LogManagerConfig::with_dir(dir.path()));
    db.begin(1);
    db.write(1, page(0), 0, &[1, 2]);
    db.rm.commit(1).unwrap();
    db.begin(2);
    db.write(2, page(0), 2, &[3]);
    db.rm.flush_to_lsn(u64::MAX).unwrap();

    let db = db.crash_and_restart();
    assert_eq!(db.read(page(0), 0, 3), vec![1, 2, 0]);
    assert!(dir.path().join("keel.wal").exists());
    assert!(dir.path().join("keel.master").exists());

    db.rm.close().unwrap();
}

#[test]
fn test_concurrent_transactions_keep_their_chains() {
    let db = TestDb::new();
    thread::scope(|scope| {
        for trans_num in 1..=4u64 {
            let db = &db;
            scope.spawn(move || {
                db.begin(trans_num);
                for offset in 0..16u16 {
                    db.write(trans_num, page(trans_num as u32), offset, &[trans_num as u8]);
                }
                db.rm.commit(trans_num).unwrap();
                db.rm.end(trans_num).unwrap();
            });
        }
    });

    for trans_num in 1..=4u64 {
        let mut chain: Vec<u64> = db
            .records()
            .into_iter()
            .filter(|(_, record)| record.trans_num() == Some(trans_num))
            .map(|(lsn, _)| lsn)
            .collect();
        let last = chain.pop().unwrap();
        let mut expected_prev = last;
        while let Some(lsn) = chain.pop() {
            let prev = db.rm.log().fetch(expected_prev).unwrap().prev_lsn();
            assert_eq!(prev, Some(lsn));
            expected_prev = lsn;
        }
        assert_eq!(db.rm.log().fetch(expected_prev).unwrap().prev_lsn(), Some(0));
    }

    let db = db.crash_and_restart();
    for trans_num in 1..=4u32 {
        assert_eq!(db.read(page(trans_num), 15, 1), vec![trans_num as u8]);
    }
}
