#![allow(dead_code)]

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use keel_concurrency::{LockManager, LockResult, LockType, ResourceName};
use keel_transaction::{TransactionContext, TxnNum};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn txn(num: TxnNum) -> Arc<TransactionContext> {
    Arc::new(TransactionContext::new(num))
}

pub fn resource(name: &str) -> ResourceName {
    ResourceName::new("database").child(name)
}

/// Acquire on another thread, since a conflicting request parks its caller.
pub fn spawn_acquire(
    lockman: &Arc<LockManager>,
    transaction: &Arc<TransactionContext>,
    name: &ResourceName,
    lock_type: LockType,
) -> JoinHandle<LockResult<()>> {
    let lockman = lockman.clone();
    let transaction = transaction.clone();
    let name = name.clone();
    thread::spawn(move || lockman.acquire(&transaction, &name, lock_type))
}

pub fn spawn_promote(
    lockman: &Arc<LockManager>,
    transaction: &Arc<TransactionContext>,
    name: &ResourceName,
    lock_type: LockType,
) -> JoinHandle<LockResult<()>> {
    let lockman = lockman.clone();
    let transaction = transaction.clone();
    let name = name.clone();
    thread::spawn(move || lockman.promote(&transaction, &name, lock_type))
}

/// Poll until `count` requests are queued on `name`.
pub fn wait_for_waiting(lockman: &LockManager, name: &ResourceName, count: usize) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while lockman.num_waiting(name) != count {
        assert!(
            Instant::now() < deadline,
            "expected {count} waiting on {name}, found {}",
            lockman.num_waiting(name)
        );
        thread::sleep(Duration::from_millis(1));
    }
}
