//! Transaction trait and the concrete handle used by the lock manager.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::TxnNum;
use crate::status::TransactionStatus;

/// The view of a transaction the recovery manager needs.
pub trait Transaction: Send + Sync {
    /// Get the transaction number.
    fn trans_num(&self) -> TxnNum;

    /// Get the current lifecycle status.
    fn status(&self) -> TransactionStatus;

    /// Move the transaction to `status`.
    fn set_status(&self, status: TransactionStatus);

    /// Release whatever the transaction still owns (locks, pins) once it has
    /// reached its end. Called by restart for transactions it finishes.
    fn cleanup(&self);
}

/// Builds handles for transactions that restart discovers in the log but that
/// are not live in this process.
pub type TransactionFactory = Arc<dyn Fn(TxnNum) -> Arc<dyn Transaction> + Send + Sync>;

/// A transaction handle that can be parked while one of its lock requests
/// waits in a resource queue.
///
/// Blocking is split in two so the decision to wait and the wait itself can
/// happen under different locks: [`Self::prepare_block`] is called while the
/// lock table is still held, [`Self::block`] after it has been released.
/// An [`Self::unblock`] that lands between the two is not lost.
pub struct TransactionContext {
    trans_num: TxnNum,
    status: Mutex<TransactionStatus>,
    blocked: Mutex<bool>,
    unblocked: Condvar,
    cleaned_up: AtomicBool,
}

impl TransactionContext {
    pub fn new(trans_num: TxnNum) -> Self {
        Self {
            trans_num,
            status: Mutex::new(TransactionStatus::Running),
            blocked: Mutex::new(false),
            unblocked: Condvar::new(),
            cleaned_up: AtomicBool::new(false),
        }
    }

    /// Mark the transaction as about to wait.
    pub fn prepare_block(&self) {
        let mut blocked = self.blocked.lock();
        debug_assert!(!*blocked, "transaction {} already blocked", self.trans_num);
        *blocked = true;
    }

    /// Park the calling thread until [`Self::unblock`] is called. Returns
    /// immediately if the transaction was unblocked in the meantime.
    pub fn block(&self) {
        let mut blocked = self.blocked.lock();
        while *blocked {
            self.unblocked.wait(&mut blocked);
        }
    }

    /// Wake the transaction.
    pub fn unblock(&self) {
        let mut blocked = self.blocked.lock();
        *blocked = false;
        self.unblocked.notify_all();
    }

    pub fn is_blocked(&self) -> bool {
        *self.blocked.lock()
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned_up.load(Ordering::Acquire)
    }
}

impl Transaction for TransactionContext {
    fn trans_num(&self) -> TxnNum {
        self.trans_num
    }

    fn status(&self) -> TransactionStatus {
        *self.status.lock()
    }

    fn set_status(&self, status: TransactionStatus) {
        let mut current = self.status.lock();
        let previous = *current;
        tracing::trace!(txn = self.trans_num, from = %previous, to = %status, "status change");
        *current = status;
    }

    fn cleanup(&self) {
        self.cleaned_up.store(true, Ordering::Release);
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("trans_num", &self.trans_num)
            .field("status", &self.status())
            .field("blocked", &self.is_blocked())
            .finish()
    }
}
