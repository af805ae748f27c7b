//! Transaction number allocation.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::TxnNum;
use crate::error::{TransactionError, TransactionResult};

/// Hands out strictly increasing transaction numbers.
pub struct TxnNumGenerator {
    counter: AtomicU64,
}

impl TxnNumGenerator {
    /// Create a generator whose first number is 1.
    pub fn new() -> Self {
        Self::with_start(1)
    }

    /// Create a generator whose first number is `start`.
    pub fn with_start(start: TxnNum) -> Self {
        Self {
            counter: AtomicU64::new(start.max(1)),
        }
    }

    /// Allocate the next transaction number.
    pub fn next(&self) -> TransactionResult<TxnNum> {
        let mut cur = self.counter.load(Ordering::SeqCst);
        loop {
            if cur == u64::MAX {
                return Err(TransactionError::TxnNumOverflow(cur));
            }
            match self.counter.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(cur),
                Err(actual) => cur = actual,
            }
        }
    }

    /// The number the next call to [`Self::next`] will return.
    pub fn current(&self) -> TxnNum {
        self.counter.load(Ordering::SeqCst)
    }

    /// Make sure numbers handed out from now on are greater than `seen`.
    /// Used after restart, when the log names transactions this process never
    /// allocated.
    pub fn update_if_greater(&self, seen: TxnNum) -> TransactionResult<()> {
        if seen == u64::MAX {
            return Err(TransactionError::TxnNumOverflow(seen));
        }
        self.counter.fetch_max(seen + 1, Ordering::SeqCst);
        Ok(())
    }
}

impl Default for TxnNumGenerator {
    fn default() -> Self {
        Self::new()
    }
}
