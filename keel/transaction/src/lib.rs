//! Transaction handles shared by the lock manager and the recovery manager.
//!
//! The lock manager parks and wakes a [`TransactionContext`] while its requests
//! wait in a resource queue; the recovery manager only sees the narrower
//! [`Transaction`] trait, so restart can materialize handles for transactions
//! that exist only in the log.

pub mod error;
pub mod generator;
pub mod status;
pub mod transaction;

pub use error::{TransactionError, TransactionResult};
pub use generator::TxnNumGenerator;
pub use status::TransactionStatus;
pub use transaction::{Transaction, TransactionContext, TransactionFactory};

/// Transaction number. Numbers start at 1; 0 never names a transaction.
pub type TxnNum = u64;
