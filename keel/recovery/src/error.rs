use keel_transaction::TxnNum;
use thiserror::Error;

use crate::Lsn;

pub type RecoveryResult<T> = Result<T, RecoveryError>;

pub type WalResult<T> = Result<T, WalError>;

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("Transaction {0} not found in the transaction table")]
    TransactionNotFound(TxnNum),
    #[error("Log record {0} not found")]
    LogRecordNotFound(Lsn),
    #[error("Log record {lsn} is not a {expected} record")]
    UnexpectedRecord { lsn: Lsn, expected: &'static str },
    #[error("Savepoint {name} not found for transaction {trans_num}")]
    SavepointNotFound { trans_num: TxnNum, name: String },
    #[error("Invalid update: {0}")]
    InvalidUpdate(String),
    #[error("Buffer error: {0}")]
    Buffer(String),
}

#[derive(Error, Debug)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),
    #[error("Checksum mismatch")]
    ChecksumMismatch,
}
