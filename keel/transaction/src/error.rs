use thiserror::Error;

use crate::TxnNum;

pub type TransactionResult<T> = Result<T, TransactionError>;

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("transaction number overflow, reached {0}")]
    TxnNumOverflow(TxnNum),
}
