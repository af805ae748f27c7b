use thiserror::Error;

pub type LockResult<T> = Result<T, LockError>;

/// Rejections raised by the lock manager and the lock hierarchy.
///
/// Every variant is returned before any lock table state changes, so the
/// caller observes no partial effect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("duplicate lock request: {0}")]
    DuplicateLockRequest(String),
    #[error("no lock held: {0}")]
    NoLockHeld(String),
    #[error("invalid lock: {0}")]
    InvalidLock(String),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
}
