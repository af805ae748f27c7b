use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a transaction.
///
/// ```text
/// Running -> Committing -> Complete
/// Running -> Aborting | RecoveryAborting -> Complete
/// ```
///
/// `RecoveryAborting` is the restart-time counterpart of `Aborting`: restart
/// undoes such transactions itself instead of waiting for the owner to call
/// `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    Running,
    Committing,
    Aborting,
    RecoveryAborting,
    Complete,
}

impl TransactionStatus {
    /// Returns true once no further transition is possible.
    pub fn is_terminal(self) -> bool {
        self == TransactionStatus::Complete
    }

    /// Returns true if `self` is strictly further along the lifecycle than
    /// `current`, i.e. a transaction observed in `current` may legally move to
    /// `self`.
    pub fn supersedes(self, current: TransactionStatus) -> bool {
        use TransactionStatus::*;
        match current {
            Running => matches!(self, Committing | Aborting | Complete),
            Committing | Aborting => self == Complete,
            RecoveryAborting | Complete => false,
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionStatus::Running => "RUNNING",
            TransactionStatus::Committing => "COMMITTING",
            TransactionStatus::Aborting => "ABORTING",
            TransactionStatus::RecoveryAborting => "RECOVERY_ABORTING",
            TransactionStatus::Complete => "COMPLETE",
        };
        f.write_str(name)
    }
}
