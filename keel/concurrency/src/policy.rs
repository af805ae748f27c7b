//! Deciding which locks to request.
//!
//! Callers that are about to read or write a resource ask for the access they
//! need (`S` or `X`) and these functions work out the least permissive set of
//! intent and base locks on the resource and its ancestors that provides it.

use std::sync::Arc;

use keel_transaction::{Transaction, TransactionContext, TxnNum};

use crate::error::{LockError, LockResult};
use crate::lock_type::LockType;

/// The view of a resource hierarchy node that lock acquisition needs.
pub trait HierarchyNode: Sized {
    fn parent_context(&self) -> Option<Self>;

    /// The lock held directly on this node.
    fn explicit_lock_type(&self, txn: TxnNum) -> LockType;

    /// The lock held on this node, or the access inherited from an ancestor.
    fn effective_lock_type(&self, txn: TxnNum) -> LockType;

    fn acquire(&self, transaction: &Arc<TransactionContext>, lock_type: LockType) -> LockResult<()>;

    fn promote(&self, transaction: &Arc<TransactionContext>, lock_type: LockType) -> LockResult<()>;

    /// Replace every lock held in the subtree rooted here with one lock on
    /// this node, at the weakest mode that covers them.
    fn escalate(&self, transaction: &Arc<TransactionContext>) -> LockResult<()>;
}

/// Make sure `transaction` may access `node` with `request`, which must be
/// `S`, `X` or `NL`.
///
/// Nothing is requested if the transaction already has sufficient access,
/// directly or through an ancestor. An `IX` lock asked for `S` becomes `SIX`.
/// Other intent locks are escalated first and promoted afterwards only if the
/// escalated lock is still too weak. In every other case the ancestors are
/// strengthened as needed and the lock on `node` is acquired or promoted.
pub fn ensure_sufficient_lock_held<N: HierarchyNode>(
    node: &N,
    transaction: &Arc<TransactionContext>,
    request: LockType,
) -> LockResult<()> {
    if !matches!(request, LockType::S | LockType::X | LockType::NL) {
        return Err(LockError::InvalidLock(format!(
            "only S, X or NL can be requested, got {request}"
        )));
    }
    if request == LockType::NL {
        return Ok(());
    }

    let txn = transaction.trans_num();
    let effective = node.effective_lock_type(txn);
    if LockType::substitutable(effective, request) {
        return Ok(());
    }

    let explicit = node.explicit_lock_type(txn);
    tracing::trace!(txn, %explicit, %effective, %request, "strengthening locks");

    if explicit == LockType::IX && request == LockType::S {
        ensure_appropriate_locks_on_all_ancestors(node, transaction, LockType::SIX)?;
        return node.promote(transaction, LockType::SIX);
    }

    if explicit.is_intent() {
        node.escalate(transaction)?;
        let escalated = node.explicit_lock_type(txn);
        if LockType::substitutable(escalated, request) {
            return Ok(());
        }
        ensure_appropriate_locks_on_all_ancestors(node, transaction, request)?;
        return node.promote(transaction, request);
    }

    ensure_appropriate_locks_on_all_ancestors(node, transaction, request)?;
    if explicit == LockType::NL {
        node.acquire(transaction, request)
    } else {
        node.promote(transaction, request)
    }
}

/// Strengthen the locks on the ancestors of `node` until `child_lock_type`
/// may be held on `node`.
///
/// Each ancestor gets the weakest mode, in [`LockType::ALL`] order, that both
/// parents the lock below it and covers what the ancestor already holds.
/// Ancestors are handled from the root down.
pub fn ensure_appropriate_locks_on_all_ancestors<N: HierarchyNode>(
    node: &N,
    transaction: &Arc<TransactionContext>,
    child_lock_type: LockType,
) -> LockResult<()> {
    let Some(parent) = node.parent_context() else {
        return Ok(());
    };
    let txn = transaction.trans_num();
    let explicit = parent.explicit_lock_type(txn);
    if LockType::can_be_parent_lock(explicit, child_lock_type) {
        return Ok(());
    }

    let Some(needed) = LockType::ALL.into_iter().find(|&candidate| {
        LockType::can_be_parent_lock(candidate, child_lock_type)
            && LockType::substitutable(candidate, explicit)
    }) else {
        return Err(LockError::InvalidLock(format!(
            "no lock can replace {explicit} and parent {child_lock_type}"
        )));
    };

    ensure_appropriate_locks_on_all_ancestors(&parent, transaction, needed)?;
    if explicit == LockType::NL {
        parent.acquire(transaction, needed)
    } else {
        parent.promote(transaction, needed)
    }
}
