use std::fmt;
use std::sync::Arc;

use keel_transaction::{Transaction, TransactionContext, TxnNum};

use crate::error::{LockError, LockResult};
use crate::lock_type::LockType;
use crate::manager::LockManager;
use crate::policy::HierarchyNode;
use crate::resource::ResourceName;

/// A node in the resource hierarchy.
///
/// Contexts are cheap handles: all state lives in the [`LockManager`], so two
/// contexts for the same resource are interchangeable. Unlike the flat lock
/// manager, a context enforces the multigranularity rules: a lock may only be
/// taken if the parent's lock allows it, and a lock may only be released once
/// no locks are held below it.
#[derive(Clone)]
pub struct LockContext {
    lockman: Arc<LockManager>,
    name: ResourceName,
}

impl LockContext {
    pub(crate) fn new(lockman: Arc<LockManager>, name: ResourceName) -> Self {
        Self { lockman, name }
    }

    pub fn name(&self) -> &ResourceName {
        &self.name
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lockman
    }

    /// Context of the child resource `name`.
    pub fn child(&self, name: impl Into<String>) -> LockContext {
        Self::new(self.lockman.clone(), self.name.child(name))
    }

    pub fn parent_context(&self) -> Option<LockContext> {
        self.name
            .parent()
            .map(|parent| Self::new(self.lockman.clone(), parent))
    }

    /// A context is read-only when one of its ancestors disabled child locks.
    pub fn is_readonly(&self) -> bool {
        let mut current = self.name.parent();
        while let Some(name) = current {
            if self.lockman.child_locks_disabled(&name) {
                return true;
            }
            current = name.parent();
        }
        false
    }

    /// Forbid locking anything below this resource, e.g. for tables that are
    /// always locked as a whole.
    pub fn disable_child_locks(&self) {
        self.lockman.disable_child_locks(&self.name);
    }

    /// Acquire `lock_type` on this resource.
    ///
    /// # Errors
    ///
    /// - [`LockError::InvalidLock`] if the parent's lock does not allow
    ///   `lock_type`, or if an ancestor holds SIX and `lock_type` is S or IS.
    /// - [`LockError::UnsupportedOperation`] if the context is read-only.
    /// - Whatever [`LockManager::acquire`] reports.
    pub fn acquire(
        &self,
        transaction: &Arc<TransactionContext>,
        lock_type: LockType,
    ) -> LockResult<()> {
        self.ensure_writable()?;
        let txn = transaction.trans_num();
        if let Some(parent) = self.parent_context() {
            let parent_type = parent.explicit_lock_type(txn);
            if !LockType::can_be_parent_lock(parent_type, lock_type) {
                return Err(LockError::InvalidLock(format!(
                    "{parent_type} on {} does not allow {lock_type} on {}",
                    parent.name, self.name
                )));
            }
        }
        if matches!(lock_type, LockType::S | LockType::IS) && self.has_six_ancestor(txn) {
            return Err(LockError::InvalidLock(format!(
                "{lock_type} on {} is redundant under a SIX ancestor",
                self.name
            )));
        }
        self.lockman.acquire(transaction, &self.name, lock_type)
    }

    /// Release the lock on this resource.
    ///
    /// # Errors
    ///
    /// - [`LockError::NoLockHeld`] if the transaction holds no lock here.
    /// - [`LockError::InvalidLock`] while the transaction still holds locks on
    ///   children of this resource.
    /// - [`LockError::UnsupportedOperation`] if the context is read-only.
    pub fn release(&self, transaction: &TransactionContext) -> LockResult<()> {
        self.ensure_writable()?;
        let txn = transaction.trans_num();
        if self.explicit_lock_type(txn) == LockType::NL {
            return Err(LockError::NoLockHeld(format!(
                "transaction {txn} holds no lock on {}",
                self.name
            )));
        }
        let children = self.num_child_locks(txn);
        if children > 0 {
            return Err(LockError::InvalidLock(format!(
                "transaction {txn} still holds {children} lock(s) below {}",
                self.name
            )));
        }
        self.lockman.release(transaction, &self.name)
    }

    /// Promote the lock on this resource to `new_lock_type`.
    ///
    /// Promoting to SIX also releases every S and IS lock below this resource,
    /// since SIX already grants shared access to the whole subtree.
    ///
    /// # Errors
    ///
    /// - [`LockError::NoLockHeld`] if the transaction holds no lock here.
    /// - [`LockError::DuplicateLockRequest`] if the lock already has the mode.
    /// - [`LockError::InvalidLock`] if the new mode is not a promotion, if the
    ///   parent's lock does not allow it, or for SIX under a SIX ancestor.
    /// - [`LockError::UnsupportedOperation`] if the context is read-only.
    pub fn promote(
        &self,
        transaction: &Arc<TransactionContext>,
        new_lock_type: LockType,
    ) -> LockResult<()> {
        self.ensure_writable()?;
        let txn = transaction.trans_num();
        let current = self.explicit_lock_type(txn);
        if current == LockType::NL {
            return Err(LockError::NoLockHeld(format!(
                "transaction {txn} holds no lock on {}",
                self.name
            )));
        }
        if current == new_lock_type {
            return Err(LockError::DuplicateLockRequest(format!(
                "transaction {txn} already holds {current} on {}",
                self.name
            )));
        }
        if !LockType::substitutable(new_lock_type, current) {
            return Err(LockError::InvalidLock(format!(
                "cannot promote {current} to {new_lock_type} on {}",
                self.name
            )));
        }
        if let Some(parent) = self.parent_context() {
            let parent_type = parent.explicit_lock_type(txn);
            if !LockType::can_be_parent_lock(parent_type, new_lock_type) {
                return Err(LockError::InvalidLock(format!(
                    "{parent_type} on {} does not allow {new_lock_type} on {}",
                    parent.name, self.name
                )));
            }
        }

        if new_lock_type != LockType::SIX {
            return self.lockman.promote(transaction, &self.name, new_lock_type);
        }

        if self.has_six_ancestor(txn) {
            return Err(LockError::InvalidLock(format!(
                "SIX on {} is redundant under a SIX ancestor",
                self.name
            )));
        }
        let mut release: Vec<ResourceName> = self
            .lockman
            .descendant_locks(txn, &self.name)
            .into_iter()
            .filter(|lock| matches!(lock.lock_type, LockType::S | LockType::IS))
            .map(|lock| lock.name)
            .collect();
        release.push(self.name.clone());
        self.lockman
            .acquire_and_release(transaction, &self.name, LockType::SIX, &release)
    }

    /// Replace the locks held on this resource and everything below it with a
    /// single S or X lock on this resource.
    ///
    /// X is chosen if the transaction holds X, IX or SIX on this resource or
    /// any descendant, S otherwise. Escalating a resource that is already
    /// covered by a single sufficient lock does nothing, so calling this
    /// repeatedly makes at most one request to the lock manager.
    ///
    /// # Errors
    ///
    /// - [`LockError::NoLockHeld`] if the transaction holds no lock here.
    /// - [`LockError::UnsupportedOperation`] if the context is read-only.
    pub fn escalate(&self, transaction: &Arc<TransactionContext>) -> LockResult<()> {
        self.ensure_writable()?;
        let txn = transaction.trans_num();
        let current = self.explicit_lock_type(txn);
        if current == LockType::NL {
            return Err(LockError::NoLockHeld(format!(
                "transaction {txn} holds no lock on {}",
                self.name
            )));
        }

        let descendants = self.lockman.descendant_locks(txn, &self.name);
        let is_write = |lock_type: LockType| {
            matches!(lock_type, LockType::X | LockType::IX | LockType::SIX)
        };
        let target = if is_write(current)
            || descendants.iter().any(|lock| is_write(lock.lock_type))
        {
            LockType::X
        } else {
            LockType::S
        };
        if target == current && descendants.is_empty() {
            return Ok(());
        }

        tracing::debug!(
            txn,
            resource = %self.name,
            from = %current,
            to = %target,
            released = descendants.len(),
            "escalating lock"
        );
        let mut release: Vec<ResourceName> =
            descendants.into_iter().map(|lock| lock.name).collect();
        release.push(self.name.clone());
        self.lockman
            .acquire_and_release(transaction, &self.name, target, &release)
    }

    /// The lock the transaction holds on exactly this resource.
    pub fn explicit_lock_type(&self, txn: TxnNum) -> LockType {
        self.lockman.lock_type(txn, &self.name)
    }

    /// The access the transaction has to this resource, explicitly or through
    /// an ancestor. Intent locks on ancestors grant nothing; SIX grants S.
    pub fn effective_lock_type(&self, txn: TxnNum) -> LockType {
        let explicit = self.explicit_lock_type(txn);
        if explicit != LockType::NL {
            return explicit;
        }
        match self.parent_context().map(|parent| parent.effective_lock_type(txn)) {
            Some(LockType::SIX) => LockType::S,
            Some(inherited @ (LockType::S | LockType::X)) => inherited,
            _ => LockType::NL,
        }
    }

    /// Number of locks the transaction holds on direct children.
    pub fn num_child_locks(&self, txn: TxnNum) -> usize {
        self.lockman.num_child_locks(txn, &self.name)
    }

    fn has_six_ancestor(&self, txn: TxnNum) -> bool {
        let mut current = self.parent_context();
        while let Some(context) = current {
            if context.explicit_lock_type(txn) == LockType::SIX {
                return true;
            }
            current = context.parent_context();
        }
        false
    }

    fn ensure_writable(&self) -> LockResult<()> {
        if self.is_readonly() {
            return Err(LockError::UnsupportedOperation(format!(
                "context {} is read-only",
                self.name
            )));
        }
        Ok(())
    }
}

impl HierarchyNode for LockContext {
    fn parent_context(&self) -> Option<Self> {
        LockContext::parent_context(self)
    }

    fn explicit_lock_type(&self, txn: TxnNum) -> LockType {
        LockContext::explicit_lock_type(self, txn)
    }

    fn effective_lock_type(&self, txn: TxnNum) -> LockType {
        LockContext::effective_lock_type(self, txn)
    }

    fn acquire(
        &self,
        transaction: &Arc<TransactionContext>,
        lock_type: LockType,
    ) -> LockResult<()> {
        LockContext::acquire(self, transaction, lock_type)
    }

    fn promote(
        &self,
        transaction: &Arc<TransactionContext>,
        lock_type: LockType,
    ) -> LockResult<()> {
        LockContext::promote(self, transaction, lock_type)
    }

    fn escalate(&self, transaction: &Arc<TransactionContext>) -> LockResult<()> {
        LockContext::escalate(self, transaction)
    }
}

impl fmt::Debug for LockContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockContext")
            .field("name", &self.name)
            .field("readonly", &self.is_readonly())
            .finish()
    }
}
