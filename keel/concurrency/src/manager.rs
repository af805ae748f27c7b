//! The flat lock table.
//!
//! `LockManager` maps every resource to the locks granted on it and to a queue
//! of requests that could not be granted yet, and every transaction to the
//! locks it holds. It does not know about the resource hierarchy; see
//! [`crate::context::LockContext`] for that.
//!
//! Each resource queue is processed whenever a lock on the resource is
//! released: requests are taken from the front for as long as they are
//! compatible with the granted locks, and processing stops at the first one
//! that is not. With a queue of `S(A) X(A) S(A)` only the first request is
//! granted when A is freed; the trailing `S(A)` keeps waiting behind `X(A)`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use keel_transaction::{Transaction, TransactionContext, TxnNum};
use parking_lot::Mutex;

use crate::context::LockContext;
use crate::error::{LockError, LockResult};
use crate::lock_type::LockType;
use crate::resource::ResourceName;

/// A granted lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub name: ResourceName,
    pub lock_type: LockType,
    pub trans_num: TxnNum,
}

impl Lock {
    pub fn new(name: ResourceName, lock_type: LockType, trans_num: TxnNum) -> Self {
        Self {
            name,
            lock_type,
            trans_num,
        }
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}: {}({})", self.trans_num, self.lock_type, self.name)
    }
}

/// Key of a granted lock in [`LockTable::locks`]. Both the per-resource and the
/// per-transaction indices store ids, so updating a lock's mode through one
/// index is visible through the other.
type LockId = u64;

/// A request waiting in a resource queue.
struct LockRequest {
    transaction: Arc<TransactionContext>,
    lock_type: LockType,
    /// Locks the transaction gives up once this request is granted.
    release_names: Vec<ResourceName>,
}

#[derive(Default)]
struct ResourceEntry {
    /// Granted locks in acquisition order.
    granted: Vec<LockId>,
    waiting: VecDeque<LockRequest>,
}

impl ResourceEntry {
    fn is_idle(&self) -> bool {
        self.granted.is_empty() && self.waiting.is_empty()
    }
}

#[derive(Default)]
struct LockTable {
    locks: HashMap<LockId, Lock>,
    next_lock_id: LockId,
    resources: HashMap<ResourceName, ResourceEntry>,
    /// Locks held by each transaction, in acquisition order.
    transaction_locks: HashMap<TxnNum, Vec<LockId>>,
}

impl LockTable {
    fn held_lock_id(&self, txn: TxnNum, name: &ResourceName) -> Option<LockId> {
        let entry = self.resources.get(name)?;
        entry.granted.iter().copied().find(|id| {
            self.locks
                .get(id)
                .is_some_and(|lock| lock.trans_num == txn)
        })
    }

    fn lock_type(&self, txn: TxnNum, name: &ResourceName) -> LockType {
        self.held_lock_id(txn, name)
            .and_then(|id| self.locks.get(&id))
            .map_or(LockType::NL, |lock| lock.lock_type)
    }

    /// Whether `lock_type` can be granted on `name` next to the locks already
    /// there. Locks held by `except` are ignored: a transaction never conflicts
    /// with its own prior lock on the resource.
    fn is_compatible(&self, name: &ResourceName, lock_type: LockType, except: TxnNum) -> bool {
        let Some(entry) = self.resources.get(name) else {
            return true;
        };
        entry
            .granted
            .iter()
            .filter_map(|id| self.locks.get(id))
            .filter(|lock| lock.trans_num != except)
            .all(|lock| LockType::compatible(lock.lock_type, lock_type))
    }

    fn has_waiters(&self, name: &ResourceName) -> bool {
        self.resources
            .get(name)
            .is_some_and(|entry| !entry.waiting.is_empty())
    }

    /// Grant `lock_type` on `name`, or change the mode of the lock `txn`
    /// already holds there without moving it in either index.
    fn grant_or_update(&mut self, txn: TxnNum, name: &ResourceName, lock_type: LockType) {
        if let Some(id) = self.held_lock_id(txn, name) {
            if let Some(lock) = self.locks.get_mut(&id) {
                tracing::trace!(
                    txn,
                    resource = %name,
                    from = %lock.lock_type,
                    to = %lock_type,
                    "lock updated"
                );
                lock.lock_type = lock_type;
            }
            return;
        }

        let id = self.next_lock_id;
        self.next_lock_id += 1;
        self.locks
            .insert(id, Lock::new(name.clone(), lock_type, txn));
        self.resources
            .entry(name.clone())
            .or_default()
            .granted
            .push(id);
        self.transaction_locks.entry(txn).or_default().push(id);
        tracing::trace!(txn, resource = %name, lock_type = %lock_type, "lock granted");
    }

    /// Drop `txn`'s lock on `name`, if any, and process the resource queue.
    fn release_lock(&mut self, txn: TxnNum, name: &ResourceName) {
        let Some(id) = self.held_lock_id(txn, name) else {
            return;
        };
        self.locks.remove(&id);
        if let Some(entry) = self.resources.get_mut(name) {
            entry.granted.retain(|held| *held != id);
        }
        if let Some(held) = self.transaction_locks.get_mut(&txn) {
            held.retain(|held| *held != id);
            if held.is_empty() {
                self.transaction_locks.remove(&txn);
            }
        }
        tracing::trace!(txn, resource = %name, "lock released");

        self.process_queue(name);
    }

    fn enqueue(&mut self, name: &ResourceName, request: LockRequest, front: bool) {
        tracing::trace!(
            txn = request.transaction.trans_num(),
            resource = %name,
            lock_type = %request.lock_type,
            front,
            "lock request queued"
        );
        let entry = self.resources.entry(name.clone()).or_default();
        if front {
            entry.waiting.push_front(request);
        } else {
            entry.waiting.push_back(request);
        }
    }

    /// Grant queued requests from the front until one does not fit.
    fn process_queue(&mut self, name: &ResourceName) {
        let mut granted = 0usize;
        loop {
            let Some(request) = self
                .resources
                .get(name)
                .and_then(|entry| entry.waiting.front())
            else {
                break;
            };
            let txn = request.transaction.trans_num();
            if !self.is_compatible(name, request.lock_type, txn) {
                break;
            }
            let Some(request) = self
                .resources
                .get_mut(name)
                .and_then(|entry| entry.waiting.pop_front())
            else {
                break;
            };

            self.grant_or_update(txn, name, request.lock_type);
            for released in &request.release_names {
                self.release_lock(txn, released);
            }
            request.transaction.unblock();
            granted += 1;
        }

        if granted > 0 {
            tracing::debug!(resource = %name, granted, "processed lock queue");
        }
        if self.resources.get(name).is_some_and(ResourceEntry::is_idle) {
            self.resources.remove(name);
        }
    }

    fn snapshot<'a>(&self, ids: impl IntoIterator<Item = &'a LockId>) -> Vec<Lock> {
        ids.into_iter()
            .filter_map(|id| self.locks.get(id))
            .cloned()
            .collect()
    }

    fn locks_of(&self, txn: TxnNum) -> Vec<Lock> {
        self.transaction_locks
            .get(&txn)
            .map(|ids| self.snapshot(ids))
            .unwrap_or_default()
    }
}

/// Keeps track of which transaction holds which lock on which resource and
/// queues the requests that cannot be granted yet.
///
/// Every mutating call runs as one step under a single table-wide mutex. A
/// call that has to wait marks its transaction as blocked while still inside
/// that step, then parks the calling thread after leaving it, so the table is
/// never held by a parked thread.
#[derive(Default)]
pub struct LockManager {
    table: Mutex<LockTable>,
    /// Resources whose descendants may not be locked.
    child_locks_disabled: Mutex<HashSet<ResourceName>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a `lock_type` lock on `name` for `transaction`.
    ///
    /// The lock is granted at once if it is compatible with every other
    /// transaction's lock on `name` and nobody is waiting for `name`.
    /// Otherwise the request goes to the back of the queue and the calling
    /// thread blocks until it is granted.
    ///
    /// # Errors
    ///
    /// - [`LockError::DuplicateLockRequest`] if `transaction` already holds a
    ///   lock on `name`.
    /// - [`LockError::InvalidLock`] if `lock_type` is `NL`.
    pub fn acquire(
        &self,
        transaction: &Arc<TransactionContext>,
        name: &ResourceName,
        lock_type: LockType,
    ) -> LockResult<()> {
        let txn = transaction.trans_num();
        let should_block = {
            let mut table = self.table.lock();
            check_requestable(lock_type, name)?;
            let current = table.lock_type(txn, name);
            if current != LockType::NL {
                return Err(LockError::DuplicateLockRequest(format!(
                    "transaction {txn} already holds {current} on {name}"
                )));
            }

            if table.is_compatible(name, lock_type, txn) && !table.has_waiters(name) {
                table.grant_or_update(txn, name, lock_type);
                false
            } else {
                transaction.prepare_block();
                table.enqueue(
                    name,
                    LockRequest {
                        transaction: transaction.clone(),
                        lock_type,
                        release_names: Vec::new(),
                    },
                    false,
                );
                true
            }
        };

        if should_block {
            transaction.block();
        }
        Ok(())
    }

    /// Acquire a `lock_type` lock on `name` and release the locks
    /// `transaction` holds on `release_names`, as one atomic step.
    ///
    /// Releases only happen once the new lock is granted, and each one
    /// processes the released resource's queue. If `name` itself is in
    /// `release_names`, the existing lock is changed in place and keeps its
    /// acquisition position: after `S(A)`, `X(B)`, acquiring `X(A)` while
    /// releasing `A` leaves the lock on A ahead of the lock on B.
    ///
    /// If the new lock conflicts with another transaction's lock, the request
    /// goes to the front of the queue and the calling thread blocks.
    ///
    /// # Errors
    ///
    /// - [`LockError::DuplicateLockRequest`] if `transaction` holds a lock on
    ///   `name` that is not being released.
    /// - [`LockError::NoLockHeld`] if `transaction` holds no lock on one of
    ///   `release_names`.
    /// - [`LockError::InvalidLock`] if `lock_type` is `NL`.
    pub fn acquire_and_release(
        &self,
        transaction: &Arc<TransactionContext>,
        name: &ResourceName,
        lock_type: LockType,
        release_names: &[ResourceName],
    ) -> LockResult<()> {
        let txn = transaction.trans_num();
        let should_block = {
            let mut table = self.table.lock();
            check_requestable(lock_type, name)?;
            let current = table.lock_type(txn, name);
            if current != LockType::NL && !release_names.contains(name) {
                return Err(LockError::DuplicateLockRequest(format!(
                    "transaction {txn} already holds {current} on {name} and does not release it"
                )));
            }
            if let Some(missing) = release_names
                .iter()
                .find(|release| table.lock_type(txn, release) == LockType::NL)
            {
                return Err(LockError::NoLockHeld(format!(
                    "transaction {txn} holds no lock on {missing} to release"
                )));
            }

            // The lock on `name` itself is updated in place, not released.
            let mut releases: Vec<ResourceName> = Vec::with_capacity(release_names.len());
            for release in release_names {
                if release != name && !releases.contains(release) {
                    releases.push(release.clone());
                }
            }

            if table.is_compatible(name, lock_type, txn) {
                table.grant_or_update(txn, name, lock_type);
                for release in &releases {
                    table.release_lock(txn, release);
                }
                false
            } else {
                transaction.prepare_block();
                table.enqueue(
                    name,
                    LockRequest {
                        transaction: transaction.clone(),
                        lock_type,
                        release_names: releases,
                    },
                    true,
                );
                true
            }
        };

        if should_block {
            transaction.block();
        }
        Ok(())
    }

    /// Release `transaction`'s lock on `name` and process the queue of `name`.
    ///
    /// # Errors
    ///
    /// [`LockError::NoLockHeld`] if `transaction` holds no lock on `name`.
    pub fn release(&self, transaction: &TransactionContext, name: &ResourceName) -> LockResult<()> {
        let txn = transaction.trans_num();
        let mut table = self.table.lock();
        if table.lock_type(txn, name) == LockType::NL {
            return Err(LockError::NoLockHeld(format!(
                "transaction {txn} holds no lock on {name}"
            )));
        }
        table.release_lock(txn, name);
        Ok(())
    }

    /// Release every lock `transaction` holds, most recent first.
    pub fn release_all(&self, transaction: &TransactionContext) {
        let txn = transaction.trans_num();
        let mut table = self.table.lock();
        let held: Vec<ResourceName> = table
            .locks_of(txn)
            .into_iter()
            .rev()
            .map(|lock| lock.name)
            .collect();
        for name in &held {
            table.release_lock(txn, name);
        }
    }

    /// Change `transaction`'s lock on `name` to `new_lock_type` without
    /// changing its acquisition position.
    ///
    /// If the new mode conflicts with another transaction's lock, the request
    /// goes to the front of the queue and the calling thread blocks.
    ///
    /// # Errors
    ///
    /// - [`LockError::NoLockHeld`] if `transaction` holds no lock on `name`.
    /// - [`LockError::DuplicateLockRequest`] if the lock already has mode
    ///   `new_lock_type`.
    /// - [`LockError::InvalidLock`] if `new_lock_type` cannot substitute the
    ///   current mode.
    pub fn promote(
        &self,
        transaction: &Arc<TransactionContext>,
        name: &ResourceName,
        new_lock_type: LockType,
    ) -> LockResult<()> {
        let txn = transaction.trans_num();
        let should_block = {
            let mut table = self.table.lock();
            let current = table.lock_type(txn, name);
            if current == LockType::NL {
                return Err(LockError::NoLockHeld(format!(
                    "transaction {txn} holds no lock on {name}"
                )));
            }
            if current == new_lock_type {
                return Err(LockError::DuplicateLockRequest(format!(
                    "transaction {txn} already holds {current} on {name}"
                )));
            }
            if !LockType::substitutable(new_lock_type, current) {
                return Err(LockError::InvalidLock(format!(
                    "cannot promote {current} to {new_lock_type} on {name}"
                )));
            }

            if table.is_compatible(name, new_lock_type, txn) {
                table.grant_or_update(txn, name, new_lock_type);
                false
            } else {
                transaction.prepare_block();
                table.enqueue(
                    name,
                    LockRequest {
                        transaction: transaction.clone(),
                        lock_type: new_lock_type,
                        release_names: Vec::new(),
                    },
                    true,
                );
                true
            }
        };

        if should_block {
            transaction.block();
        }
        Ok(())
    }

    /// The mode `txn` holds on `name`, `NL` if none.
    pub fn lock_type(&self, txn: TxnNum, name: &ResourceName) -> LockType {
        self.table.lock().lock_type(txn, name)
    }

    /// Locks granted on `name`, in acquisition order.
    pub fn locks_on(&self, name: &ResourceName) -> Vec<Lock> {
        let table = self.table.lock();
        table
            .resources
            .get(name)
            .map(|entry| table.snapshot(&entry.granted))
            .unwrap_or_default()
    }

    /// Locks held by `txn`, in acquisition order.
    pub fn locks_of(&self, txn: TxnNum) -> Vec<Lock> {
        self.table.lock().locks_of(txn)
    }

    /// Locks held by `txn` strictly below `name`, in acquisition order.
    pub fn descendant_locks(&self, txn: TxnNum, name: &ResourceName) -> Vec<Lock> {
        let mut locks = self.locks_of(txn);
        locks.retain(|lock| lock.name.is_descendant_of(name));
        locks
    }

    /// Number of locks `txn` holds on direct children of `name`.
    pub fn num_child_locks(&self, txn: TxnNum, name: &ResourceName) -> usize {
        self.locks_of(txn)
            .iter()
            .filter(|lock| lock.name.parent().as_ref() == Some(name))
            .count()
    }

    /// Number of requests waiting on `name`.
    pub fn num_waiting(&self, name: &ResourceName) -> usize {
        self.table
            .lock()
            .resources
            .get(name)
            .map_or(0, |entry| entry.waiting.len())
    }

    /// Hierarchy handle for the root resource `name`.
    pub fn context(self: &Arc<Self>, name: &str) -> LockContext {
        LockContext::new(self.clone(), ResourceName::new(name))
    }

    /// Hierarchy handle for the database resource, the usual root.
    pub fn database_context(self: &Arc<Self>) -> LockContext {
        self.context("database")
    }

    pub(crate) fn disable_child_locks(&self, name: &ResourceName) {
        self.child_locks_disabled.lock().insert(name.clone());
    }

    pub(crate) fn child_locks_disabled(&self, name: &ResourceName) -> bool {
        self.child_locks_disabled.lock().contains(name)
    }
}

fn check_requestable(lock_type: LockType, name: &ResourceName) -> LockResult<()> {
    if lock_type == LockType::NL {
        return Err(LockError::InvalidLock(format!(
            "cannot request NL on {name}; release the lock instead"
        )));
    }
    Ok(())
}
