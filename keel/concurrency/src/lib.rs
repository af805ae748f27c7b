//! Multigranularity two-phase locking.
//!
//! [`LockManager`] is the flat lock table: it maps resources to granted locks
//! and wait queues and knows nothing about the resource hierarchy.
//! [`LockContext`] layers the database → table → page → record hierarchy on
//! top of it, and [`policy`] computes which intent and base locks a
//! transaction has to request before touching a resource.

pub mod context;
pub mod error;
pub mod lock_type;
pub mod manager;
pub mod policy;
pub mod resource;

pub use context::LockContext;
pub use error::{LockError, LockResult};
pub use lock_type::LockType;
pub use manager::{Lock, LockManager};
pub use policy::{
    HierarchyNode, ensure_appropriate_locks_on_all_ancestors, ensure_sufficient_lock_held,
};
pub use resource::ResourceName;
