//! The six lock modes and the rules relating them.

use std::fmt;

/// A lock mode.
///
/// The intent modes (`IS`, `IX`, `SIX`) announce locks held further down the
/// resource hierarchy.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    /// No lock held.
    NL,
    /// Shared.
    S,
    /// Exclusive.
    X,
    /// Intention shared.
    IS,
    /// Intention exclusive.
    IX,
    /// Shared + intention exclusive.
    SIX,
}

impl LockType {
    /// All modes from least to most authority. Ancestor strengthening picks
    /// the first mode in this order that fits.
    pub const ALL: [LockType; 6] = [
        LockType::NL,
        LockType::S,
        LockType::IS,
        LockType::X,
        LockType::IX,
        LockType::SIX,
    ];

    /// Whether one transaction may hold `a` while another holds `b` on the
    /// same resource.
    pub fn compatible(a: LockType, b: LockType) -> bool {
        use LockType::*;
        if a == NL || b == NL {
            return true;
        }
        match a {
            IS => b != X,
            IX => matches!(b, IS | IX),
            S => matches!(b, IS | S),
            SIX => b == IS,
            X => false,
            NL => true,
        }
    }

    /// The lock that must be held on the parent resource before `self` can be
    /// granted on a child.
    pub fn parent_lock(self) -> LockType {
        use LockType::*;
        match self {
            S | IS => IS,
            X | IX | SIX => IX,
            NL => NL,
        }
    }

    /// Whether holding `parent` on a resource permits granting `child` on one
    /// of its children.
    ///
    /// `SIX` already covers shared access to the whole subtree, so it only
    /// parents `IX` and `X`.
    pub fn can_be_parent_lock(parent: LockType, child: LockType) -> bool {
        use LockType::*;
        match child {
            NL => true,
            IS | S => matches!(parent, IS | IX),
            IX | X => matches!(parent, IX | SIX),
            SIX => parent == IX,
        }
    }

    /// Whether holding `substitute` lets a transaction do everything
    /// `required` would.
    pub fn substitutable(substitute: LockType, required: LockType) -> bool {
        use LockType::*;
        if required == NL {
            return true;
        }
        match substitute {
            NL => false,
            IS => required == IS,
            IX => matches!(required, IS | IX),
            S => matches!(required, IS | S),
            SIX => required != X,
            X => true,
        }
    }

    /// True for `IS`, `IX` and `SIX`.
    pub fn is_intent(self) -> bool {
        matches!(self, LockType::IS | LockType::IX | LockType::SIX)
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockType::NL => "NL",
            LockType::S => "S",
            LockType::X => "X",
            LockType::IS => "IS",
            LockType::IX => "IX",
            LockType::SIX => "SIX",
        };
        f.write_str(name)
    }
}
