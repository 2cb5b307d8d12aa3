//! Identifier newtypes
//!
//! - `Oid`: object identifier, assigned monotonically by the semantic layer
//! - `TxnId`: transaction identifier, assigned by the transaction manager
//! - `SeqId`: 48-bit per-page version counter used by the COW-AVL page
//!
//! Zero is the reserved "none" value for `Oid` and `TxnId`.

use std::fmt;

/// Object identifier
///
/// Assigned monotonically by the semantic layer starting at 1.
/// `Oid::NONE` (zero) means "no object".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Oid(pub u64);

impl Oid {
    /// Reserved "no object" value
    pub const NONE: Oid = Oid(0);

    /// Raw 64-bit value
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// True unless this is the reserved none value
    pub fn is_some(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier
///
/// `TxnId::NONE` (zero) denotes "no transaction / auto-commit".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId(pub u64);

impl TxnId {
    /// Auto-commit sentinel
    pub const NONE: TxnId = TxnId(0);

    /// Raw 64-bit value
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// True when an explicit transaction is named
    pub fn is_some(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 48-bit sequence identifier
///
/// Kept inside each COW-AVL page, separate from `TxnId`; strictly increases
/// on every successful page-local commit. The all-ones value marks a node
/// that has not died.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeqId(pub u64);

impl SeqId {
    /// Death marker for live nodes (all 48 bits set)
    pub const MAX_DEATH: u64 = 0xffff_ffff_ffff;

    /// Raw value, guaranteed to fit in 48 bits
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Next sequence value
    pub fn next(&self) -> SeqId {
        debug_assert!(self.0 < Self::MAX_DEATH);
        SeqId(self.0 + 1)
    }
}

impl fmt::Display for SeqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_none() {
        assert!(!Oid::NONE.is_some());
        assert!(Oid(1).is_some());
        assert_eq!(Oid::NONE.as_u64(), 0);
    }

    #[test]
    fn test_txn_id_auto_commit() {
        assert!(!TxnId::NONE.is_some());
        assert!(TxnId(42).is_some());
    }

    #[test]
    fn test_seqid_next() {
        assert_eq!(SeqId(1).next(), SeqId(2));
        assert!(SeqId::MAX_DEATH > (1u64 << 47));
    }
}
