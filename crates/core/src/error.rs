//! Error taxonomy for the RaleighSL engine
//!
//! Every type hook and every `exec_*` path reports an `Errno`. The
//! discriminants are grouped the way adapters consume them:
//!
//! - **Resource**: allocation and space exhaustion
//! - **Naming**: semantic-layer failures
//! - **Data**: per-key failures inside a type engine
//! - **Transactional**: transaction lifecycle failures
//! - **Control**: scheduler-internal signals that never reach a notifier
//!
//! Each errno carries a short stable byte-string name (`byte_slice`) so
//! wire adapters can surface a status code without hard-coding strings.

use thiserror::Error;

/// Result alias for engine operations
pub type RslResult<T> = std::result::Result<T, Errno>;

/// Error kinds produced by the engine core
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Errno {
    /// Allocation failed
    #[error("out of memory")]
    NoMemory,

    /// The backing device has no room left
    #[error("no space left on device")]
    NoSpaceOnDevice,

    /// A fixed-size page cannot hold the requested mutation
    #[error("page is full")]
    PageFull,

    /// No object is mapped to the requested name or OID
    #[error("object not found")]
    ObjectNotFound,

    /// The requested name is already mapped
    #[error("object already exists")]
    ObjectExists,

    /// The object exists but its type does not support the operation
    #[error("object has the wrong type")]
    ObjectWrongType,

    /// The object has no type attached yet
    #[error("object type not loaded")]
    PluginNotLoaded,

    /// The key is not present in the object
    #[error("key not found")]
    DataKeyNotFound,

    /// The key is already present in the object
    #[error("key already exists")]
    DataKeyExists,

    /// No live transaction has the requested id
    #[error("transaction not found")]
    TxnNotFound,

    /// The transaction is past its commit acquire and takes no more work
    #[error("transaction closed")]
    TxnClosed,

    /// Another transaction holds a pending mutation on the key
    #[error("key locked by another transaction")]
    TxnLockedKey,

    /// The transaction was rolled back instead of committed
    #[error("transaction rolled back")]
    TxnRolledBack,

    /// Scheduler signal: the operation is not complete, keep the task attached
    #[error("yield to scheduler")]
    SchedYield,

    /// The type does not implement the invoked hook
    #[error("not implemented")]
    NotImplemented,
}

impl Errno {
    /// Short stable name for wire framing.
    ///
    /// Adapters embed these byte strings in status lines; they are part of
    /// the external contract and never change once shipped.
    pub fn byte_slice(&self) -> &'static [u8] {
        match self {
            Errno::NoMemory => b"NO_MEMORY",
            Errno::NoSpaceOnDevice => b"NO_SPACE_ON_DEVICE",
            Errno::PageFull => b"PAGE_FULL",
            Errno::ObjectNotFound => b"OBJECT_NOT_FOUND",
            Errno::ObjectExists => b"OBJECT_EXISTS",
            Errno::ObjectWrongType => b"OBJECT_WRONG_TYPE",
            Errno::PluginNotLoaded => b"PLUGIN_NOT_LOADED",
            Errno::DataKeyNotFound => b"DATA_KEY_NOT_FOUND",
            Errno::DataKeyExists => b"DATA_KEY_EXISTS",
            Errno::TxnNotFound => b"TXN_NOT_FOUND",
            Errno::TxnClosed => b"TXN_CLOSED",
            Errno::TxnLockedKey => b"TXN_LOCKED_KEY",
            Errno::TxnRolledBack => b"TXN_ROLLEDBACK",
            Errno::SchedYield => b"SCHED_YIELD",
            Errno::NotImplemented => b"NOT_IMPLEMENTED",
        }
    }

    /// True for the scheduler-internal yield signal.
    ///
    /// A read function returns `SchedYield` to mean "not complete, keep me
    /// attached"; the object scheduler consumes it before any notifier runs.
    pub fn is_sched_yield(&self) -> bool {
        matches!(self, Errno::SchedYield)
    }

    /// True when the caller may retry the same operation later.
    ///
    /// `TxnLockedKey` clears when the holding transaction completes;
    /// `NoMemory` may clear under memory pressure relief.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Errno::TxnLockedKey | Errno::NoMemory)
    }
}
