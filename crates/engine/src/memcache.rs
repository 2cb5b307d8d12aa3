//! Memcache object type
//!
//! A flat key/value table with the memcache entry shape: value bytes plus
//! client flags, an absolute expiry time and a CAS stamp bumped on every
//! store. No wire protocol lives here; adapters speak it elsewhere.
//!
//! Expiry is logical: expired entries are treated as absent at read time
//! and overwritten in place by stores. Transactional stores park in a
//! per-key pending table and reach the live table through `apply`, the
//! same shape the sorted set uses.

use parking_lot::MutexGuard;
use raleighsl_core::bytes::ByteRef;
use raleighsl_core::{Errno, RslResult, TxnId};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::trace;

use crate::engine::Engine;
use crate::object::{Object, ObjectType};
use crate::transaction::Transaction;

/// One stored item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McEntry {
    /// Value bytes
    pub value: ByteRef,
    /// Opaque client flags
    pub flags: u32,
    /// Absolute unix expiry in seconds; 0 never expires
    pub exptime: u32,
    /// Store stamp; distinct for every accepted store
    pub cas: u64,
}

/// Store admission modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Unconditional upsert
    Set,
    /// Only if the key is absent
    Add,
    /// Only if the key is present
    Replace,
}

enum McPending {
    Store {
        value: ByteRef,
        flags: u32,
        exptime: u32,
    },
    Delete,
}

struct McLock {
    txn_id: TxnId,
    pending: McPending,
}

/// In-memory state of one memcache object
pub struct McState {
    table: FxHashMap<ByteRef, McEntry>,
    txn_locks: FxHashMap<ByteRef, McLock>,
    staged: Vec<(ByteRef, Option<McEntry>)>,
    next_cas: u64,
}

struct McMutation {
    key: ByteRef,
}

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn is_expired(entry: &McEntry) -> bool {
    entry.exptime != 0 && entry.exptime < now_secs()
}

fn with_state<R>(object: &Object, f: impl FnOnce(&mut McState) -> RslResult<R>) -> RslResult<R> {
    let mut guard: MutexGuard<'_, Option<Box<dyn Any + Send>>> = object.membufs();
    let state = guard
        .as_mut()
        .ok_or(Errno::PluginNotLoaded)?
        .downcast_mut::<McState>()
        .ok_or(Errno::ObjectWrongType)?;
    f(state)
}

fn live_entry<'a>(state: &'a McState, key: &ByteRef) -> Option<&'a McEntry> {
    state.table.get(key).filter(|entry| !is_expired(entry))
}

fn staged_store(state: &mut McState, key: ByteRef, value: ByteRef, flags: u32, exptime: u32) {
    state.next_cas += 1;
    let entry = McEntry {
        value,
        flags,
        exptime,
        cas: state.next_cas,
    };
    let prev = state.table.insert(key.clone(), entry);
    state.staged.push((key, prev));
}

fn staged_delete(state: &mut McState, key: &ByteRef) {
    let prev = state.table.remove(key);
    state.staged.push((key.clone(), prev));
}

// ============================================================================
// Public operations
// ============================================================================

/// Store `key` under the given admission mode
#[allow(clippy::too_many_arguments)]
pub fn store(
    fs: &Engine,
    txn: Option<&Arc<Transaction>>,
    object: &Arc<Object>,
    mode: StoreMode,
    key: ByteRef,
    value: ByteRef,
    flags: u32,
    exptime: u32,
) -> RslResult<()> {
    with_state(object, |state| {
        if let Some(lock) = state.txn_locks.get_mut(&key) {
            let same = txn.map(|t| t.txn_id()) == Some(lock.txn_id);
            if !same {
                return Err(Errno::TxnLockedKey);
            }
            let pending_absent = matches!(lock.pending, McPending::Delete);
            match mode {
                StoreMode::Add if !pending_absent => return Err(Errno::DataKeyExists),
                StoreMode::Replace if pending_absent => return Err(Errno::DataKeyNotFound),
                _ => {}
            }
            lock.pending = McPending::Store {
                value,
                flags,
                exptime,
            };
            return Ok(());
        }

        let present = live_entry(state, &key).is_some();
        match mode {
            StoreMode::Add if present => return Err(Errno::DataKeyExists),
            StoreMode::Replace if !present => return Err(Errno::DataKeyNotFound),
            _ => {}
        }

        match txn {
            Some(txn) => {
                state.txn_locks.insert(
                    key.clone(),
                    McLock {
                        txn_id: txn.txn_id(),
                        pending: McPending::Store {
                            value,
                            flags,
                            exptime,
                        },
                    },
                );
                fs.transaction_add(txn, object, Box::new(McMutation { key }))
            }
            None => {
                staged_store(state, key, value, flags, exptime);
                Ok(())
            }
        }
    })
}

/// Remove `key`
pub fn delete(
    fs: &Engine,
    txn: Option<&Arc<Transaction>>,
    object: &Arc<Object>,
    key: ByteRef,
) -> RslResult<()> {
    with_state(object, |state| {
        if let Some(lock) = state.txn_locks.get_mut(&key) {
            let same = txn.map(|t| t.txn_id()) == Some(lock.txn_id);
            if !same {
                return Err(Errno::TxnLockedKey);
            }
            if matches!(lock.pending, McPending::Delete) {
                return Err(Errno::DataKeyNotFound);
            }
            lock.pending = McPending::Delete;
            return Ok(());
        }

        if live_entry(state, &key).is_none() {
            return Err(Errno::DataKeyNotFound);
        }

        match txn {
            Some(txn) => {
                state.txn_locks.insert(
                    key.clone(),
                    McLock {
                        txn_id: txn.txn_id(),
                        pending: McPending::Delete,
                    },
                );
                fs.transaction_add(txn, object, Box::new(McMutation { key }))
            }
            None => {
                staged_delete(state, &key);
                Ok(())
            }
        }
    })
}

/// Fetch `key`
///
/// Inside a transaction the transaction's own pending store wins; a
/// pending store reads back with CAS 0 until it commits.
pub fn get(
    _fs: &Engine,
    txn: Option<&Arc<Transaction>>,
    object: &Object,
    key: &ByteRef,
) -> RslResult<McEntry> {
    with_state(object, |state| {
        if let Some(txn) = txn {
            if let Some(lock) = state.txn_locks.get(key) {
                if lock.txn_id == txn.txn_id() {
                    return match &lock.pending {
                        McPending::Delete => Err(Errno::DataKeyNotFound),
                        McPending::Store {
                            value,
                            flags,
                            exptime,
                        } => Ok(McEntry {
                            value: value.clone(),
                            flags: *flags,
                            exptime: *exptime,
                            cas: 0,
                        }),
                    };
                }
            }
        }
        live_entry(state, key)
            .cloned()
            .ok_or(Errno::DataKeyNotFound)
    })
}

// ============================================================================
// Object type v-table
// ============================================================================

struct MemcacheType;

/// Memcache type v-table
pub fn memcache_type() -> Arc<dyn ObjectType> {
    Arc::new(MemcacheType)
}

impl ObjectType for MemcacheType {
    fn label(&self) -> &'static str {
        "memcache"
    }

    fn create(&self, _fs: &Engine, object: &Object) -> RslResult<()> {
        let mut membufs = object.membufs();
        debug_assert!(membufs.is_none(), "create on an open object");
        *membufs = Some(Box::new(McState {
            table: FxHashMap::default(),
            txn_locks: FxHashMap::default(),
            staged: Vec::new(),
            next_cas: 0,
        }));
        Ok(())
    }

    fn close(&self, _fs: &Engine, object: &Object) -> RslResult<()> {
        object.membufs().take();
        Ok(())
    }

    fn commit(&self, _fs: &Engine, object: &Object) -> RslResult<()> {
        with_state(object, |state| {
            state.staged.clear();
            Ok(())
        })
    }

    fn rollback(&self, _fs: &Engine, object: &Object) -> RslResult<()> {
        with_state(object, |state| {
            while let Some((key, prev)) = state.staged.pop() {
                match prev {
                    Some(entry) => {
                        state.table.insert(key, entry);
                    }
                    None => {
                        state.table.remove(&key);
                    }
                }
            }
            Ok(())
        })
    }

    fn apply(&self, _fs: &Engine, object: &Object, mutation: Box<dyn Any + Send>) -> RslResult<()> {
        let mutation = mutation
            .downcast::<McMutation>()
            .map_err(|_| Errno::ObjectWrongType)?;
        with_state(object, |state| {
            let Some(lock) = state.txn_locks.remove(&mutation.key) else {
                trace!(key = ?mutation.key, "atom with no pending lock, skipping");
                return Ok(());
            };
            match lock.pending {
                McPending::Store {
                    value,
                    flags,
                    exptime,
                } => staged_store(state, mutation.key, value, flags, exptime),
                McPending::Delete => staged_delete(state, &mutation.key),
            }
            Ok(())
        })
    }

    fn revert(&self, _fs: &Engine, object: &Object, mutation: Box<dyn Any + Send>) -> RslResult<()> {
        let mutation = mutation
            .downcast::<McMutation>()
            .map_err(|_| Errno::ObjectWrongType)?;
        with_state(object, |state| {
            state.txn_locks.remove(&mutation.key);
            Ok(())
        })
    }
}
