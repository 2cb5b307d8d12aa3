//! Sorted-set object type
//!
//! Per-object state is a two-level structure: an ordered node table routes
//! each key to the node owning its range, and every node pairs an
//! in-memory write buffer with at most one immutable block. The empty-key
//! sentinel node always exists and owns `(-∞, first-key)`.
//!
//! Writes land in the write buffer (a remove of a block-resident key
//! leaves a tombstone). The commit hook promotes staged buffer mutations;
//! once a node's buffer crosses the sync threshold, the sync pass encodes
//! buffers into fresh blocks, merges them with the node's old block where
//! ranges overlap or blocks run underfull, and rebuilds the node table
//! with one node per emitted block.
//!
//! Transactional writes do not touch the buffer: they park in the
//! key-locked pending table and reach the buffer through `apply` when the
//! transaction commits.

pub mod block;
pub(crate) mod merge;

use parking_lot::MutexGuard;
use raleighsl_core::bytes::ByteRef;
use raleighsl_core::{Errno, RslResult, TxnId};
use smallvec::SmallVec;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::engine::Engine;
use crate::object::{Object, ObjectType};
use crate::sset::block::{SsetBlock, SsetBlockBuilder};
use crate::sset::merge::{KWayMerge, MergeItem};
use crate::transaction::Transaction;

/// Pending per-key mutation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Insert,
    Update,
    Remove,
}

struct TxnLock {
    txn_id: TxnId,
    kind: PendingKind,
    value: ByteRef,
}

/// Buffer entry: `None` is a tombstone shadowing a block-resident key
type BufEntry = Option<ByteRef>;

struct Node {
    buffer: BTreeMap<ByteRef, BufEntry>,
    block: Option<Arc<SsetBlock>>,
    bufsize: usize,
}

impl Node {
    fn empty() -> Node {
        Node {
            buffer: BTreeMap::new(),
            block: None,
            bufsize: 0,
        }
    }

    fn with_block(block: Arc<SsetBlock>) -> Node {
        Node {
            buffer: BTreeMap::new(),
            block: Some(block),
            bufsize: 0,
        }
    }
}

struct StagedOp {
    node_key: ByteRef,
    key: ByteRef,
    /// Buffer state before the op: absent, or the previous entry
    prev: Option<BufEntry>,
}

/// In-memory state of one sorted-set object
pub struct SsetState {
    nodes: BTreeMap<ByteRef, Node>,
    txn_locks: BTreeMap<ByteRef, TxnLock>,
    dirty: BTreeSet<ByteRef>,
    staged: Vec<StagedOp>,
}

impl SsetState {
    fn new() -> SsetState {
        let mut nodes = BTreeMap::new();
        nodes.insert(ByteRef::empty(), Node::empty());
        SsetState {
            nodes,
            txn_locks: BTreeMap::new(),
            dirty: BTreeSet::new(),
            staged: Vec::new(),
        }
    }
}

/// Atom payload registered with the transaction manager
///
/// The atom carries only the key; the fold state lives in the pending
/// table, so a pending pair that annihilated (insert then remove) leaves
/// the atom to no-op at apply time.
struct SsetMutation {
    key: ByteRef,
}

fn entry_cost(key: &ByteRef, value: &BufEntry) -> usize {
    key.len() + value.as_ref().map_or(0, |v| v.len())
}

fn with_state<R>(
    object: &Object,
    f: impl FnOnce(&mut SsetState) -> RslResult<R>,
) -> RslResult<R> {
    let mut guard: MutexGuard<'_, Option<Box<dyn Any + Send>>> = object.membufs();
    let state = guard
        .as_mut()
        .ok_or(Errno::PluginNotLoaded)?
        .downcast_mut::<SsetState>()
        .ok_or(Errno::ObjectWrongType)?;
    f(state)
}

/// Lower-bound routing: the node owning `key`'s range
fn route_key(state: &SsetState, key: &[u8]) -> ByteRef {
    state
        .nodes
        .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
        .next_back()
        .map(|(k, _)| k.clone())
        .expect("the sentinel node always routes")
}

enum Hit {
    Live(ByteRef),
    Tombstone,
    Miss,
}

fn node_lookup(node: &Node, key: &[u8]) -> Hit {
    match node.buffer.get(key) {
        Some(Some(value)) => Hit::Live(value.clone()),
        Some(None) => Hit::Tombstone,
        None => match &node.block {
            Some(block) => SsetBlock::lookup(block, key).map(Hit::Live).unwrap_or(Hit::Miss),
            None => Hit::Miss,
        },
    }
}

fn node_contains(node: &Node, key: &[u8]) -> bool {
    matches!(node_lookup(node, key), Hit::Live(_))
}

// ============================================================================
// Staged buffer mutations (promoted by commit, undone by rollback)
// ============================================================================

fn staged_put(state: &mut SsetState, node_key: &ByteRef, key: ByteRef, value: BufEntry) {
    let node = state.nodes.get_mut(node_key).expect("routed node exists");
    let prev = node.buffer.insert(key.clone(), value.clone());
    if let Some(prev_entry) = &prev {
        node.bufsize -= entry_cost(&key, prev_entry);
    }
    node.bufsize += entry_cost(&key, &value);
    state.staged.push(StagedOp {
        node_key: node_key.clone(),
        key,
        prev,
    });
    state.dirty.insert(node_key.clone());
}

fn staged_remove(state: &mut SsetState, node_key: &ByteRef, key: &ByteRef) {
    let node = state.nodes.get_mut(node_key).expect("routed node exists");
    let prev = node.buffer.remove(key);
    if let Some(prev_entry) = &prev {
        node.bufsize -= entry_cost(key, prev_entry);
    }
    state.staged.push(StagedOp {
        node_key: node_key.clone(),
        key: key.clone(),
        prev,
    });
    state.dirty.insert(node_key.clone());
}

fn apply_insert(state: &mut SsetState, key: ByteRef, value: ByteRef) -> RslResult<()> {
    let node_key = route_key(state, key.as_slice());
    staged_put(state, &node_key, key, Some(value));
    Ok(())
}

fn apply_update(state: &mut SsetState, key: ByteRef, value: ByteRef) -> RslResult<()> {
    let node_key = route_key(state, key.as_slice());
    {
        let node = state.nodes.get(&node_key).expect("routed node exists");
        if !node_contains(node, key.as_slice()) {
            return Err(Errno::DataKeyNotFound);
        }
    }
    staged_put(state, &node_key, key, Some(value));
    Ok(())
}

fn apply_remove(state: &mut SsetState, key: &ByteRef) -> RslResult<()> {
    let node_key = route_key(state, key.as_slice());
    let (in_buffer, in_block) = {
        let node = state.nodes.get(&node_key).expect("routed node exists");
        let in_buffer = match node.buffer.get(key.as_slice()) {
            Some(Some(_)) => true,
            Some(None) => return Err(Errno::DataKeyNotFound),
            None => false,
        };
        let in_block = node
            .block
            .as_ref()
            .map(|block| SsetBlock::lookup(block, key.as_slice()).is_some())
            .unwrap_or(false);
        (in_buffer, in_block)
    };

    if in_block {
        // the block copy must stay shadowed until the next merge
        staged_put(state, &node_key, key.clone(), None);
        Ok(())
    } else if in_buffer {
        staged_remove(state, &node_key, key);
        Ok(())
    } else {
        Err(Errno::DataKeyNotFound)
    }
}

// ============================================================================
// Pending-table registration
// ============================================================================

fn txn_add(
    fs: &Engine,
    state: &mut SsetState,
    txn: &Arc<Transaction>,
    object: &Arc<Object>,
    kind: PendingKind,
    key: ByteRef,
    value: ByteRef,
) -> RslResult<()> {
    state.txn_locks.insert(
        key.clone(),
        TxnLock {
            txn_id: txn.txn_id(),
            kind,
            value,
        },
    );
    if let Err(errno) = fs.transaction_add(txn, object, Box::new(SsetMutation { key: key.clone() })) {
        state.txn_locks.remove(key.as_slice());
        return Err(errno);
    }
    Ok(())
}

// ============================================================================
// Public write operations
// ============================================================================

/// Insert `key`; with `allow_update` an existing key is overwritten
pub fn insert(
    fs: &Engine,
    txn: Option<&Arc<Transaction>>,
    object: &Arc<Object>,
    allow_update: bool,
    key: ByteRef,
    value: ByteRef,
) -> RslResult<()> {
    with_state(object, |state| {
        if let Some(lock) = state.txn_locks.get_mut(key.as_slice()) {
            let same = txn.map(|t| t.txn_id()) == Some(lock.txn_id);
            if !same {
                return Err(Errno::TxnLockedKey);
            }
            // fold into the pending mutation; a pending update always
            // rejects an insert, the key logically exists
            match lock.kind {
                PendingKind::Insert => lock.value = value,
                PendingKind::Update => return Err(Errno::DataKeyExists),
                PendingKind::Remove => {
                    lock.value = value;
                    lock.kind = PendingKind::Update;
                }
            }
            return Ok(());
        }

        let node_key = route_key(state, key.as_slice());
        if !allow_update {
            let node = state.nodes.get(&node_key).expect("routed node exists");
            if node_contains(node, key.as_slice()) {
                return Err(Errno::DataKeyExists);
            }
        }

        match txn {
            Some(txn) => txn_add(fs, state, txn, object, PendingKind::Insert, key, value),
            None => apply_insert(state, key, value),
        }
    })
}

/// Overwrite an existing key as a single atomic step
///
/// Never exposes a removed-but-not-reinserted intermediate state.
pub fn update(
    fs: &Engine,
    txn: Option<&Arc<Transaction>>,
    object: &Arc<Object>,
    key: ByteRef,
    value: ByteRef,
) -> RslResult<()> {
    with_state(object, |state| {
        if let Some(lock) = state.txn_locks.get_mut(key.as_slice()) {
            let same = txn.map(|t| t.txn_id()) == Some(lock.txn_id);
            if !same {
                return Err(Errno::TxnLockedKey);
            }
            match lock.kind {
                PendingKind::Insert | PendingKind::Update => lock.value = value,
                PendingKind::Remove => {
                    lock.value = value;
                    lock.kind = PendingKind::Update;
                }
            }
            return Ok(());
        }

        let node_key = route_key(state, key.as_slice());
        {
            let node = state.nodes.get(&node_key).expect("routed node exists");
            if !node_contains(node, key.as_slice()) {
                return Err(Errno::DataKeyNotFound);
            }
        }

        match txn {
            Some(txn) => txn_add(fs, state, txn, object, PendingKind::Update, key, value),
            None => apply_update(state, key, value),
        }
    })
}

/// Remove `key`
///
/// A transactional remove of a missing key reports `DataKeyNotFound`
/// without taking a key lock.
pub fn remove(
    fs: &Engine,
    txn: Option<&Arc<Transaction>>,
    object: &Arc<Object>,
    key: ByteRef,
) -> RslResult<()> {
    with_state(object, |state| {
        if let Some(lock) = state.txn_locks.get_mut(key.as_slice()) {
            let same = txn.map(|t| t.txn_id()) == Some(lock.txn_id);
            if !same {
                return Err(Errno::TxnLockedKey);
            }
            match lock.kind {
                PendingKind::Insert => {
                    // pending insert + remove annihilate; the atom no-ops
                    state.txn_locks.remove(key.as_slice());
                }
                PendingKind::Update | PendingKind::Remove => lock.kind = PendingKind::Remove,
            }
            return Ok(());
        }

        match txn {
            Some(txn) => {
                let node_key = route_key(state, key.as_slice());
                let node = state.nodes.get(&node_key).expect("routed node exists");
                if !node_contains(node, key.as_slice()) {
                    return Err(Errno::DataKeyNotFound);
                }
                txn_add(
                    fs,
                    state,
                    txn,
                    object,
                    PendingKind::Remove,
                    key,
                    ByteRef::empty(),
                )
            }
            None => apply_remove(state, &key),
        }
    })
}

// ============================================================================
// Public read operations
// ============================================================================

/// Point lookup
///
/// Inside a transaction, the transaction's own pending mutation wins;
/// other transactions' pending work is never observed.
pub fn get(
    _fs: &Engine,
    txn: Option<&Arc<Transaction>>,
    object: &Object,
    key: &[u8],
) -> RslResult<ByteRef> {
    with_state(object, |state| {
        if let Some(txn) = txn {
            if let Some(lock) = state.txn_locks.get(key) {
                if lock.txn_id == txn.txn_id() {
                    return match lock.kind {
                        PendingKind::Remove => Err(Errno::DataKeyNotFound),
                        _ => Ok(lock.value.clone()),
                    };
                }
            }
        }

        let node_key = route_key(state, key);
        let node = state.nodes.get(&node_key).expect("routed node exists");
        match node_lookup(node, key) {
            Hit::Live(value) => Ok(value),
            Hit::Tombstone | Hit::Miss => Err(Errno::DataKeyNotFound),
        }
    })
}

/// Ordered range scan
///
/// Emits up to `count` pairs starting at `start` (inclusive when
/// `include_start`), merging each node's block with its write buffer and
/// substituting the calling transaction's pending values.
pub fn scan(
    _fs: &Engine,
    txn: Option<&Arc<Transaction>>,
    object: &Object,
    start: Option<&[u8]>,
    include_start: bool,
    count: usize,
) -> RslResult<(Vec<ByteRef>, Vec<ByteRef>)> {
    with_state(object, |state| {
        let mut keys = Vec::new();
        let mut values = Vec::new();
        let mut remaining = count;

        let first_node = start.map(|s| route_key(state, s));
        let node_keys: SmallVec<[ByteRef; 8]> = match &first_node {
            Some(first) => state
                .nodes
                .range::<[u8], _>((Bound::Included(first.as_slice()), Bound::Unbounded))
                .map(|(k, _)| k.clone())
                .collect(),
            None => state.nodes.keys().cloned().collect(),
        };

        'nodes: for (idx, node_key) in node_keys.iter().enumerate() {
            let node = state.nodes.get(node_key).expect("listed above");
            let node_start = if idx == 0 { start } else { None };

            let mut merge = KWayMerge::new();
            let buffer_iter: Box<dyn Iterator<Item = MergeItem> + '_> = match node_start {
                Some(s) => {
                    let lower = if include_start {
                        Bound::Included(s)
                    } else {
                        Bound::Excluded(s)
                    };
                    Box::new(node.buffer.range::<[u8], _>((lower, Bound::Unbounded)).map(
                        |(k, v)| MergeItem {
                            key: k.clone(),
                            value: v.clone(),
                        },
                    ))
                }
                None => Box::new(node.buffer.iter().map(|(k, v)| MergeItem {
                    key: k.clone(),
                    value: v.clone(),
                })),
            };
            merge.add(buffer_iter);

            if let Some(block) = &node.block {
                merge.add(Box::new(SsetBlock::iter_from(block, node_start, include_start).map(
                    |(key, value)| MergeItem {
                        key,
                        value: Some(value),
                    },
                )));
            }

            for item in merge {
                if remaining == 0 {
                    break 'nodes;
                }
                if let Some(txn) = txn {
                    if let Some(lock) = state.txn_locks.get(item.key.as_slice()) {
                        if lock.txn_id == txn.txn_id() {
                            if lock.kind == PendingKind::Remove {
                                continue;
                            }
                            keys.push(item.key);
                            values.push(lock.value.clone());
                            remaining -= 1;
                            continue;
                        }
                    }
                }
                let Some(value) = item.value else {
                    // tombstone
                    continue;
                };
                keys.push(item.key);
                values.push(value);
                remaining -= 1;
            }
        }

        Ok((keys, values))
    })
}

// ============================================================================
// Sync (merge) pass
// ============================================================================

fn sync_state(state: &mut SsetState, block_size: usize, merge_fraction: f32, threshold: usize) {
    let dirty: Vec<ByteRef> = std::mem::take(&mut state.dirty).into_iter().collect();
    let mut emitted: Vec<Arc<SsetBlock>> = Vec::new();
    let mut synced = 0usize;

    for node_key in dirty {
        let over_threshold = state
            .nodes
            .get(&node_key)
            .map(|node| node.bufsize >= threshold)
            .unwrap_or(false);
        if !over_threshold {
            continue;
        }
        let node = state.nodes.remove(&node_key).expect("checked above");
        synced += 1;

        // encode the buffer into fresh blocks, keeping tombstones aside
        let mut fresh_builder = SsetBlockBuilder::new(block_size);
        let mut tombstones: BTreeSet<ByteRef> = BTreeSet::new();
        for (key, value) in &node.buffer {
            match value {
                Some(value) => fresh_builder.push(key, value),
                None => {
                    tombstones.insert(key.clone());
                }
            }
        }
        let fresh = fresh_builder.finish();

        match node.block {
            None => emitted.extend(fresh),
            Some(old) => {
                // full blocks with ranges clear of the old one pass through
                let merge_limit = (merge_fraction * block_size as f32) as usize;
                let mut to_merge: Vec<Arc<SsetBlock>> = Vec::new();
                for block in fresh {
                    let disjoint =
                        !block.overlaps(old.first_key().as_slice(), old.last_key().as_slice());
                    if block.available() < merge_limit && disjoint {
                        emitted.push(block);
                    } else {
                        to_merge.push(block);
                    }
                }

                if to_merge.is_empty() && tombstones.is_empty() {
                    emitted.push(old);
                    continue;
                }

                let mut merge = KWayMerge::new();
                for block in &to_merge {
                    merge.add(Box::new(SsetBlock::iter_from(block, None, true).map(|(key, value)| {
                        MergeItem {
                            key,
                            value: Some(value),
                        }
                    })));
                }
                merge.add(Box::new(SsetBlock::iter_from(&old, None, true).map(|(key, value)| {
                    MergeItem {
                        key,
                        value: Some(value),
                    }
                })));

                let mut out = SsetBlockBuilder::new(block_size);
                for item in merge {
                    if tombstones.contains(&item.key) {
                        continue;
                    }
                    let value = item.value.expect("block entries always carry a value");
                    out.push(&item.key, &value);
                }
                emitted.extend(out.finish());
            }
        }
    }

    debug!(synced, blocks = emitted.len(), "sorted-set sync pass");

    for block in emitted {
        let node_key = block.first_key().clone();
        state.nodes.insert(node_key, Node::with_block(block));
    }

    // the empty-key sentinel must always route
    state
        .nodes
        .entry(ByteRef::empty())
        .or_insert_with(Node::empty);
}

// ============================================================================
// Object type v-table
// ============================================================================

struct SsetType;

/// Sorted-set type v-table
pub fn sset_type() -> Arc<dyn ObjectType> {
    Arc::new(SsetType)
}

impl ObjectType for SsetType {
    fn label(&self) -> &'static str {
        "sset"
    }

    fn create(&self, _fs: &Engine, object: &Object) -> RslResult<()> {
        let mut membufs = object.membufs();
        debug_assert!(membufs.is_none(), "create on an open object");
        *membufs = Some(Box::new(SsetState::new()));
        Ok(())
    }

    fn close(&self, _fs: &Engine, object: &Object) -> RslResult<()> {
        object.membufs().take();
        Ok(())
    }

    fn sync(&self, fs: &Engine, object: &Object) -> RslResult<()> {
        let config = fs.config();
        with_state(object, |state| {
            sync_state(
                state,
                config.sset_block_size as usize,
                config.sset_block_merge_fraction,
                config.sset_sync_threshold as usize,
            );
            Ok(())
        })
    }

    fn commit(&self, fs: &Engine, object: &Object) -> RslResult<()> {
        let threshold = fs.config().sset_sync_threshold as usize;
        let do_flush = with_state(object, |state| {
            state.staged.clear();
            Ok(state
                .dirty
                .iter()
                .any(|node_key| {
                    state
                        .nodes
                        .get(node_key)
                        .map(|node| node.bufsize >= threshold)
                        .unwrap_or(false)
                }))
        })?;
        if do_flush {
            self.sync(fs, object)?;
        }
        Ok(())
    }

    fn rollback(&self, _fs: &Engine, object: &Object) -> RslResult<()> {
        with_state(object, |state| {
            while let Some(op) = state.staged.pop() {
                let node = match state.nodes.get_mut(&op.node_key) {
                    Some(node) => node,
                    None => continue,
                };
                let current = node.buffer.remove(&op.key);
                if let Some(entry) = &current {
                    node.bufsize -= entry_cost(&op.key, entry);
                }
                if let Some(prev_entry) = op.prev {
                    node.bufsize += entry_cost(&op.key, &prev_entry);
                    node.buffer.insert(op.key, prev_entry);
                }
            }
            Ok(())
        })
    }

    fn apply(&self, _fs: &Engine, object: &Object, mutation: Box<dyn Any + Send>) -> RslResult<()> {
        let mutation = mutation
            .downcast::<SsetMutation>()
            .map_err(|_| Errno::ObjectWrongType)?;
        with_state(object, |state| {
            // an annihilated pending pair leaves no lock; nothing to do
            let Some(lock) = state.txn_locks.remove(mutation.key.as_slice()) else {
                trace!(key = ?mutation.key, "atom with no pending lock, skipping");
                return Ok(());
            };
            match lock.kind {
                PendingKind::Insert => apply_insert(state, mutation.key, lock.value),
                PendingKind::Update => apply_update(state, mutation.key, lock.value),
                PendingKind::Remove => apply_remove(state, &mutation.key),
            }
        })
    }

    fn revert(&self, _fs: &Engine, object: &Object, mutation: Box<dyn Any + Send>) -> RslResult<()> {
        let mutation = mutation
            .downcast::<SsetMutation>()
            .map_err(|_| Errno::ObjectWrongType)?;
        with_state(object, |state| {
            state.txn_locks.remove(mutation.key.as_slice());
            Ok(())
        })
    }
}
