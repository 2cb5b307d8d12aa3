//! Transactions and the two-phase commit scheduler
//!
//! A transaction collects object-groups, one per touched object, each
//! holding the submission-ordered list of atoms (pending mutations). The
//! commit task walks a six-state machine:
//!
//! ```text
//!   ACQUIRE → BARRIER → LOCK → WRITE → COMMIT → COMPLETE
//! ```
//!
//! ACQUIRE closes the transaction to new atoms. BARRIER atomically marks
//! every touched object as owned by this transaction (under the manager's
//! barrier lock) or defers behind the conflicting owner. LOCK drains each
//! object's in-flight readers and writers. WRITE transfers the atoms to
//! the type engines (or reverts them). COMMIT promotes the applied
//! effects. COMPLETE settles the fate, releases everything and notifies
//! exactly once.

use parking_lot::Mutex;
use raleighsl_concurrency::{RwcOp, Task, TaskExec};
use raleighsl_core::{Errno, RslResult, TxnId};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

use crate::engine::Engine;
use crate::object::Object;
use crate::sched::{Completion, NotifyFn};

/// Transaction lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxnState {
    /// Open for atom submission
    WaitCommit = 0,
    /// A submission failed; a commit request degrades to rollback
    DontCommit = 1,
    /// Applied and committed
    Committed = 2,
    /// Reverted
    RolledBack = 3,
}

impl TxnState {
    fn from_u8(v: u8) -> TxnState {
        match v {
            0 => TxnState::WaitCommit,
            1 => TxnState::DontCommit,
            2 => TxnState::Committed,
            _ => TxnState::RolledBack,
        }
    }
}

pub(crate) struct Atom {
    pub mutation: Box<dyn Any + Send>,
}

pub(crate) struct ObjectGroup {
    pub object: Arc<Object>,
    pub atoms: VecDeque<Atom>,
}

/// One live transaction
pub struct Transaction {
    txn_id: TxnId,
    pub(crate) rwcsem: raleighsl_concurrency::TaskRwcSem,
    state: AtomicU8,
    mtime: Mutex<Instant>,
    pub(crate) groups: Mutex<Vec<ObjectGroup>>,
}

impl Transaction {
    fn new(txn_id: TxnId) -> Arc<Transaction> {
        Arc::new(Transaction {
            txn_id,
            rwcsem: raleighsl_concurrency::TaskRwcSem::new(),
            state: AtomicU8::new(TxnState::WaitCommit as u8),
            mtime: Mutex::new(Instant::now()),
            groups: Mutex::new(Vec::new()),
        })
    }

    /// Transaction identifier
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// Current lifecycle state
    pub fn state(&self) -> TxnState {
        TxnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TxnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Mark the transaction unfit to commit (a submission failed)
    pub fn dont_commit(&self) {
        self.state
            .store(TxnState::DontCommit as u8, Ordering::Release);
    }

    /// Seconds since the last atom submission
    pub fn idle_seconds(&self) -> u64 {
        self.mtime.lock().elapsed().as_secs()
    }

    fn touch(&self) {
        *self.mtime.lock() = Instant::now();
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("txn_id", &self.txn_id)
            .field("state", &self.state())
            .finish()
    }
}

struct TxnCache {
    entries: FxHashMap<u64, Arc<Transaction>>,
    stamps: BTreeMap<u64, u64>,
    stamp_of: FxHashMap<u64, u64>,
    next_stamp: u64,
}

/// Transaction manager: id allocation, live-transaction cache, barrier
pub struct TxnManager {
    next_txn_id: AtomicU64,
    cache: Mutex<TxnCache>,
    /// Serializes barrier acquisition and release across transactions
    barrier: Mutex<()>,
    capacity: usize,
    idle_eviction_seconds: u64,
}

impl TxnManager {
    /// Manager with a bounded live-transaction cache
    pub fn new(capacity: usize, idle_eviction_seconds: u64) -> Self {
        TxnManager {
            next_txn_id: AtomicU64::new(1),
            cache: Mutex::new(TxnCache {
                entries: FxHashMap::default(),
                stamps: BTreeMap::new(),
                stamp_of: FxHashMap::default(),
                next_stamp: 0,
            }),
            barrier: Mutex::new(()),
            capacity: capacity.max(1),
            idle_eviction_seconds,
        }
    }

    /// Allocate and register a fresh transaction
    pub fn create(&self) -> RslResult<TxnId> {
        let txn_id = TxnId(self.next_txn_id.fetch_add(1, Ordering::AcqRel));
        let txn = Transaction::new(txn_id);
        let mut cache = self.cache.lock();
        cache.next_stamp += 1;
        let stamp = cache.next_stamp;
        let prev = cache.entries.insert(txn_id.as_u64(), txn);
        debug_assert!(prev.is_none(), "duplicate transaction id");
        cache.stamps.insert(stamp, txn_id.as_u64());
        cache.stamp_of.insert(txn_id.as_u64(), stamp);
        if cache.entries.len() > self.capacity {
            self.shed(&mut cache);
        }
        trace!(%txn_id, "created transaction");
        Ok(txn_id)
    }

    /// Pressure relief: drop terminal transactions, flag idle ones
    fn shed(&self, cache: &mut TxnCache) {
        let victims: Vec<u64> = cache
            .stamps
            .values()
            .copied()
            .filter(|id| {
                cache
                    .entries
                    .get(id)
                    .map(|txn| {
                        matches!(txn.state(), TxnState::Committed | TxnState::RolledBack)
                    })
                    .unwrap_or(false)
            })
            .collect();
        for id in victims {
            if cache.entries.len() <= self.capacity {
                break;
            }
            cache.entries.remove(&id);
            if let Some(stamp) = cache.stamp_of.remove(&id) {
                cache.stamps.remove(&stamp);
            }
        }
        for txn in cache.entries.values() {
            let idle = txn.idle_seconds();
            if idle > self.idle_eviction_seconds {
                warn!(txn_id = %txn.txn_id(), idle_seconds = idle, "transaction idle past eviction threshold");
            }
        }
    }

    fn lookup(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        let mut cache = self.cache.lock();
        let txn = cache.entries.get(&txn_id.as_u64()).cloned()?;
        cache.next_stamp += 1;
        let stamp = cache.next_stamp;
        if let Some(old) = cache.stamp_of.insert(txn_id.as_u64(), stamp) {
            cache.stamps.remove(&old);
        }
        cache.stamps.insert(stamp, txn_id.as_u64());
        Some(txn)
    }

    fn remove(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        let mut cache = self.cache.lock();
        let txn = cache.entries.remove(&txn_id.as_u64())?;
        if let Some(stamp) = cache.stamp_of.remove(&txn_id.as_u64()) {
            cache.stamps.remove(&stamp);
        }
        Some(txn)
    }

    /// Atomically claim every object of `txn` for the two-phase barrier
    ///
    /// Either all objects get `pending_txn_id` and their barrier flag, or
    /// none do and the caller defers.
    fn acquire_barrier(&self, txn: &Transaction, objects: &[Arc<Object>]) -> bool {
        let _guard = self.barrier.lock();
        if objects
            .iter()
            .any(|object| object.pending_txn() != TxnId::NONE)
        {
            return false;
        }
        for object in objects {
            object.set_pending_txn(txn.txn_id());
            object.rwcsem.sem().set_lock_flag();
        }
        true
    }

    /// Release every object lock taken by the barrier
    fn release_locks(&self, engine: &Engine, txn: &Transaction, objects: &[Arc<Object>]) {
        let _guard = self.barrier.lock();
        for object in objects {
            debug_assert_eq!(
                object.pending_txn(),
                txn.txn_id(),
                "unlocking an object owned by another transaction"
            );
            object.rwcsem.release(RwcOp::Lock, &engine.scheduler);
            object.set_pending_txn(TxnId::NONE);
        }
    }
}

// ============================================================================
// Submission and read-side acquisition
// ============================================================================

impl Engine {
    /// Register a fresh transaction and hand back its id
    pub fn transaction_create(&self) -> RslResult<TxnId> {
        self.txn_mgr.create()
    }

    /// Append one atom to `txn`'s object-group for `object`
    ///
    /// Callers hold the object's WRITE (or READ) op, which serializes
    /// submission per object. Atoms preserve submission order.
    pub fn transaction_add(
        &self,
        txn: &Arc<Transaction>,
        object: &Arc<Object>,
        mutation: Box<dyn Any + Send>,
    ) -> RslResult<()> {
        let mut groups = txn.groups.lock();
        let idx = match groups.iter().position(|g| g.object.oid() == object.oid()) {
            Some(idx) => idx,
            None => {
                groups.push(ObjectGroup {
                    object: object.clone(),
                    atoms: VecDeque::new(),
                });
                groups.len() - 1
            }
        };
        groups[idx].atoms.push_back(Atom { mutation });
        txn.touch();
        trace!(txn_id = %txn.txn_id(), oid = %object.oid(), "added atom");
        Ok(())
    }

    /// Resolve `txn_id` and take a read-side hold on the transaction
    ///
    /// `TxnId::NONE` means auto-commit and resolves to no transaction.
    /// Returns `TxnNotFound` for an unknown id and `TxnClosed` once the
    /// commit task owns the transaction.
    pub fn transaction_acquire(&self, txn_id: TxnId) -> RslResult<Option<Arc<Transaction>>> {
        if !txn_id.is_some() {
            return Ok(None);
        }
        let txn = self.txn_mgr.lookup(txn_id).ok_or(Errno::TxnNotFound)?;
        if !txn.rwcsem.sem().try_acquire(RwcOp::Read) {
            return Err(Errno::TxnClosed);
        }
        Ok(Some(txn))
    }

    /// Drop a read-side hold taken by [`Engine::transaction_acquire`]
    pub fn transaction_release(&self, txn: &Arc<Transaction>) {
        txn.rwcsem.release(RwcOp::Read, &self.scheduler);
    }
}

// ============================================================================
// Commit task
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitMode {
    Apply,
    Revert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnSched {
    Acquire,
    Barrier,
    Lock,
    Write,
}

struct TxnCommitTask {
    engine: Arc<Engine>,
    txn: Arc<Transaction>,
    requested: CommitMode,
    state: TxnSched,
    objects: Vec<Arc<Object>>,
    lock_idx: usize,
    notify: Option<NotifyFn>,
}

impl TaskExec for TxnCommitTask {
    fn exec(mut self: Box<Self>) {
        let engine = self.engine.clone();
        let txn = self.txn.clone();

        if self.state == TxnSched::Acquire {
            trace!(txn_id = %txn.txn_id(), "acquiring commit on transaction");
            self = match txn.rwcsem.acquire(RwcOp::Commit, self) {
                Some(task) => task,
                None => return,
            };
            self.state = TxnSched::Barrier;
        }

        if self.state == TxnSched::Barrier {
            let objects: Vec<Arc<Object>> = {
                let groups = txn.groups.lock();
                groups.iter().map(|g| g.object.clone()).collect()
            };
            trace!(txn_id = %txn.txn_id(), objects = objects.len(), "acquiring barrier");
            if !engine.txn_mgr.acquire_barrier(&txn, &objects) {
                trace!(txn_id = %txn.txn_id(), "barrier busy, deferring");
                engine.scheduler.add_pending(Task::new(self));
                return;
            }
            self.objects = objects;
            self.state = TxnSched::Lock;
            self.lock_idx = 0;
        }

        if self.state == TxnSched::Lock {
            while self.lock_idx < self.objects.len() {
                let object = self.objects[self.lock_idx].clone();
                self = match object.rwcsem.acquire(RwcOp::Lock, self) {
                    Some(task) => task,
                    None => return,
                };
                self.lock_idx += 1;
            }
            self.state = TxnSched::Write;
        }

        // WRITE and COMMIT run without further suspension
        let mut mode = self.requested;
        let mut degraded = false;
        if mode == CommitMode::Apply && txn.state() == TxnState::DontCommit {
            debug!(txn_id = %txn.txn_id(), "commit degraded to rollback");
            mode = CommitMode::Revert;
            degraded = true;
        }

        // the transaction is closed to submissions; drain the atoms out of
        // the groups so the type engines run without the group lock held
        let work: Vec<(Arc<Object>, VecDeque<Atom>)> = {
            let mut groups = txn.groups.lock();
            groups
                .iter_mut()
                .map(|g| (g.object.clone(), std::mem::take(&mut g.atoms)))
                .collect()
        };

        let mut apply_error: Option<Errno> = None;
        'groups: for (object, mut atoms) in work {
            while let Some(atom) = atoms.pop_front() {
                let result = match mode {
                    CommitMode::Apply => {
                        trace!(txn_id = %txn.txn_id(), oid = %object.oid(), "applying atom");
                        engine.object_apply(&object, atom.mutation)
                    }
                    CommitMode::Revert => {
                        trace!(txn_id = %txn.txn_id(), oid = %object.oid(), "reverting atom");
                        engine.object_revert(&object, atom.mutation)
                    }
                };
                if let Err(errno) = result {
                    apply_error = Some(errno);
                    break 'groups;
                }
            }
        }

        let mut commit_error: Option<Errno> = None;
        if let Some(errno) = apply_error {
            debug!(txn_id = %txn.txn_id(), %errno, "apply failed, rolling back all objects");
            for object in &self.objects {
                if let Err(rollback_errno) = engine.object_rollback(object) {
                    warn!(oid = %object.oid(), errno = %rollback_errno, "rollback failed");
                }
            }
        } else {
            for object in &self.objects {
                if let Err(errno) = engine.object_commit(object) {
                    warn!(oid = %object.oid(), %errno, "object commit failed, rolling it back");
                    let _ = engine.object_rollback(object);
                    commit_error.get_or_insert(errno);
                }
            }
        }

        // COMPLETE: settle the fate, release everything, notify once
        let result: RslResult<()> = if let Some(errno) = apply_error {
            txn.set_state(TxnState::RolledBack);
            Err(errno)
        } else if degraded {
            txn.set_state(TxnState::RolledBack);
            Err(Errno::TxnRolledBack)
        } else if self.requested == CommitMode::Revert {
            txn.set_state(TxnState::RolledBack);
            Ok(())
        } else {
            txn.set_state(TxnState::Committed);
            match commit_error {
                Some(errno) => Err(errno),
                None => Ok(()),
            }
        };

        debug!(txn_id = %txn.txn_id(), state = ?txn.state(), "transaction complete");
        engine
            .txn_mgr
            .release_locks(&engine, &txn, &self.objects);
        txn.rwcsem.release(RwcOp::Commit, &engine.scheduler);
        if let Some(notify) = self.notify.take() {
            notify(
                &engine,
                Completion {
                    oid: raleighsl_core::Oid::NONE,
                    result,
                },
            );
        }
    }
}

impl Engine {
    fn spawn_txn_task(
        &self,
        txn_id: TxnId,
        requested: CommitMode,
        notify: NotifyFn,
    ) -> i32 {
        let Some(txn) = self.txn_mgr.lookup(txn_id) else {
            notify(
                self,
                Completion {
                    oid: raleighsl_core::Oid::NONE,
                    result: Err(Errno::TxnNotFound),
                },
            );
            return 0;
        };

        // close the transaction before it leaves the lookup table: a racing
        // read-side acquisition sees TxnClosed, never a spurious TxnNotFound
        txn.rwcsem.sem().set_commit_flag();
        if self.txn_mgr.remove(txn_id).is_none() {
            // a concurrent commit or rollback request won the handoff
            notify(
                self,
                Completion {
                    oid: raleighsl_core::Oid::NONE,
                    result: Err(Errno::TxnNotFound),
                },
            );
            return 0;
        }

        let task = Box::new(TxnCommitTask {
            engine: self.handle(),
            txn,
            requested,
            state: TxnSched::Acquire,
            objects: Vec::new(),
            lock_idx: 0,
            notify: Some(notify),
        });
        self.scheduler.add_task(Task::new(task));
        0
    }

    /// Schedule the commit of `txn_id`; `notify` fires exactly once
    pub fn exec_txn_commit(&self, txn_id: TxnId, notify: NotifyFn) -> i32 {
        self.spawn_txn_task(txn_id, CommitMode::Apply, notify)
    }

    /// Schedule the rollback of `txn_id`; `notify` fires exactly once
    pub fn exec_txn_rollback(&self, txn_id: TxnId, notify: NotifyFn) -> i32 {
        self.spawn_txn_task(txn_id, CommitMode::Revert, notify)
    }
}
