//! Semantic layer: names to OIDs
//!
//! A byte-string name maps to at most one OID. The map lives under its own
//! task semaphore; every mutating operation runs in a scheduler task that
//! walks `WRITE → COMMIT` (lookups take a plain READ). Mutations append to
//! an undo log so a failed step rolls the whole operation back, and the
//! commit state batches the log away.
//!
//! The monotonic OID allocator lives here; OIDs are never reused and OID 0
//! stays reserved.

use parking_lot::Mutex;
use raleighsl_concurrency::{RwcOp, Task, TaskExec};
use raleighsl_core::{Errno, Oid, RslResult};
use raleighsl_concurrency::TaskRwcSem;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

use crate::engine::Engine;
use crate::object::ObjectType;
use crate::sched::{Completion, NotifyFn};

enum Undo {
    /// A create happened; undo removes the name
    Created(Vec<u8>),
    /// An unlink happened; undo restores the mapping
    Unlinked(Vec<u8>, Oid),
}

struct Index {
    map: BTreeMap<Vec<u8>, Oid>,
    undo: Vec<Undo>,
}

/// Name → OID map with two-phase mutation
pub struct SemanticLayer {
    pub(crate) rwcsem: TaskRwcSem,
    index: Mutex<Index>,
    next_oid: AtomicU64,
}

impl SemanticLayer {
    pub(crate) fn new() -> Self {
        SemanticLayer {
            rwcsem: TaskRwcSem::new(),
            index: Mutex::new(Index {
                map: BTreeMap::new(),
                undo: Vec::new(),
            }),
            next_oid: AtomicU64::new(1),
        }
    }

    fn next_oid(&self) -> Oid {
        Oid(self.next_oid.fetch_add(1, Ordering::AcqRel))
    }

    fn create(&self, name: &[u8], oid: Oid) -> RslResult<()> {
        let mut index = self.index.lock();
        if index.map.contains_key(name) {
            return Err(Errno::ObjectExists);
        }
        index.map.insert(name.to_vec(), oid);
        index.undo.push(Undo::Created(name.to_vec()));
        Ok(())
    }

    fn lookup(&self, name: &[u8]) -> RslResult<Oid> {
        self.index
            .lock()
            .map
            .get(name)
            .copied()
            .ok_or(Errno::ObjectNotFound)
    }

    fn unlink(&self, name: &[u8]) -> RslResult<Oid> {
        let mut index = self.index.lock();
        let oid = index.map.remove(name).ok_or(Errno::ObjectNotFound)?;
        index.undo.push(Undo::Unlinked(name.to_vec(), oid));
        Ok(oid)
    }

    fn commit(&self) -> RslResult<()> {
        self.index.lock().undo.clear();
        Ok(())
    }

    fn rollback(&self) -> RslResult<()> {
        let mut index = self.index.lock();
        while let Some(undo) = index.undo.pop() {
            match undo {
                Undo::Created(name) => {
                    index.map.remove(&name);
                }
                Undo::Unlinked(name, oid) => {
                    index.map.insert(name, oid);
                }
            }
        }
        Ok(())
    }

    /// Number of mapped names
    pub fn len(&self) -> usize {
        self.index.lock().map.len()
    }

    /// True when no names are mapped
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Engine-level operations (run inside semantic tasks)
// ============================================================================

impl Engine {
    /// Map `name` to a fresh OID and create the typed object
    ///
    /// Runs under the semantic WRITE op.
    pub fn semantic_create(&self, name: &[u8], vtable: Arc<dyn ObjectType>) -> RslResult<Oid> {
        match self.semantic.lookup(name) {
            Err(Errno::ObjectNotFound) => {}
            Ok(_) => return Err(Errno::ObjectExists),
            Err(errno) => return Err(errno),
        }

        let oid = self.semantic.next_oid();
        self.semantic.create(name, oid)?;
        self.object_create(vtable, oid)?;
        trace!(name = ?String::from_utf8_lossy(name), %oid, "created object");
        Ok(oid)
    }

    /// Resolve `name`; runs under the semantic READ op
    pub fn semantic_lookup(&self, name: &[u8]) -> RslResult<Oid> {
        self.semantic.lookup(name)
    }

    /// Remove `name` and run the type's unlink hook
    pub fn semantic_unlink(&self, name: &[u8]) -> RslResult<Oid> {
        let oid = self.semantic.unlink(name)?;
        let object = self.obj_cache_get(oid);
        let result = match object.object_type() {
            Some(vtable) => vtable.unlink(self, &object),
            None => Ok(()),
        };
        self.obj_cache_release(&object);
        result?;
        Ok(oid)
    }

    /// Move the mapping from `old_name` to `new_name`
    ///
    /// Fails with `ObjectExists` when the target name is taken; the whole
    /// operation is atomic under the semantic WRITE op.
    pub fn semantic_rename(&self, old_name: &[u8], new_name: &[u8]) -> RslResult<Oid> {
        match self.semantic.lookup(new_name) {
            Err(Errno::ObjectNotFound) => {}
            Ok(_) => return Err(Errno::ObjectExists),
            Err(errno) => return Err(errno),
        }
        let oid = self.semantic.unlink(old_name)?;
        self.semantic.create(new_name, oid)?;
        Ok(oid)
    }

    pub(crate) fn semantic_commit(&self) -> RslResult<()> {
        self.semantic.commit()
    }

    pub(crate) fn semantic_rollback(&self) -> RslResult<()> {
        self.semantic.rollback()
    }
}

// ============================================================================
// Semantic scheduler
// ============================================================================

/// Operation body run under the semantic semaphore; returns the OID the
/// notifier reports
pub type SemanticOpFn = Box<dyn FnOnce(&Engine) -> RslResult<Oid> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SemSched {
    Create,
    Lookup,
    Unlink,
    Rename,
    Commit,
}

impl SemSched {
    fn op(self) -> RwcOp {
        match self {
            SemSched::Lookup => RwcOp::Read,
            SemSched::Commit => RwcOp::Commit,
            _ => RwcOp::Write,
        }
    }
}

struct SemanticTask {
    engine: Arc<Engine>,
    state: SemSched,
    op_fn: Option<SemanticOpFn>,
    oid: Oid,
    held: Option<RwcOp>,
    notify: Option<NotifyFn>,
}

impl TaskExec for SemanticTask {
    fn exec(mut self: Box<Self>) {
        let engine = self.engine.clone();
        let sem = &engine.semantic.rwcsem;

        let op = self.state.op();
        if self.held != Some(op) {
            debug_assert!(self.held.is_none());
            self = match sem.acquire(op, self) {
                Some(task) => task,
                None => return,
            };
            self.held = Some(op);
        }

        let mut result: RslResult<()>;
        let mut is_complete;
        loop {
            let held_op = self.state.op();
            let mut keep_running = false;
            is_complete = true;
            match self.state {
                SemSched::Create | SemSched::Unlink | SemSched::Rename => {
                    let op_fn = self.op_fn.take().expect("semantic task without body");
                    match op_fn(&engine) {
                        Err(errno) => {
                            let _ = engine.semantic_rollback();
                            result = Err(errno);
                        }
                        Ok(oid) => {
                            self.oid = oid;
                            result = Ok(());
                            sem.sem().set_commit_flag();
                            is_complete = false;
                            self.state = SemSched::Commit;
                            keep_running = sem.sem().try_switch(held_op, RwcOp::Commit);
                        }
                    }
                }
                SemSched::Lookup => {
                    let op_fn = self.op_fn.take().expect("semantic task without body");
                    match op_fn(&engine) {
                        Err(errno) => result = Err(errno),
                        Ok(oid) => {
                            self.oid = oid;
                            result = Ok(());
                        }
                    }
                }
                SemSched::Commit => {
                    result = engine.semantic_commit();
                    if result.is_err() {
                        let _ = engine.semantic_rollback();
                    }
                }
            }

            if !keep_running {
                break;
            }
            self.held = Some(self.state.op());
        }

        if is_complete {
            if let Some(op) = self.held.take() {
                sem.release(op, &engine.scheduler);
            }
            if let Some(notify) = self.notify.take() {
                notify(
                    &engine,
                    Completion {
                        oid: self.oid,
                        result,
                    },
                );
            }
        } else {
            let op = self.held.take().expect("held op on retry path");
            sem.release_retry(op, self, &engine.scheduler);
        }
    }
}

impl Engine {
    fn spawn_semantic_task(&self, state: SemSched, op_fn: SemanticOpFn, notify: NotifyFn) -> i32 {
        let task = Box::new(SemanticTask {
            engine: self.handle(),
            state,
            op_fn: Some(op_fn),
            oid: Oid::NONE,
            held: None,
            notify: Some(notify),
        });
        self.scheduler.add_task(Task::new(task));
        0
    }

    /// Schedule an object creation; the body typically calls
    /// [`Engine::semantic_create`]
    pub fn exec_create(&self, create_fn: SemanticOpFn, notify: NotifyFn) -> i32 {
        self.spawn_semantic_task(SemSched::Create, create_fn, notify)
    }

    /// Schedule a name lookup; the body typically calls
    /// [`Engine::semantic_lookup`]
    pub fn exec_lookup(&self, lookup_fn: SemanticOpFn, notify: NotifyFn) -> i32 {
        self.spawn_semantic_task(SemSched::Lookup, lookup_fn, notify)
    }

    /// Schedule a name removal; the body typically calls
    /// [`Engine::semantic_unlink`]
    pub fn exec_unlink(&self, unlink_fn: SemanticOpFn, notify: NotifyFn) -> i32 {
        self.spawn_semantic_task(SemSched::Unlink, unlink_fn, notify)
    }

    /// Schedule a rename; the body typically calls
    /// [`Engine::semantic_rename`]
    pub fn exec_rename(&self, rename_fn: SemanticOpFn, notify: NotifyFn) -> i32 {
        self.spawn_semantic_task(SemSched::Rename, rename_fn, notify)
    }
}
