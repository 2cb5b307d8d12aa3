//! Object scheduler
//!
//! Every read or write request becomes one task walking the per-object
//! state machine:
//!
//! ```text
//!   OPEN → READ ──────────────┐
//!        ↘ WRITE → COMMIT ────┴→ (complete, notify)
//! ```
//!
//! OPEN pins the object and lazily loads its type state under a WRITE
//! acquire, then trades the WRITE for the intended op. A task that meets a
//! pending transaction barrier defers to the pending ring (only COMMIT may
//! pass). A read function may answer `SchedYield` to re-enter the ready
//! ring without giving up its READ. A write error rolls the object back
//! and fails the enclosing transaction's commit.

use raleighsl_concurrency::{RwcOp, Task, TaskExec};
use raleighsl_core::{Errno, Oid, RslResult, TxnId};
use std::sync::Arc;
use tracing::trace;

use crate::engine::Engine;
use crate::object::Object;
use crate::transaction::Transaction;

/// Outcome reported to a notifier, exactly once per scheduled operation
pub struct Completion {
    /// Object the operation ran against (`Oid::NONE` for semantic and
    /// transaction operations)
    pub oid: Oid,
    /// Final errno of the operation
    pub result: RslResult<()>,
}

/// One-shot completion callback
pub type NotifyFn = Box<dyn FnOnce(&Engine, Completion) + Send>;

/// User read body; may return `SchedYield` to be re-entered
pub type ReadFn =
    Box<dyn FnMut(&Engine, Option<&Arc<Transaction>>, &Arc<Object>) -> RslResult<()> + Send>;

/// User write body; runs at most once
pub type WriteFn =
    Box<dyn FnOnce(&Engine, Option<&Arc<Transaction>>, &Arc<Object>) -> RslResult<()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjSched {
    Open,
    Read,
    Write,
    Commit,
}

impl ObjSched {
    fn op(self) -> RwcOp {
        match self {
            ObjSched::Open => RwcOp::Write,
            ObjSched::Read => RwcOp::Read,
            ObjSched::Write => RwcOp::Write,
            ObjSched::Commit => RwcOp::Commit,
        }
    }
}

struct ObjectTask {
    engine: Arc<Engine>,
    state: ObjSched,
    intended: ObjSched,
    oid: Oid,
    object: Option<Arc<Object>>,
    txn: Option<Arc<Transaction>>,
    held: Option<RwcOp>,
    read_fn: Option<ReadFn>,
    write_fn: Option<WriteFn>,
    notify: Option<NotifyFn>,
}

impl ObjectTask {
    fn complete(mut self: Box<Self>, object: &Arc<Object>, result: RslResult<()>) {
        let engine = self.engine.clone();
        if let Some(op) = self.held.take() {
            object.rwcsem.release(op, &engine.scheduler);
        }
        if let Some(notify) = self.notify.take() {
            notify(
                &engine,
                Completion {
                    oid: object.oid(),
                    result,
                },
            );
        }
        engine.obj_cache_release(object);
        if let Some(txn) = self.txn.take() {
            engine.transaction_release(&txn);
        }
    }
}

impl TaskExec for ObjectTask {
    fn exec(mut self: Box<Self>) {
        let engine = self.engine.clone();

        // first entry: pin the object; skip OPEN if it is already open
        if self.object.is_none() {
            let object = engine.obj_cache_get(self.oid);
            if object.is_open() {
                self.state = self.intended;
            }
            self.object = Some(object);
        } else if self.state == ObjSched::Open {
            if let Some(object) = &self.object {
                if object.is_open() {
                    self.state = self.intended;
                }
            }
        }
        let object = self.object.clone().expect("pinned above");

        // let a pending transaction finish before anything but its commit;
        // a task already holding its op (a yielded read) continues, and the
        // barrier drains it instead
        if self.held.is_none() && self.state != ObjSched::Commit && object.pending_txn() != TxnId::NONE
        {
            trace!(oid = %object.oid(), pending = %object.pending_txn(), "deferring behind pending transaction");
            engine.scheduler.add_pending(Task::new(self));
            return;
        }

        let op = self.state.op();
        if self.held != Some(op) {
            debug_assert!(self.held.is_none(), "switching without a release");
            self = match object.rwcsem.acquire(op, self) {
                Some(task) => task,
                None => return,
            };
            self.held = Some(op);
        }

        let txn = self.txn.clone();
        let mut result: RslResult<()>;
        let mut is_complete;
        loop {
            let held_op = self.state.op();
            let mut keep_running = false;
            is_complete = true;
            match self.state {
                ObjSched::Open => {
                    result = engine.object_open(&object);
                    match result {
                        Err(_) => {
                            if object.object_type().is_some() {
                                let _ = engine.object_rollback(&object);
                            }
                        }
                        Ok(()) => {
                            is_complete = false;
                            self.state = self.intended;
                            keep_running = object
                                .rwcsem
                                .sem()
                                .try_switch(held_op, self.state.op());
                        }
                    }
                }
                ObjSched::Read => {
                    let read_fn = self.read_fn.as_mut().expect("read task without read fn");
                    result = read_fn(&engine, txn.as_ref(), &object);
                    if result == Err(Errno::SchedYield) {
                        // not complete: keep the READ held and re-enter
                        engine.scheduler.add_task(Task::new(self));
                        return;
                    }
                }
                ObjSched::Write => {
                    let write_fn = self.write_fn.take().expect("write task without write fn");
                    result = write_fn(&engine, txn.as_ref(), &object);
                    match result {
                        Err(errno) => {
                            // a key-lock refusal is retryable contention and
                            // leaves the transaction fit to commit
                            if errno != Errno::TxnLockedKey {
                                if let Some(txn) = &txn {
                                    txn.dont_commit();
                                }
                            }
                            let _ = engine.object_rollback(&object);
                        }
                        Ok(()) => {
                            object.rwcsem.sem().set_commit_flag();
                            is_complete = false;
                            self.state = ObjSched::Commit;
                            keep_running = object
                                .rwcsem
                                .sem()
                                .try_switch(held_op, self.state.op());
                        }
                    }
                }
                ObjSched::Commit => {
                    result = engine.object_commit(&object);
                    if result.is_err() {
                        let _ = engine.object_rollback(&object);
                    }
                }
            }

            if !keep_running {
                break;
            }
            // the switch succeeded; the held op follows the new state
            self.held = Some(self.state.op());
        }

        if is_complete {
            self.complete(&object, result);
        } else {
            // state advanced but the op switch failed: release, re-enter,
            // and acquire the new op on the next dispatch
            let op = self.held.take().expect("held op on retry path");
            object.rwcsem.release_retry(op, self, &engine.scheduler);
        }
    }
}

impl Engine {
    fn spawn_object_task(
        &self,
        txn_id: TxnId,
        oid: Oid,
        intended: ObjSched,
        read_fn: Option<ReadFn>,
        write_fn: Option<WriteFn>,
        notify: NotifyFn,
    ) -> i32 {
        let txn = match self.transaction_acquire(txn_id) {
            Ok(txn) => txn,
            Err(errno) => {
                notify(
                    self,
                    Completion {
                        oid: Oid::NONE,
                        result: Err(errno),
                    },
                );
                return 0;
            }
        };

        let task = Box::new(ObjectTask {
            engine: self.handle(),
            state: ObjSched::Open,
            intended,
            oid,
            object: None,
            txn,
            held: None,
            read_fn,
            write_fn,
            notify: Some(notify),
        });
        self.scheduler.add_task(Task::new(task));
        0
    }

    /// Schedule a read against `oid`, optionally inside transaction `txn_id`
    pub fn exec_read(
        &self,
        txn_id: TxnId,
        oid: Oid,
        read_fn: ReadFn,
        notify: NotifyFn,
    ) -> i32 {
        self.spawn_object_task(txn_id, oid, ObjSched::Read, Some(read_fn), None, notify)
    }

    /// Schedule a write against `oid`, optionally inside transaction `txn_id`
    pub fn exec_write(
        &self,
        txn_id: TxnId,
        oid: Oid,
        write_fn: WriteFn,
        notify: NotifyFn,
    ) -> i32 {
        self.spawn_object_task(txn_id, oid, ObjSched::Write, None, Some(write_fn), notify)
    }
}
