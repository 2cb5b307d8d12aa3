//! Tasks and the task-aware semaphore
//!
//! A task is a small boxed state machine. Workers call `exec` exactly once
//! per dispatch; the task either completes or hands itself back to the
//! system (parked on a semaphore, re-queued on the ready ring, or deferred
//! on the pending ring) and returns. Tasks are non-preemptive: `exec` runs
//! to the next acquire, defer or yield point.
//!
//! `TaskRwcSem` pairs an `RwcSem` with a waiter queue. Acquire-or-park and
//! release-and-wake both run under the waiter mutex, so a release between
//! a failed admission check and the park cannot lose the wakeup.

use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::rwcsem::{RwcOp, RwcSem};
use crate::scheduler::TaskScheduler;

/// A schedulable state machine
///
/// `exec` consumes the box; a task that is not complete must hand itself
/// off (scheduler ready ring, pending ring, or a semaphore waiter queue)
/// before returning.
pub trait TaskExec: Send + 'static {
    /// Run until the next suspension point
    fn exec(self: Box<Self>);
}

/// Type-erased task, as stored in scheduler rings and waiter queues
pub struct Task(Box<dyn TaskExec>);

impl Task {
    /// Erase a concrete task
    pub fn new<T: TaskExec>(task: Box<T>) -> Self {
        Task(task)
    }

    /// Dispatch the task
    pub fn exec(self) {
        self.0.exec()
    }
}

struct Waiter {
    op: RwcOp,
    task: Task,
}

/// RwcSem with task parking
///
/// The semaphore side never blocks a thread; parked tasks re-enter the
/// scheduler ready ring when their operation becomes admissible.
pub struct TaskRwcSem {
    sem: RwcSem,
    waiters: Mutex<VecDeque<Waiter>>,
}

impl Default for TaskRwcSem {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRwcSem {
    /// Fresh semaphore with no holders and no waiters
    pub fn new() -> Self {
        TaskRwcSem {
            sem: RwcSem::new(),
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// The underlying semaphore
    ///
    /// Used for flag publication (`set_commit_flag`, `set_lock_flag`) and
    /// for non-task acquisitions such as the transaction read side.
    pub fn sem(&self) -> &RwcSem {
        &self.sem
    }

    /// Acquire `op` for a task, or park the task
    ///
    /// On success the task is handed back to the caller, which keeps
    /// running. On failure the semaphore owns the task and will re-enqueue
    /// it on the ready ring when `op` becomes admissible; the caller must
    /// return immediately.
    pub fn acquire<T: TaskExec>(&self, op: RwcOp, task: Box<T>) -> Option<Box<T>> {
        let mut waiters = self.waiters.lock();
        if self.sem.try_acquire(op) {
            return Some(task);
        }
        waiters.push_back(Waiter {
            op,
            task: Task::new(task),
        });
        None
    }

    /// Release `op` and wake every parked task whose op is now admissible
    ///
    /// Woken tasks retry the acquisition themselves when dispatched; a
    /// task that loses the race parks again.
    pub fn release(&self, op: RwcOp, sched: &TaskScheduler) {
        let mut waiters = self.waiters.lock();
        self.sem.release(op);
        let mut kept = VecDeque::with_capacity(waiters.len());
        for waiter in waiters.drain(..) {
            if self.sem.would_admit(waiter.op) {
                sched.add_task(waiter.task);
            } else {
                kept.push_back(waiter);
            }
        }
        *waiters = kept;
    }

    /// Release `op`, wake admissible waiters, and re-queue the caller
    ///
    /// The incomplete-release path: the caller's task goes back on the
    /// ready ring behind the woken waiters and resumes from its recorded
    /// state.
    pub fn release_retry<T: TaskExec>(&self, op: RwcOp, task: Box<T>, sched: &TaskScheduler) {
        self.release(op, sched);
        sched.add_task(Task::new(task));
    }

    /// Number of parked tasks
    pub fn waiting(&self) -> usize {
        self.waiters.lock().len()
    }
}
