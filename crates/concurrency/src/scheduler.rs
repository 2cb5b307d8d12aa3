//! Worker-pool task scheduler
//!
//! A fixed ring of worker threads (default one per CPU) drains a FIFO of
//! ready tasks. A second FIFO holds pending tasks: tasks blocked behind a
//! barrier that has no wakeup hook (a transaction holding an object's
//! pending slot). Workers fold the pending ring back into the ready ring
//! on a short tick whenever the ready ring runs dry, so barrier retries
//! are bounded without a dedicated timer thread.
//!
//! Dropping the scheduler stops the workers; tasks still queued at that
//! point are dropped unexecuted.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;

use crate::task::Task;

const PENDING_RETRY_TICK: Duration = Duration::from_millis(2);

struct Rings {
    ready: std::collections::VecDeque<Task>,
    pending: std::collections::VecDeque<Task>,
    running: bool,
}

struct Shared {
    rings: Mutex<Rings>,
    task_ready: Condvar,
}

/// Fixed worker pool with ready and pending FIFOs
pub struct TaskScheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Spawn `threads` workers (at least one)
    pub fn new(threads: u32) -> Arc<Self> {
        let shared = Arc::new(Shared {
            rings: Mutex::new(Rings {
                ready: std::collections::VecDeque::new(),
                pending: std::collections::VecDeque::new(),
                running: true,
            }),
            task_ready: Condvar::new(),
        });

        let sched = Arc::new(TaskScheduler {
            shared: shared.clone(),
            workers: Mutex::new(Vec::new()),
        });

        let mut workers = sched.workers.lock();
        for i in 0..threads.max(1) {
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("rsl-worker-{i}"))
                .spawn(move || worker_loop(&shared))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }
        drop(workers);

        sched
    }

    /// Enqueue a task on the ready ring
    pub fn add_task(&self, task: Task) {
        let mut rings = self.shared.rings.lock();
        rings.ready.push_back(task);
        drop(rings);
        self.shared.task_ready.notify_one();
    }

    /// Enqueue a task on the pending ring
    ///
    /// Used when the task is blocked behind a barrier with no wakeup hook;
    /// workers fold pending tasks back into the ready ring on a short tick.
    pub fn add_pending(&self, task: Task) {
        let mut rings = self.shared.rings.lock();
        rings.pending.push_back(task);
        drop(rings);
        self.shared.task_ready.notify_one();
    }

    /// Stop the workers and join them
    ///
    /// Queued tasks that have not run are dropped.
    pub fn shutdown(&self) {
        {
            let mut rings = self.shared.rings.lock();
            if !rings.running {
                return;
            }
            let dropped = rings.ready.len() + rings.pending.len();
            if dropped > 0 {
                debug!(dropped, "scheduler stopping with queued tasks");
            }
            rings.running = false;
            rings.ready.clear();
            rings.pending.clear();
        }
        self.shared.task_ready.notify_all();
        let current = std::thread::current().id();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            // a worker that drops the last engine handle must not join itself
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }

    /// Queued task count across both rings (diagnostics only)
    pub fn backlog(&self) -> usize {
        let rings = self.shared.rings.lock();
        rings.ready.len() + rings.pending.len()
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let task = {
            let mut rings = shared.rings.lock();
            loop {
                if let Some(task) = rings.ready.pop_front() {
                    break task;
                }
                if !rings.running {
                    return;
                }
                if rings.pending.is_empty() {
                    shared.task_ready.wait(&mut rings);
                } else {
                    // barrier retry tick: give the holder a moment, then
                    // fold the pending ring back into ready
                    let _ = shared
                        .task_ready
                        .wait_for(&mut rings, PENDING_RETRY_TICK);
                    if !rings.running {
                        return;
                    }
                    let pending: Vec<Task> = rings.pending.drain(..).collect();
                    rings.ready.extend(pending);
                }
            }
        };
        task.exec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskExec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    struct CountTask {
        hits: Arc<AtomicUsize>,
        done: mpsc::Sender<()>,
    }

    impl TaskExec for CountTask {
        fn exec(self: Box<Self>) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            let _ = self.done.send(());
        }
    }

    #[test]
    fn test_tasks_run_once() {
        let sched = TaskScheduler::new(2);
        let hits = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for _ in 0..16 {
            sched.add_task(Task::new(Box::new(CountTask {
                hits: hits.clone(),
                done: tx.clone(),
            })));
        }
        for _ in 0..16 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 16);
        sched.shutdown();
    }

    #[test]
    fn test_pending_tasks_eventually_run() {
        let sched = TaskScheduler::new(1);
        let hits = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        sched.add_pending(Task::new(Box::new(CountTask {
            hits: hits.clone(),
            done: tx,
        })));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        sched.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let sched = TaskScheduler::new(2);
        sched.shutdown();
        sched.shutdown();
    }
}
