//! Read/write/commit semaphore
//!
//! A single atomic word encodes four counters:
//!
//! ```text
//!   bits  0..16   r   active readers
//!   bit   16      w   active writer
//!   bit   17      c   commit owner or published commit intention
//!   bit   18      lk  external transaction barrier
//! ```
//!
//! Admission rules:
//! - READ enters while no writer, no commit, no barrier.
//! - WRITE enters alone.
//! - COMMIT enters once readers and the writer have drained; the `c` flag
//!   may be published early (`set_commit_flag`) so new contenders back off
//!   while current holders finish.
//! - LOCK enters once readers, writer and commit have drained; the `lk`
//!   flag may be published early (`set_lock_flag`). Readers that entered
//!   before the flag drain out while new ones are refused.
//!
//! There is exactly one commit owner and one lock owner per semaphore by
//! construction (the transaction barrier and the object scheduler never
//! race themselves), so acquiring over an own published flag is sound.
//!
//! Callers receive a boolean and yield to the scheduler; the semaphore
//! never blocks a thread.

use std::sync::atomic::{AtomicU32, Ordering};

const READ_MASK: u32 = 0xffff;
const WRITE_BIT: u32 = 1 << 16;
const COMMIT_BIT: u32 = 1 << 17;
const LOCK_BIT: u32 = 1 << 18;

/// Operation kinds understood by the semaphore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RwcOp {
    /// Shared read
    Read,
    /// Exclusive write
    Write,
    /// Commit barrier: excludes readers and the writer
    Commit,
    /// External transaction barrier: excludes everything else
    Lock,
}

/// Four-state semaphore on one atomic word
#[derive(Debug)]
pub struct RwcSem {
    state: AtomicU32,
}

impl Default for RwcSem {
    fn default() -> Self {
        Self::new()
    }
}

impl RwcSem {
    /// Fresh semaphore with no holders
    pub fn new() -> Self {
        RwcSem {
            state: AtomicU32::new(0),
        }
    }

    fn admit(state: u32, op: RwcOp) -> Option<u32> {
        let readers = state & READ_MASK;
        match op {
            RwcOp::Read => {
                if state & (WRITE_BIT | COMMIT_BIT | LOCK_BIT) != 0 {
                    return None;
                }
                debug_assert!(readers < READ_MASK);
                Some(state + 1)
            }
            RwcOp::Write => {
                if readers != 0 || state & (WRITE_BIT | COMMIT_BIT | LOCK_BIT) != 0 {
                    return None;
                }
                Some(state | WRITE_BIT)
            }
            RwcOp::Commit => {
                if readers != 0 || state & WRITE_BIT != 0 {
                    return None;
                }
                Some(state | COMMIT_BIT)
            }
            RwcOp::Lock => {
                if readers != 0 || state & (WRITE_BIT | COMMIT_BIT) != 0 {
                    return None;
                }
                Some(state | LOCK_BIT)
            }
        }
    }

    /// True iff `op` would be granted right now
    ///
    /// Used by the waiter queue to decide which parked tasks to wake; the
    /// woken task still retries the acquisition itself.
    pub fn would_admit(&self, op: RwcOp) -> bool {
        Self::admit(self.state.load(Ordering::Acquire), op).is_some()
    }

    /// Acquire `op` if it can proceed immediately
    pub fn try_acquire(&self, op: RwcOp) -> bool {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            let Some(next) = Self::admit(state, op) else {
                return false;
            };
            match self.state.compare_exchange_weak(
                state,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    /// Publish a commit intention without waiting for current holders
    ///
    /// New readers and writers back off immediately; the publisher later
    /// acquires COMMIT once the holders drain.
    pub fn set_commit_flag(&self) {
        self.state.fetch_or(COMMIT_BIT, Ordering::AcqRel);
    }

    /// Publish a barrier intention without waiting for current holders
    pub fn set_lock_flag(&self) {
        self.state.fetch_or(LOCK_BIT, Ordering::AcqRel);
    }

    /// Release a held operation
    pub fn release(&self, op: RwcOp) {
        match op {
            RwcOp::Read => {
                let prev = self.state.fetch_sub(1, Ordering::AcqRel);
                debug_assert!(prev & READ_MASK > 0);
            }
            RwcOp::Write => {
                self.state.fetch_and(!WRITE_BIT, Ordering::AcqRel);
            }
            RwcOp::Commit => {
                self.state.fetch_and(!COMMIT_BIT, Ordering::AcqRel);
            }
            RwcOp::Lock => {
                self.state.fetch_and(!LOCK_BIT, Ordering::AcqRel);
            }
        }
    }

    /// Atomically trade a held WRITE for another op
    ///
    /// Defined for `WRITE → READ` (downgrade), `WRITE → WRITE` (identity)
    /// and `WRITE → COMMIT` (upgrade). A downgrade fails while a commit or
    /// barrier intention is published, since new readers must back off.
    /// Every other transition returns false and leaves the WRITE held.
    pub fn try_switch(&self, from: RwcOp, to: RwcOp) -> bool {
        if from != RwcOp::Write {
            return false;
        }
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            debug_assert!(state & WRITE_BIT != 0);
            let next = match to {
                RwcOp::Write => return true,
                RwcOp::Read => {
                    if state & (COMMIT_BIT | LOCK_BIT) != 0 {
                        return false;
                    }
                    (state & !WRITE_BIT) + 1
                }
                RwcOp::Commit => (state & !WRITE_BIT) | COMMIT_BIT,
                RwcOp::Lock => return false,
            };
            match self.state.compare_exchange_weak(
                state,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    #[cfg(test)]
    fn raw(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::const_assert;

    // the reader counter must sit below the flag bits
    const_assert!(READ_MASK < WRITE_BIT);
    const_assert!(WRITE_BIT < COMMIT_BIT && COMMIT_BIT < LOCK_BIT);

    #[test]
    fn test_readers_are_concurrent() {
        let sem = RwcSem::new();
        assert!(sem.try_acquire(RwcOp::Read));
        assert!(sem.try_acquire(RwcOp::Read));
        assert_eq!(sem.raw() & READ_MASK, 2);
        sem.release(RwcOp::Read);
        sem.release(RwcOp::Read);
        assert_eq!(sem.raw(), 0);
    }

    #[test]
    fn test_writer_is_exclusive() {
        let sem = RwcSem::new();
        assert!(sem.try_acquire(RwcOp::Write));
        assert!(!sem.try_acquire(RwcOp::Read));
        assert!(!sem.try_acquire(RwcOp::Write));
        assert!(!sem.try_acquire(RwcOp::Commit));
        sem.release(RwcOp::Write);
        assert!(sem.try_acquire(RwcOp::Read));
    }

    #[test]
    fn test_commit_excludes_read_and_write() {
        let sem = RwcSem::new();
        assert!(sem.try_acquire(RwcOp::Commit));
        assert!(!sem.try_acquire(RwcOp::Read));
        assert!(!sem.try_acquire(RwcOp::Write));
        sem.release(RwcOp::Commit);
        assert!(sem.try_acquire(RwcOp::Write));
    }

    #[test]
    fn test_commit_waits_for_readers() {
        let sem = RwcSem::new();
        assert!(sem.try_acquire(RwcOp::Read));
        assert!(!sem.try_acquire(RwcOp::Commit));
        sem.release(RwcOp::Read);
        assert!(sem.try_acquire(RwcOp::Commit));
    }

    #[test]
    fn test_commit_flag_blocks_new_readers() {
        let sem = RwcSem::new();
        assert!(sem.try_acquire(RwcOp::Read));
        sem.set_commit_flag();
        assert!(!sem.try_acquire(RwcOp::Read));
        sem.release(RwcOp::Read);
        // the publisher is the only commit owner; after drain it enters
        assert!(!sem.try_acquire(RwcOp::Write));
    }

    #[test]
    fn test_lock_excludes_commit_and_vice_versa() {
        let sem = RwcSem::new();
        assert!(sem.try_acquire(RwcOp::Lock));
        assert!(!sem.try_acquire(RwcOp::Commit));
        sem.release(RwcOp::Lock);
        assert!(sem.try_acquire(RwcOp::Commit));
        assert!(!sem.try_acquire(RwcOp::Lock));
    }

    #[test]
    fn test_lock_flag_refuses_new_readers() {
        let sem = RwcSem::new();
        assert!(sem.try_acquire(RwcOp::Read));
        sem.set_lock_flag();
        assert!(!sem.try_acquire(RwcOp::Read));
        assert!(!sem.try_acquire(RwcOp::Write));
        sem.release(RwcOp::Read);
    }

    #[test]
    fn test_switch_write_to_commit() {
        let sem = RwcSem::new();
        assert!(sem.try_acquire(RwcOp::Write));
        assert!(sem.try_switch(RwcOp::Write, RwcOp::Commit));
        assert_eq!(sem.raw() & WRITE_BIT, 0);
        assert!(!sem.try_acquire(RwcOp::Read));
        sem.release(RwcOp::Commit);
        assert_eq!(sem.raw(), 0);
    }

    #[test]
    fn test_switch_write_to_read() {
        let sem = RwcSem::new();
        assert!(sem.try_acquire(RwcOp::Write));
        assert!(sem.try_switch(RwcOp::Write, RwcOp::Read));
        // another reader may now join
        assert!(sem.try_acquire(RwcOp::Read));
        sem.release(RwcOp::Read);
        sem.release(RwcOp::Read);
        assert_eq!(sem.raw(), 0);
    }

    #[test]
    fn test_switch_to_read_fails_under_published_commit() {
        let sem = RwcSem::new();
        assert!(sem.try_acquire(RwcOp::Write));
        sem.set_commit_flag();
        assert!(!sem.try_switch(RwcOp::Write, RwcOp::Read));
        // the write is still held
        assert_eq!(sem.raw() & WRITE_BIT, WRITE_BIT);
    }

    #[test]
    fn test_switch_undefined_transitions() {
        let sem = RwcSem::new();
        assert!(sem.try_acquire(RwcOp::Read));
        assert!(!sem.try_switch(RwcOp::Read, RwcOp::Write));
        sem.release(RwcOp::Read);
        assert!(sem.try_acquire(RwcOp::Write));
        assert!(!sem.try_switch(RwcOp::Write, RwcOp::Lock));
        sem.release(RwcOp::Write);
    }
}
