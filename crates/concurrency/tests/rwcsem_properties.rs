//! Property tests for the read/write/commit semaphore
//!
//! For every sequence of acquire/release operations, at any instant:
//! - at most one WRITE is active
//! - WRITE implies no READ
//! - COMMIT implies no READ and no WRITE
//! - LOCK and COMMIT never coexist
//!
//! The model below mirrors every grant/release against plain counters and
//! checks the invariants after each step.

use proptest::prelude::*;
use raleighsl_concurrency::{RwcOp, RwcSem};

#[derive(Debug, Default)]
struct Model {
    readers: u32,
    writer: bool,
    commit: bool,
    lock: bool,
}

impl Model {
    fn check(&self) {
        if self.writer {
            assert_eq!(self.readers, 0, "WRITE implies no READ");
        }
        if self.commit {
            assert_eq!(self.readers, 0, "COMMIT implies no READ");
            assert!(!self.writer, "COMMIT implies no WRITE");
        }
        assert!(!(self.lock && self.commit), "LOCK and COMMIT coexist");
    }

    fn grant(&mut self, op: RwcOp) {
        match op {
            RwcOp::Read => self.readers += 1,
            RwcOp::Write => self.writer = true,
            RwcOp::Commit => self.commit = true,
            RwcOp::Lock => self.lock = true,
        }
        self.check();
    }

    fn release(&mut self, op: RwcOp) {
        match op {
            RwcOp::Read => self.readers -= 1,
            RwcOp::Write => self.writer = false,
            RwcOp::Commit => self.commit = false,
            RwcOp::Lock => self.lock = false,
        }
        self.check();
    }

    fn holds(&self, op: RwcOp) -> bool {
        match op {
            RwcOp::Read => self.readers > 0,
            RwcOp::Write => self.writer,
            RwcOp::Commit => self.commit,
            RwcOp::Lock => self.lock,
        }
    }
}

fn op_strategy() -> impl Strategy<Value = RwcOp> {
    prop_oneof![
        Just(RwcOp::Read),
        Just(RwcOp::Write),
        Just(RwcOp::Commit),
        Just(RwcOp::Lock),
    ]
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Acquire(RwcOp),
    Release(RwcOp),
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        op_strategy().prop_map(Step::Acquire),
        op_strategy().prop_map(Step::Release),
    ]
}

proptest! {
    #[test]
    fn invariants_hold_for_any_op_sequence(steps in prop::collection::vec(step_strategy(), 0..200)) {
        let sem = RwcSem::new();
        let mut model = Model::default();

        for step in steps {
            match step {
                Step::Acquire(op) => {
                    if sem.try_acquire(op) {
                        model.grant(op);
                    }
                }
                Step::Release(op) => {
                    // only release what the model actually holds
                    if model.holds(op) {
                        sem.release(op);
                        model.release(op);
                    }
                }
            }
        }
    }

    #[test]
    fn read_admission_matches_flags(readers in 0u32..4, commit in any::<bool>(), lock in any::<bool>()) {
        let sem = RwcSem::new();
        for _ in 0..readers {
            prop_assert!(sem.try_acquire(RwcOp::Read));
        }
        if commit {
            sem.set_commit_flag();
        }
        if lock {
            sem.set_lock_flag();
        }
        // new reads enter only with no pending commit/lock intention
        prop_assert_eq!(sem.try_acquire(RwcOp::Read), !commit && !lock);
    }
}
