//! # RaleighSL
//!
//! An in-process storage engine exposing typed object abstractions behind
//! a transactional core. Objects live in a 2Q cache keyed by OID, names
//! resolve through the semantic layer, and every operation runs as a
//! cooperative task over the read/write/commit semaphore discipline.
//!
//! # Quick Start
//!
//! ```no_run
//! use raleighsl::{ByteRef, Engine, EngineConfig, TxnId};
//! use raleighsl::sset;
//! use std::sync::mpsc;
//!
//! let engine = Engine::new(EngineConfig::default())?;
//!
//! // create a sorted set and wait for the notifier
//! let (tx, rx) = mpsc::channel();
//! engine.exec_create(
//!     Box::new(|fs| fs.semantic_create(b"scores", sset::sset_type())),
//!     Box::new(move |_fs, completion| {
//!         let _ = tx.send(completion);
//!     }),
//! );
//! let oid = rx.recv().unwrap().oid;
//!
//! // auto-commit insert
//! let (tx, rx) = mpsc::channel();
//! engine.exec_write(
//!     TxnId::NONE,
//!     oid,
//!     Box::new(|fs, txn, object| {
//!         sset::insert(fs, txn, object, true,
//!             ByteRef::copy_from(b"alice"), ByteRef::copy_from(b"100"))
//!     }),
//!     Box::new(move |_fs, completion| {
//!         let _ = tx.send(completion);
//!     }),
//! );
//! rx.recv().unwrap().result?;
//! # Ok::<(), raleighsl::Errno>(())
//! ```
//!
//! # Layers
//!
//! | Crate | Responsibility |
//! |-------|----------------|
//! | `raleighsl-core` | ids, byte refs, errno taxonomy, configuration |
//! | `raleighsl-concurrency` | RWCSEM, tasks, worker-pool scheduler |
//! | `raleighsl-storage` | bucket block codec, COW-AVL page, device |
//! | `raleighsl-engine` | object scheduler, transactions, type engines |

pub use raleighsl_core::{ByteRef, EngineConfig, Errno, Oid, RslResult, SeqId, TxnId};

pub use raleighsl_concurrency::{RwcOp, RwcSem, TaskScheduler};

pub use raleighsl_storage::{Avl16Page, AvlTxn, BlockDevice, MemDevice};

pub use raleighsl_engine::{
    memcache, sset, Completion, Engine, NotifyFn, Object, ObjectType, ReadFn, Transaction,
    TxnState, WriteFn,
};
