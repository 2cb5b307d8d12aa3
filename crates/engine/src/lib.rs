//! RaleighSL engine
//!
//! The transactional core: object scheduler, semantic layer, two-phase
//! transaction manager, 2Q object cache, and the typed object engines
//! (sorted set, memcache) behind the type v-table.
//!
//! External request adapters drive the engine through the `exec_*` entry
//! points on [`Engine`]; each call schedules a task and fires its notify
//! callback exactly once.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod engine;
pub mod memcache;
mod obj_cache;
pub mod object;
pub mod sched;
pub mod semantic;
pub mod sset;
pub mod transaction;

pub use engine::Engine;
pub use obj_cache::ObjectCache;
pub use object::{Object, ObjectType};
pub use sched::{Completion, NotifyFn, ReadFn, WriteFn};
pub use semantic::{SemanticLayer, SemanticOpFn};
pub use transaction::{Transaction, TxnManager, TxnState};

pub use raleighsl_core::{ByteRef, EngineConfig, Errno, Oid, RslResult, TxnId};
