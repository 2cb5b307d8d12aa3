//! Objects and the type v-table
//!
//! An object is one cache entry: an OID, a type v-table slot, the
//! type-owned in-memory state (`membufs`), a device-buffer handle, a
//! per-object semaphore and the pending-transaction marker that the
//! two-phase barrier publishes.
//!
//! The semaphore carries the logical access discipline (readers shared,
//! writer exclusive, commit and barrier above both); the mutex around the
//! type state exists for the memory model and is never contended along a
//! correctly scheduled path.

use parking_lot::{Mutex, MutexGuard, RwLock};
use raleighsl_concurrency::TaskRwcSem;
use raleighsl_core::{Oid, RslResult, TxnId};
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::engine::Engine;

/// Type v-table implemented by every object type
///
/// `create`, `close`, `commit`, `rollback`, `apply` and `revert` are
/// required for a transactional type. `open` is only invoked for objects
/// that are not yet open (a freshly created object is already open), and
/// `unlink` and `sync` default to a no-op.
pub trait ObjectType: Send + Sync + 'static {
    /// Short type label ("sset", "memcache")
    fn label(&self) -> &'static str;

    /// Allocate the object's in-memory state
    fn create(&self, fs: &Engine, object: &Object) -> RslResult<()>;

    /// Lazily load state on first use of a non-open object
    fn open(&self, _fs: &Engine, _object: &Object) -> RslResult<()> {
        Err(raleighsl_core::Errno::NotImplemented)
    }

    /// Tear down in-memory state on eviction
    fn close(&self, fs: &Engine, object: &Object) -> RslResult<()>;

    /// Durability barrier; for the sorted set this runs the merge pass
    fn sync(&self, _fs: &Engine, _object: &Object) -> RslResult<()> {
        Ok(())
    }

    /// The object's name was removed from the semantic layer
    fn unlink(&self, _fs: &Engine, _object: &Object) -> RslResult<()> {
        Ok(())
    }

    /// Promote mutations staged since the last commit
    fn commit(&self, fs: &Engine, object: &Object) -> RslResult<()>;

    /// Discard mutations staged since the last commit
    fn rollback(&self, fs: &Engine, object: &Object) -> RslResult<()>;

    /// Apply one transaction atom; the engine owns the mutation afterwards
    fn apply(&self, fs: &Engine, object: &Object, mutation: Box<dyn Any + Send>) -> RslResult<()>;

    /// Abandon one transaction atom
    fn revert(&self, fs: &Engine, object: &Object, mutation: Box<dyn Any + Send>) -> RslResult<()>;
}

/// One cached object
pub struct Object {
    oid: Oid,
    pub(crate) rwcsem: TaskRwcSem,
    pending_txn_id: AtomicU64,
    vtable: RwLock<Option<Arc<dyn ObjectType>>>,
    membufs: Mutex<Option<Box<dyn Any + Send>>>,
    devbufs: AtomicU64,
}

impl Object {
    pub(crate) fn new(oid: Oid) -> Arc<Object> {
        Arc::new(Object {
            oid,
            rwcsem: TaskRwcSem::new(),
            pending_txn_id: AtomicU64::new(0),
            vtable: RwLock::new(None),
            membufs: Mutex::new(None),
            devbufs: AtomicU64::new(0),
        })
    }

    /// Object identifier
    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// The attached type, if any
    pub fn object_type(&self) -> Option<Arc<dyn ObjectType>> {
        self.vtable.read().clone()
    }

    pub(crate) fn set_type(&self, vtable: Arc<dyn ObjectType>) {
        *self.vtable.write() = Some(vtable);
    }

    /// True once the type state has been created or loaded
    pub fn is_open(&self) -> bool {
        self.membufs.lock().is_some()
    }

    /// Type-owned in-memory state
    ///
    /// Type engines downcast the boxed state to their own type.
    pub fn membufs(&self) -> MutexGuard<'_, Option<Box<dyn Any + Send>>> {
        self.membufs.lock()
    }

    /// Transaction currently holding the two-phase barrier on this object
    pub fn pending_txn(&self) -> TxnId {
        TxnId(self.pending_txn_id.load(Ordering::Acquire))
    }

    pub(crate) fn set_pending_txn(&self, txn_id: TxnId) {
        self.pending_txn_id.store(txn_id.as_u64(), Ordering::Release);
    }

    /// Device-buffer handle owned by the storage backend
    pub fn devbufs(&self) -> u64 {
        self.devbufs.load(Ordering::Acquire)
    }

    /// Attach a device-buffer handle
    pub fn set_devbufs(&self, handle: u64) {
        self.devbufs.store(handle, Ordering::Release);
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("oid", &self.oid)
            .field("pending_txn", &self.pending_txn())
            .field("open", &self.is_open())
            .finish()
    }
}
