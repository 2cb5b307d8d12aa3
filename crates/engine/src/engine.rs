//! Engine handle
//!
//! One `Engine` owns the task scheduler, the object cache, the semantic
//! layer, the transaction manager, the device collaborator and the
//! configuration. Nothing here is process-global; tests run several
//! engines side by side in one process.

use raleighsl_concurrency::TaskScheduler;
use raleighsl_core::{EngineConfig, Errno, Oid, RslResult};
use raleighsl_storage::{BlockDevice, MemDevice};
use std::any::Any;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::obj_cache::ObjectCache;
use crate::object::{Object, ObjectType};
use crate::semantic::SemanticLayer;
use crate::transaction::TxnManager;

/// The engine: every `exec_*` entry point hangs off an `Arc<Engine>`
pub struct Engine {
    config: EngineConfig,
    pub(crate) scheduler: Arc<TaskScheduler>,
    pub(crate) obj_cache: ObjectCache,
    pub(crate) semantic: SemanticLayer,
    pub(crate) txn_mgr: TxnManager,
    device: Arc<dyn BlockDevice>,
    // tasks carry an owning handle back to the engine
    self_ref: Weak<Engine>,
}

impl Engine {
    /// Engine over an in-memory device
    pub fn new(config: EngineConfig) -> RslResult<Arc<Engine>> {
        Self::with_device(config, Arc::new(MemDevice::new()))
    }

    /// Engine over a caller-supplied device collaborator
    pub fn with_device(
        config: EngineConfig,
        device: Arc<dyn BlockDevice>,
    ) -> RslResult<Arc<Engine>> {
        config.validate()?;
        let scheduler = TaskScheduler::new(config.threads);
        let obj_cache = ObjectCache::new(config.object_cache_capacity as usize);
        let txn_mgr = TxnManager::new(
            config.txn_cache_capacity as usize,
            config.txn_idle_eviction_seconds as u64,
        );
        debug!(threads = config.threads, "engine starting");
        Ok(Arc::new_cyclic(|self_ref| Engine {
            config,
            scheduler,
            obj_cache,
            semantic: SemanticLayer::new(),
            txn_mgr,
            device,
            self_ref: self_ref.clone(),
        }))
    }

    /// Owning handle to this engine, for task construction
    pub(crate) fn handle(&self) -> Arc<Engine> {
        self.self_ref.upgrade().expect("engine handle outlives tasks")
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Semantic layer (name → OID map)
    pub fn semantic(&self) -> &SemanticLayer {
        &self.semantic
    }

    /// The block-device collaborator
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Flush every cached object and the device
    pub fn sync(&self) -> RslResult<()> {
        for object in self.obj_cache.snapshot() {
            if object.object_type().is_some() {
                self.object_sync(&object)?;
            }
        }
        self.device.sync()
    }

    /// Stop the worker pool; queued work is dropped
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    // ------------------------------------------------------------------
    // object cache wrappers (eviction hooks run on the caller's path)
    // ------------------------------------------------------------------

    fn run_eviction(&self, evicted: Vec<Arc<Object>>) {
        for object in evicted {
            if let Some(vtable) = object.object_type() {
                if let Err(errno) = vtable.sync(self, &object) {
                    warn!(oid = %object.oid(), %errno, "sync on eviction failed");
                }
                if let Err(errno) = vtable.close(self, &object) {
                    warn!(oid = %object.oid(), %errno, "close on eviction failed");
                }
            }
        }
    }

    /// Pinned object reference, created blank on miss
    pub fn obj_cache_get(&self, oid: Oid) -> Arc<Object> {
        let (object, evicted) = self.obj_cache.get(oid);
        self.run_eviction(evicted);
        object
    }

    /// Drop a pin taken by [`Engine::obj_cache_get`]
    pub fn obj_cache_release(&self, object: &Arc<Object>) {
        let evicted = self.obj_cache.release(object);
        self.run_eviction(evicted);
    }

    // ------------------------------------------------------------------
    // type v-table dispatch
    // ------------------------------------------------------------------

    pub(crate) fn object_create(&self, vtable: Arc<dyn ObjectType>, oid: Oid) -> RslResult<()> {
        let object = self.obj_cache_get(oid);
        object.set_type(vtable.clone());
        let result = vtable.create(self, &object);
        self.obj_cache_release(&object);
        result
    }

    pub(crate) fn object_open(&self, object: &Object) -> RslResult<()> {
        let Some(vtable) = object.object_type() else {
            warn!(oid = %object.oid(), "open without a type attached");
            return Err(Errno::PluginNotLoaded);
        };
        if object.is_open() {
            return Ok(());
        }
        vtable.open(self, object)
    }

    pub(crate) fn object_commit(&self, object: &Object) -> RslResult<()> {
        object
            .object_type()
            .ok_or(Errno::NotImplemented)?
            .commit(self, object)
    }

    pub(crate) fn object_rollback(&self, object: &Object) -> RslResult<()> {
        object
            .object_type()
            .ok_or(Errno::NotImplemented)?
            .rollback(self, object)
    }

    pub(crate) fn object_apply(
        &self,
        object: &Object,
        mutation: Box<dyn Any + Send>,
    ) -> RslResult<()> {
        object
            .object_type()
            .ok_or(Errno::NotImplemented)?
            .apply(self, object, mutation)
    }

    pub(crate) fn object_revert(
        &self,
        object: &Object,
        mutation: Box<dyn Any + Send>,
    ) -> RslResult<()> {
        object
            .object_type()
            .ok_or(Errno::NotImplemented)?
            .revert(self, object, mutation)
    }

    pub(crate) fn object_sync(&self, object: &Object) -> RslResult<()> {
        object
            .object_type()
            .ok_or(Errno::NotImplemented)?
            .sync(self, object)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}
