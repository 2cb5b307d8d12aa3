//! 2Q object cache
//!
//! Maps OID to pinned objects through three internal queues:
//!
//! - **A1-in**: FIFO of first-touch entries
//! - **A1-out**: ghost history of OIDs recently pushed out of A1-in
//! - **Am**: recency list (access stamps) for entries that proved hot
//!
//! An entry whose OID is found in the ghost history on re-admission goes
//! straight to Am. Pinned entries (refcount > 0) are never evicted; the
//! cache hands evicted objects back to the caller, which runs the type's
//! `sync` and `close` hooks on its own task path, outside the cache lock.

use parking_lot::Mutex;
use raleighsl_core::Oid;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::trace;

use crate::object::Object;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queue {
    A1In,
    Am,
}

struct Slot {
    object: Arc<Object>,
    pins: u32,
    queue: Queue,
    stamp: u64,
}

struct Shard {
    slots: FxHashMap<u64, Slot>,
    a1in: VecDeque<u64>,
    a1out: VecDeque<u64>,
    a1out_set: FxHashSet<u64>,
    am: BTreeMap<u64, u64>,
    next_stamp: u64,
}

/// 2Q cache of `(OID → object)`
pub struct ObjectCache {
    shard: Mutex<Shard>,
    capacity: usize,
    ghost_capacity: usize,
}

impl ObjectCache {
    /// Cache bounded to `capacity` live entries
    pub fn new(capacity: usize) -> Self {
        ObjectCache {
            shard: Mutex::new(Shard {
                slots: FxHashMap::default(),
                a1in: VecDeque::new(),
                a1out: VecDeque::new(),
                a1out_set: FxHashSet::default(),
                am: BTreeMap::new(),
                next_stamp: 0,
            }),
            capacity: capacity.max(2),
            ghost_capacity: capacity.max(2) / 2,
        }
    }

    /// Pinned reference, creating a blank object record on miss
    ///
    /// Returns the evicted objects the caller must `sync` + `close`.
    pub fn get(&self, oid: Oid) -> (Arc<Object>, Vec<Arc<Object>>) {
        let mut shard = self.shard.lock();
        if let Some(slot) = shard.slots.get_mut(&oid.as_u64()) {
            slot.pins += 1;
            let object = slot.object.clone();
            self.touch(&mut shard, oid.as_u64());
            return (object, Vec::new());
        }

        let object = Object::new(oid);
        let evicted = self.admit(&mut shard, object.clone(), 1);
        (object, evicted)
    }

    /// Pin an existing entry, or None on miss
    pub fn lookup(&self, oid: Oid) -> Option<Arc<Object>> {
        let mut shard = self.shard.lock();
        let slot = shard.slots.get_mut(&oid.as_u64())?;
        slot.pins += 1;
        let object = slot.object.clone();
        self.touch(&mut shard, oid.as_u64());
        Some(object)
    }

    /// Insert an externally built object unless the OID is already present
    ///
    /// On conflict the pre-existing entry is pinned and returned together
    /// with the caller's entry, which stays uninserted.
    #[allow(clippy::type_complexity)]
    pub fn try_insert(
        &self,
        object: Arc<Object>,
    ) -> (Arc<Object>, Option<Arc<Object>>, Vec<Arc<Object>>) {
        let mut shard = self.shard.lock();
        let key = object.oid().as_u64();
        if let Some(slot) = shard.slots.get_mut(&key) {
            slot.pins += 1;
            let existing = slot.object.clone();
            self.touch(&mut shard, key);
            return (existing, Some(object), Vec::new());
        }
        let evicted = self.admit(&mut shard, object.clone(), 1);
        (object, None, evicted)
    }

    /// Remove and return the entry if it is unpinned
    pub fn remove(&self, oid: Oid) -> Option<Arc<Object>> {
        let mut shard = self.shard.lock();
        let key = oid.as_u64();
        match shard.slots.get(&key) {
            Some(slot) if slot.pins == 0 => {}
            _ => return None,
        }
        let slot = shard.slots.remove(&key).expect("checked above");
        match slot.queue {
            Queue::A1In => shard.a1in.retain(|&o| o != key),
            Queue::Am => {
                shard.am.remove(&slot.stamp);
            }
        }
        Some(slot.object)
    }

    /// Unpin; over-capacity unpinned entries become evictable
    ///
    /// Returns the objects evicted on this call; the caller runs their
    /// `sync` and `close` hooks.
    pub fn release(&self, object: &Arc<Object>) -> Vec<Arc<Object>> {
        let mut shard = self.shard.lock();
        let key = object.oid().as_u64();
        if let Some(slot) = shard.slots.get_mut(&key) {
            debug_assert!(slot.pins > 0, "release without a pin");
            slot.pins -= 1;
        }
        self.evict_over_capacity(&mut shard)
    }

    /// Live entry count
    pub fn len(&self) -> usize {
        self.shard.lock().slots.len()
    }

    /// True when no entries are cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain every unpinned entry (engine shutdown/sync path)
    pub fn drain_unpinned(&self) -> Vec<Arc<Object>> {
        let mut shard = self.shard.lock();
        let keys: Vec<u64> = shard
            .slots
            .iter()
            .filter(|(_, slot)| slot.pins == 0)
            .map(|(&k, _)| k)
            .collect();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let slot = shard.slots.remove(&key).expect("listed above");
            match slot.queue {
                Queue::A1In => shard.a1in.retain(|&o| o != key),
                Queue::Am => {
                    shard.am.remove(&slot.stamp);
                }
            }
            out.push(slot.object);
        }
        out
    }

    /// Every cached object, pinned or not (engine-wide sync)
    pub fn snapshot(&self) -> Vec<Arc<Object>> {
        let shard = self.shard.lock();
        shard.slots.values().map(|s| s.object.clone()).collect()
    }

    fn touch(&self, shard: &mut Shard, key: u64) {
        let next_stamp = {
            shard.next_stamp += 1;
            shard.next_stamp
        };
        let slot = shard.slots.get_mut(&key).expect("touch of missing slot");
        match slot.queue {
            // A1-in entries keep their FIFO position
            Queue::A1In => {}
            Queue::Am => {
                let old = slot.stamp;
                slot.stamp = next_stamp;
                shard.am.remove(&old);
                shard.am.insert(next_stamp, key);
            }
        }
    }

    fn admit(&self, shard: &mut Shard, object: Arc<Object>, pins: u32) -> Vec<Arc<Object>> {
        let key = object.oid().as_u64();
        shard.next_stamp += 1;
        let stamp = shard.next_stamp;

        let queue = if shard.a1out_set.remove(&key) {
            shard.a1out.retain(|&o| o != key);
            Queue::Am
        } else {
            Queue::A1In
        };
        match queue {
            Queue::A1In => shard.a1in.push_back(key),
            Queue::Am => {
                shard.am.insert(stamp, key);
            }
        }
        shard.slots.insert(
            key,
            Slot {
                object,
                pins,
                queue,
                stamp,
            },
        );
        self.evict_over_capacity(shard)
    }

    fn evict_over_capacity(&self, shard: &mut Shard) -> Vec<Arc<Object>> {
        let mut evicted = Vec::new();
        while shard.slots.len() > self.capacity {
            if let Some(object) = self.evict_one(shard) {
                trace!(oid = %object.oid(), "evicting object");
                evicted.push(object);
            } else {
                // everything is pinned; admission never evicts a pinned entry
                break;
            }
        }
        evicted
    }

    fn evict_one(&self, shard: &mut Shard) -> Option<Arc<Object>> {
        // prefer the A1-in FIFO front, remembering the OID as a ghost
        let mut scanned = Vec::new();
        let mut victim = None;
        while let Some(key) = shard.a1in.pop_front() {
            let pinned = shard.slots.get(&key).map(|s| s.pins > 0).unwrap_or(false);
            if pinned {
                scanned.push(key);
                continue;
            }
            victim = Some((key, true));
            break;
        }
        // pinned entries return to the FIFO front in their original order
        for key in scanned.into_iter().rev() {
            shard.a1in.push_front(key);
        }

        // fall back to the coldest unpinned Am entry
        if victim.is_none() {
            let key = shard
                .am
                .iter()
                .map(|(_, &k)| k)
                .find(|k| shard.slots.get(k).map(|s| s.pins == 0).unwrap_or(false));
            victim = key.map(|k| (k, false));
        }

        let (key, ghost) = victim?;
        let slot = shard.slots.remove(&key)?;
        match slot.queue {
            Queue::A1In => {}
            Queue::Am => {
                shard.am.remove(&slot.stamp);
            }
        }
        if ghost {
            shard.a1out.push_back(key);
            shard.a1out_set.insert(key);
            while shard.a1out.len() > self.ghost_capacity {
                if let Some(old) = shard.a1out.pop_front() {
                    shard.a1out_set.remove(&old);
                }
            }
        }
        Some(slot.object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_returns_same_entry_until_released() {
        let cache = ObjectCache::new(16);
        let (a, _) = cache.get(Oid(1));
        let (b, _) = cache.get(Oid(1));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        cache.release(&a);
        cache.release(&b);
    }

    #[test]
    fn test_pinned_entries_survive_pressure() {
        let cache = ObjectCache::new(2);
        let (a, _) = cache.get(Oid(1));
        let (b, _) = cache.get(Oid(2));
        // both pinned; admitting more evicts nothing
        let (c, evicted) = cache.get(Oid(3));
        assert!(evicted.is_empty() || evicted.iter().all(|o| o.oid() != Oid(1) && o.oid() != Oid(2)));
        cache.release(&a);
        cache.release(&b);
        cache.release(&c);
    }

    #[test]
    fn test_eviction_only_at_zero_pins() {
        let cache = ObjectCache::new(2);
        let (a, _) = cache.get(Oid(1));
        cache.release(&a);
        let (b, _) = cache.get(Oid(2));
        cache.release(&b);
        // a third admission pushes the FIFO front out
        let (c, evicted) = cache.get(Oid(3));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].oid(), Oid(1));
        cache.release(&c);
    }

    #[test]
    fn test_ghost_readmission_goes_hot() {
        let cache = ObjectCache::new(2);
        for oid in 1..=3u64 {
            let (o, _) = cache.get(Oid(oid));
            cache.release(&o);
        }
        // oid 1 was ghosted; its return admits straight to Am
        let (o, _) = cache.get(Oid(1));
        cache.release(&o);
        let shard = cache.shard.lock();
        assert_eq!(shard.slots.get(&1).map(|s| s.queue), Some(Queue::Am));
    }

    #[test]
    fn test_try_insert_is_idempotent() {
        let cache = ObjectCache::new(16);
        let mine = Object::new(Oid(9));
        let (kept, rejected, _) = cache.try_insert(mine.clone());
        assert!(Arc::ptr_eq(&kept, &mine));
        assert!(rejected.is_none());

        let other = Object::new(Oid(9));
        let (kept2, rejected, _) = cache.try_insert(other.clone());
        assert!(Arc::ptr_eq(&kept2, &mine));
        assert!(Arc::ptr_eq(&rejected.unwrap(), &other));
        cache.release(&kept);
        cache.release(&kept2);
    }

    #[test]
    fn test_remove_refuses_pinned() {
        let cache = ObjectCache::new(16);
        let (a, _) = cache.get(Oid(4));
        assert!(cache.remove(Oid(4)).is_none());
        cache.release(&a);
        assert!(cache.remove(Oid(4)).is_some());
        assert!(cache.is_empty());
    }
}
