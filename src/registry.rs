//! The statement registry: two views over one set of records.
//!
//! The global view maps the host-visible handle to a *weak* reference and
//! never moves the protocol refcount. Per-thread caches hold *strong*
//! references and each cache membership is one refcount unit. The engine
//! holds one more unit (the owner reference) from prepare until finalize.
//! The rule is rigid on purpose: mixing strong/weak per call site is the
//! bug cluster this design replaces.

use std::cell::RefCell;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::statement::StatementRecord;

/// Entries a thread keeps hot before old ones spill back to the global map.
const THREAD_CACHE_CAP: usize = 128;

pub struct Registry {
    global: RwLock<FxHashMap<usize, Weak<StatementRecord>>>,
    owners: Mutex<FxHashMap<usize, Arc<StatementRecord>>>,
}

struct ThreadCache {
    epoch: u64,
    map: FxHashMap<usize, Arc<StatementRecord>>,
    order: Vec<usize>,
}

impl ThreadCache {
    fn new() -> ThreadCache {
        ThreadCache {
            epoch: crate::fork::epoch(),
            map: FxHashMap::default(),
            order: Vec::new(),
        }
    }

    /// Drop everything without touching protocol refcounts. Used in the
    /// fork child, where the parent's bookkeeping no longer applies.
    fn clear_silent(&mut self) {
        self.map.clear();
        self.order.clear();
        self.epoch = crate::fork::epoch();
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        if self.epoch != crate::fork::epoch() {
            return;
        }
        for (_, record) in self.map.drain() {
            release_and_maybe_destroy(&record);
        }
    }
}

thread_local! {
    static CACHE: RefCell<ThreadCache> = RefCell::new(ThreadCache::new());
}

fn with_cache<R>(f: impl FnOnce(&mut ThreadCache) -> R) -> R {
    CACHE.with(|c| {
        let mut cache = c.borrow_mut();
        if cache.epoch != crate::fork::epoch() {
            cache.clear_silent();
        }
        f(&mut cache)
    })
}

fn release_and_maybe_destroy(record: &Arc<StatementRecord>) {
    if record.release_ref() == 0 {
        record.destroy();
    }
}

/// Child-side of fork: forget the calling thread's strong references.
pub fn clear_thread_cache_after_fork() {
    let _ = CACHE.try_with(|c| {
        if let Ok(mut cache) = c.try_borrow_mut() {
            cache.clear_silent();
        }
    });
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            global: RwLock::new(FxHashMap::default()),
            owners: Mutex::new(FxHashMap::default()),
        }
    }

    /// Insert a fresh record under its host-visible handle. The record
    /// arrives carrying the owner reference; the global view stays weak.
    pub fn register(&self, handle: usize, record: &Arc<StatementRecord>) {
        self.global.write().insert(handle, Arc::downgrade(record));
        self.owners.lock().insert(handle, Arc::clone(record));
    }

    /// O(1) lookup with no refcount movement.
    pub fn lookup(&self, handle: usize) -> Option<Arc<StatementRecord>> {
        let hit = with_cache(|c| c.map.get(&handle).cloned());
        if hit.is_some() {
            return hit;
        }
        self.global.read().get(&handle).and_then(Weak::upgrade)
    }

    /// Lookup and pin into the calling thread's cache (one refcount unit
    /// per cache membership).
    pub fn lookup_cached(&self, handle: usize) -> Option<Arc<StatementRecord>> {
        if let Some(record) = with_cache(|c| c.map.get(&handle).cloned()) {
            return Some(record);
        }
        let record = self.global.read().get(&handle).and_then(Weak::upgrade)?;
        self.cache(handle, &record);
        Some(record)
    }

    /// Pin `record` in the calling thread's cache.
    pub fn cache(&self, handle: usize, record: &Arc<StatementRecord>) {
        let evicted = with_cache(|c| {
            if c.map.contains_key(&handle) {
                return Vec::new();
            }
            record.retain();
            c.map.insert(handle, Arc::clone(record));
            c.order.push(handle);
            let mut evicted = Vec::new();
            while c.order.len() > THREAD_CACHE_CAP {
                let old = c.order.remove(0);
                if let Some(rec) = c.map.remove(&old) {
                    evicted.push(rec);
                }
            }
            evicted
        });
        for rec in evicted {
            release_and_maybe_destroy(&rec);
        }
    }

    /// Unpin from the calling thread's cache; may destroy the record.
    pub fn uncache(&self, handle: usize) {
        let removed = with_cache(|c| {
            c.order.retain(|h| *h != handle);
            c.map.remove(&handle)
        });
        if let Some(record) = removed {
            release_and_maybe_destroy(&record);
        }
    }

    /// Remove from the global view only; refcount untouched.
    pub fn unregister(&self, handle: usize) {
        self.global.write().remove(&handle);
    }

    /// The finalize protocol: uncache here, unregister globally, drop the
    /// owner reference. Returns false when the handle was not registered
    /// (double finalize is a logged no-op, never a crash).
    pub fn finalize(&self, handle: usize) -> bool {
        self.uncache(handle);
        self.unregister(handle);
        let owner = self.owners.lock().remove(&handle);
        match owner {
            Some(record) => {
                release_and_maybe_destroy(&record);
                true
            }
            None => {
                tracing::debug!("registry: finalize of unknown handle {handle:#x}");
                false
            }
        }
    }

    /// Number of live registered handles (weak entries may linger briefly
    /// after finalize; they no longer upgrade).
    pub fn live(&self) -> usize {
        self.global
            .read()
            .values()
            .filter(|w| w.upgrade().is_some())
            .count()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::test_support::offline_record;

    #[test]
    fn register_then_lookup() {
        let reg = Registry::new();
        let rec = offline_record("SELECT 1");
        reg.register(0x1000, &rec);
        assert!(reg.lookup(0x1000).is_some());
        assert_eq!(rec.refcount(), 1);
        assert!(reg.lookup(0x2000).is_none());
    }

    #[test]
    fn cache_is_strong_global_is_weak() {
        let reg = Registry::new();
        let rec = offline_record("SELECT 1");
        reg.register(0x1000, &rec);
        reg.cache(0x1000, &rec);
        assert_eq!(rec.refcount(), 2);
        // Double-caching on the same thread is a no-op.
        reg.cache(0x1000, &rec);
        assert_eq!(rec.refcount(), 2);
        reg.uncache(0x1000);
        assert_eq!(rec.refcount(), 1);
    }

    #[test]
    fn finalize_protocol_reaches_zero_exactly_once() {
        let reg = Registry::new();
        let rec = offline_record("SELECT 1");
        reg.register(0x1000, &rec);
        reg.cache(0x1000, &rec);
        assert!(reg.finalize(0x1000));
        assert_eq!(rec.refcount(), 0);
        assert!(rec.is_destroyed());
        // Double finalize: no-op, no underflow.
        assert!(!reg.finalize(0x1000));
        assert_eq!(rec.refcount(), 0);
        assert!(reg.lookup(0x1000).is_none());
    }

    #[test]
    fn record_survives_while_another_cache_holds_it() {
        let reg = Arc::new(Registry::new());
        let rec = offline_record("SELECT 1");
        reg.register(0x1000, &rec);

        // Another thread pins the record in its cache.
        let reg2 = Arc::clone(&reg);
        let rec2 = Arc::clone(&rec);
        let (tx, rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let other = std::thread::spawn(move || {
            reg2.cache(0x1000, &rec2);
            tx.send(()).unwrap();
            // Hold the cache until told to exit.
            done_rx.recv().ok();
        });
        rx.recv().unwrap();

        assert!(reg.finalize(0x1000));
        // Owner dropped, but the other thread's pin keeps it alive.
        assert_eq!(rec.refcount(), 1);
        assert!(!rec.is_destroyed());

        done_tx.send(()).unwrap();
        other.join().unwrap();
        // Thread exit drained its cache and destroyed the record.
        assert_eq!(rec.refcount(), 0);
        assert!(rec.is_destroyed());
    }

    #[test]
    fn refcount_never_goes_negative() {
        let reg = Registry::new();
        let rec = offline_record("SELECT 1");
        reg.register(0x1000, &rec);
        assert!(reg.finalize(0x1000));
        assert_eq!(rec.refcount(), 0);
        // A stray release is detected and clamped.
        assert_eq!(rec.release_ref(), 0);
        assert_eq!(rec.refcount(), 0);
    }

    #[test]
    fn eviction_releases_the_oldest_entry() {
        let reg = Registry::new();
        let first = offline_record("SELECT 1");
        reg.register(1, &first);
        reg.cache(1, &first);
        assert_eq!(first.refcount(), 2);
        let mut keep = Vec::new();
        for h in 2..(THREAD_CACHE_CAP + 2) {
            let rec = offline_record("SELECT 1");
            reg.register(h, &rec);
            reg.cache(h, &rec);
            keep.push(rec);
        }
        // First entry fell off the cache and lost its cache unit.
        assert_eq!(first.refcount(), 1);
    }
}
