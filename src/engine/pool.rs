// FLOWLINE — FIXED-SIZE OBJECT POOLS
// Packets, batches and tasks are pool objects: preallocated once at startup
// on the worker that owns them (first-touch keeps the slabs node-local),
// recycled forever after. Allocation never blocks and never grows; an empty
// pool is a counted drop at the call site.
//
// A shared lock-free queue holds the cold objects; each worker keeps a small
// local cache in front of it so the steady-state alloc/free path is a plain
// Vec push/pop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

use crate::MP_CACHE;

struct PoolShared<T> {
    q: ArrayQueue<Box<T>>,
    capacity: usize,
    name: &'static str,
    node: usize,
    alloc_failures: AtomicU64,
}

/// Pool constructor handle. Cheap to clone; workers derive a `PoolHandle`
/// from it during their per-thread init.
pub struct MemoryPool<T> {
    shared: Arc<PoolShared<T>>,
}

impl<T> Clone for MemoryPool<T> {
    fn clone(&self) -> Self {
        MemoryPool { shared: self.shared.clone() }
    }
}

impl<T> MemoryPool<T> {
    /// Populate `capacity` objects. Run on the owning worker thread so the
    /// allocations touch node-local memory first.
    pub fn new(name: &'static str, node: usize, capacity: usize, mut factory: impl FnMut() -> T) -> Self {
        let q = ArrayQueue::new(capacity.max(1));
        for _ in 0..capacity {
            // Cannot fail: queue was sized to capacity.
            let _ = q.push(Box::new(factory()));
        }
        MemoryPool {
            shared: Arc::new(PoolShared {
                q,
                capacity,
                name,
                node,
                alloc_failures: AtomicU64::new(0),
            }),
        }
    }

    pub fn handle(&self) -> PoolHandle<T> {
        PoolHandle {
            shared: self.shared.clone(),
            cache: Vec::with_capacity(MP_CACHE),
        }
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    pub fn node(&self) -> usize {
        self.shared.node
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Objects currently parked in the shared queue. Only meaningful once
    /// workers have flushed their caches (shutdown accounting).
    pub fn occupancy(&self) -> usize {
        self.shared.q.len()
    }

    pub fn alloc_failures(&self) -> u64 {
        self.shared.alloc_failures.load(Ordering::Relaxed)
    }

    /// Return an object straight to the shared queue, bypassing any worker
    /// cache. The escape hatch for cross-worker frees when a handoff ring to
    /// the owner is full; the shared queue is safe from any thread.
    pub fn release(&self, obj: Box<T>) {
        let _ = self.shared.q.push(obj);
    }
}

/// Per-worker allocation front. Not Sync; lives on one worker thread.
pub struct PoolHandle<T> {
    shared: Arc<PoolShared<T>>,
    cache: Vec<Box<T>>,
}

impl<T> PoolHandle<T> {
    /// O(1) amortized; refills half a cache worth from the shared queue on
    /// a local miss. Returns None when the pool is exhausted.
    #[inline]
    pub fn alloc(&mut self) -> Option<Box<T>> {
        if let Some(obj) = self.cache.pop() {
            return Some(obj);
        }
        for _ in 0..MP_CACHE / 2 {
            match self.shared.q.pop() {
                Some(obj) => self.cache.push(obj),
                None => break,
            }
        }
        let got = self.cache.pop();
        if got.is_none() {
            self.shared.alloc_failures.fetch_add(1, Ordering::Relaxed);
        }
        got
    }

    #[inline]
    pub fn free(&mut self, obj: Box<T>) {
        self.cache.push(obj);
        if self.cache.len() > MP_CACHE {
            // Spill the cold half back to the shared queue.
            for _ in 0..MP_CACHE / 2 {
                match self.cache.pop() {
                    Some(o) => {
                        if self.shared.q.push(o).is_err() {
                            // Sized to capacity; can only fail if a foreign
                            // object was freed here. Dropping it is correct.
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    /// Return every cached object to the shared queue. Called on worker exit
    /// so shutdown accounting sees full pools.
    pub fn flush(&mut self) {
        while let Some(o) = self.cache.pop() {
            if self.shared.q.push(o).is_err() {
                break;
            }
        }
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

impl<T> Drop for PoolHandle<T> {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_round_trip() {
        let pool: MemoryPool<u64> = MemoryPool::new("t", 0, 16, || 0);
        let mut h = pool.handle();
        let mut held = Vec::new();
        for _ in 0..16 {
            held.push(h.alloc().expect("pool sized for 16"));
        }
        assert!(h.alloc().is_none());
        assert_eq!(pool.alloc_failures(), 1);
        for obj in held {
            h.free(obj);
        }
        h.flush();
        assert_eq!(pool.occupancy(), 16);
    }

    #[test]
    fn exhaustion_is_not_fatal() {
        let pool: MemoryPool<[u8; 64]> = MemoryPool::new("t2", 0, 4, || [0; 64]);
        let mut h = pool.handle();
        let a = h.alloc().unwrap();
        let b = h.alloc().unwrap();
        let _c = h.alloc().unwrap();
        let _d = h.alloc().unwrap();
        assert!(h.alloc().is_none());
        h.free(a);
        h.free(b);
        assert!(h.alloc().is_some());
    }

    #[test]
    fn two_handles_share_one_pool() {
        let pool: MemoryPool<u32> = MemoryPool::new("t3", 0, 8, || 7);
        let mut h1 = pool.handle();
        let mut h2 = pool.handle();
        let objs: Vec<_> = (0..8).map(|_| h1.alloc().unwrap()).collect();
        assert!(h2.alloc().is_none());
        for o in objs {
            h2.free(o);
        }
        h2.flush();
        assert!(h1.alloc().is_some());
    }
}
