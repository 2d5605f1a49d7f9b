// FLOWLINE — NODE-LOCAL STORAGE
// Named byte regions scoped to one NUMA node. Elements use it to publish
// read-mostly state (key tables, lookup tables) built during the serialized
// init phases: alloc + write happen strictly before freeze(), reads happen
// strictly after. The supervisor's phase barriers enforce that ordering, so
// post-freeze readers take a raw region handle and never touch the lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::{Error, Result};

struct Region {
    buf: Box<[u8]>,
}

pub struct NodeLocalStorage {
    node: usize,
    regions: Mutex<HashMap<String, Region>>,
    frozen: AtomicBool,
}

/// Raw view of a frozen region. Valid for the lifetime of the storage,
/// which lives until process exit.
#[derive(Clone, Copy)]
pub struct NlsRegion {
    ptr: *const u8,
    len: usize,
}

unsafe impl Send for NlsRegion {}
unsafe impl Sync for NlsRegion {}

impl NlsRegion {
    #[inline(always)]
    pub fn bytes(&self) -> &[u8] {
        // Region buffers are append-only and never move; writes stopped at
        // freeze(). See module header for the phase argument.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reinterpret the region as a slice of Pod records.
    #[inline(always)]
    pub fn as_slice_of<T: bytemuck::Pod>(&self) -> &[T] {
        bytemuck::cast_slice(self.bytes())
    }
}

impl NodeLocalStorage {
    pub fn new(node: usize) -> Self {
        NodeLocalStorage {
            node,
            regions: Mutex::new(HashMap::new()),
            frozen: AtomicBool::new(false),
        }
    }

    pub fn node(&self) -> usize {
        self.node
    }

    /// Allocate a zeroed region. Allocating the same name twice is a bug in
    /// an element's per-node init.
    pub fn alloc(&self, name: &str, size: usize) -> Result<()> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(Error::ConfigInvalid(format!(
                "node-local alloc of {name:?} after freeze"
            )));
        }
        let mut map = self.regions.lock().unwrap();
        if map.contains_key(name) {
            return Err(Error::ConfigInvalid(format!(
                "node-local region {name:?} allocated twice on node {}",
                self.node
            )));
        }
        map.insert(name.to_string(), Region { buf: vec![0u8; size].into_boxed_slice() });
        Ok(())
    }

    /// Mutate a region during init. Serialized by the caller's phase barrier;
    /// the lock here only guards against map growth.
    pub fn write(&self, name: &str, f: impl FnOnce(&mut [u8])) -> Result<()> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(Error::ConfigInvalid(format!(
                "node-local write to {name:?} after freeze"
            )));
        }
        let mut map = self.regions.lock().unwrap();
        let region = map.get_mut(name).ok_or_else(|| {
            Error::ConfigInvalid(format!("node-local region {name:?} not allocated"))
        })?;
        f(&mut region.buf);
        Ok(())
    }

    /// No further alloc/write accepted; reads may now go through NlsRegion
    /// without the lock.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn get(&self, name: &str) -> Option<NlsRegion> {
        let map = self.regions.lock().unwrap();
        map.get(name).map(|r| NlsRegion { ptr: r.buf.as_ptr(), len: r.buf.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_write_freeze_read() {
        let nls = NodeLocalStorage::new(0);
        nls.alloc("keys", 8).unwrap();
        nls.write("keys", |b| b.copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8])).unwrap();
        nls.freeze();
        let r = nls.get("keys").unwrap();
        assert_eq!(r.bytes(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn double_alloc_rejected() {
        let nls = NodeLocalStorage::new(0);
        nls.alloc("x", 4).unwrap();
        assert!(nls.alloc("x", 4).is_err());
    }

    #[test]
    fn write_after_freeze_rejected() {
        let nls = NodeLocalStorage::new(1);
        nls.alloc("x", 4).unwrap();
        nls.freeze();
        assert!(nls.write("x", |_| {}).is_err());
        assert!(nls.alloc("y", 4).is_err());
    }

    #[test]
    fn typed_view() {
        let nls = NodeLocalStorage::new(0);
        nls.alloc("tbl", 16).unwrap();
        nls.write("tbl", |b| {
            b[..8].copy_from_slice(&42u64.to_ne_bytes());
            b[8..].copy_from_slice(&7u64.to_ne_bytes());
        })
        .unwrap();
        nls.freeze();
        let r = nls.get("tbl").unwrap();
        assert_eq!(r.as_slice_of::<u64>(), &[42, 7]);
    }
}
