// FLOWLINE — COMPUTE DEVICE / CONTEXT CONTRACTS
// The accelerator seam. A device owns K contexts; each context is a single
// in-flight pipeline with the state machine READY → PREPARING → RUNNING →
// FINISHED → READY. Copies and the launch are queued together and progress
// without the caller; completion is observed by polling from the coprocessor
// worker's loop.
//
// Kernel and device-buffer references are resolved once at offload init
// (device name → handler data); at runtime dispatch is plain indices, never
// a string lookup.

use std::sync::Arc;

use crate::Result;

/// Persistent device-resident buffer (key tables and the like), allocated at
/// offload init and never freed before shutdown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DevBufId(pub u32);

/// Kernel resolved by name at init.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelRef(pub u32);

/// Small by-value kernel argument (device buffer ids, counts). Mirrors the
/// original's push_kernel_arg contract: a few machine words per argument.
#[derive(Clone, Copy, Debug)]
pub struct KernelArg {
    pub bytes: [u8; 16],
    pub len: u8,
}

impl KernelArg {
    pub fn from_u64(v: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&v.to_le_bytes());
        KernelArg { bytes, len: 8 }
    }

    pub fn as_u64(&self) -> u64 {
        u64::from_le_bytes(self.bytes[..8].try_into().unwrap())
    }

    pub fn from_dev_buf(id: DevBufId) -> Self {
        Self::from_u64(id.0 as u64)
    }
}

/// Kernel launch geometry, chosen from the element's desired workgroup size.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResourceParam {
    pub num_items: u32,
    pub num_batches: u32,
    pub workgroup_size: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CtxState {
    Ready,
    Preparing,
    Running,
    Finished,
}

/// One in-flight offload pipeline. Owned by the coprocessor worker between
/// `get_available_context` and `release_context`; not shared.
pub trait ComputeContext: Send {
    fn state(&self) -> CtxState;

    /// READY → PREPARING. Clears staging and argument state.
    fn begin(&mut self) -> Result<()>;

    /// Host-side input staging region, valid in PREPARING.
    fn host_input(&mut self) -> &mut Vec<u8>;

    /// Reserve the device output region for this run.
    fn reserve_output(&mut self, bytes: usize);

    fn push_kernel_arg(&mut self, arg: KernelArg);

    /// Queue the host→device copy of [offset, offset+len) of the input.
    fn enqueue_memwrite(&mut self, offset: usize, len: usize) -> Result<()>;

    /// PREPARING → RUNNING. Returns immediately; the kernel and any queued
    /// copies progress independently.
    fn enqueue_kernel_launch(&mut self, kernel: KernelRef, res: &ResourceParam) -> Result<()>;

    /// Queue the device→host copy of [offset, offset+len) of the output.
    fn enqueue_memread(&mut self, offset: usize, len: usize) -> Result<()>;

    /// Advance and report the pipeline state. RUNNING → FINISHED when the
    /// queued work has drained.
    fn poll(&mut self) -> Result<CtxState>;

    /// Host copy of the device output, valid in FINISHED.
    fn host_output(&self) -> &[u8];

    /// FINISHED → READY.
    fn reclaim(&mut self);
}

/// A compute device and its context pool. Shared (Arc) between the
/// coprocessor worker that drives it and init-time callers.
pub trait ComputeDevice: Send + Sync {
    fn name(&self) -> &'static str;

    fn context_count(&self) -> usize;

    /// Non-blocking. None when all K contexts are in flight.
    fn get_available_context(&self) -> Option<Box<dyn ComputeContext>>;

    fn release_context(&self, ctx: Box<dyn ComputeContext>);

    fn resolve_kernel(&self, name: &str) -> Option<KernelRef>;

    /// Allocate a persistent device buffer (offload init only).
    fn alloc_device_buffer(&self, size: usize) -> Result<DevBufId>;

    /// Host→device write into a persistent buffer (offload init only).
    fn write_device_buffer(&self, id: DevBufId, offset: usize, data: &[u8]) -> Result<()>;
}

pub type SharedDevice = Arc<dyn ComputeDevice>;
