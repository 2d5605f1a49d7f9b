// FLOWLINE — HOST COMPUTE ENGINE
// CPU rendition of the device contract: contexts stage host buffers, "copy"
// them to device-side vectors, run a registered kernel function, and copy
// the output back. poll() advances one queued operation per call so the
// coprocessor worker observes the same incremental pipeline it would see on
// real hardware, including under-production and injected faults.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::queue::ArrayQueue;

use crate::offload::device::{
    ComputeContext, ComputeDevice, CtxState, DevBufId, KernelArg, KernelRef, ResourceParam,
};
use crate::{Error, Result};

/// Stable view of a persistent device buffer during one kernel run. Buffers
/// are append-only after offload init, so the raw slice cannot move.
#[derive(Clone, Copy)]
pub struct GlobalView {
    ptr: *const u8,
    len: usize,
}

unsafe impl Send for GlobalView {}

impl GlobalView {
    #[inline(always)]
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// Kernel I/O: by-value args, the device input region (arg blobs + item
/// data), the output region to fill, and the persistent buffers.
pub struct HostKernelIo<'a> {
    pub args: &'a [KernelArg],
    pub input: &'a [u8],
    pub output: &'a mut Vec<u8>,
    pub res: ResourceParam,
    pub globals: &'a [GlobalView],
}

pub type HostKernelFn = fn(&mut HostKernelIo<'_>) -> std::result::Result<(), &'static str>;

struct HostShared {
    kernels: Mutex<Vec<(String, HostKernelFn)>>,
    globals: Mutex<Vec<Box<[u8]>>>,
    fatal_fault: AtomicBool,
}

impl HostShared {
    fn snapshot_globals(&self) -> Vec<GlobalView> {
        self.globals
            .lock()
            .unwrap()
            .iter()
            .map(|b| GlobalView { ptr: b.as_ptr(), len: b.len() })
            .collect()
    }
}

// ============================================================================
// CONTEXT
// ============================================================================

enum Op {
    Memwrite { offset: usize, len: usize },
    Launch { kernel: KernelRef, res: ResourceParam },
    Memread { offset: usize, len: usize },
}

struct HostContext {
    state: CtxState,
    host_in: Vec<u8>,
    dev_in: Vec<u8>,
    dev_out: Vec<u8>,
    host_out: Vec<u8>,
    out_reserved: usize,
    args: Vec<KernelArg>,
    queued: std::collections::VecDeque<Op>,
    kernel_error: Option<&'static str>,
    shared: Arc<HostShared>,
}

impl HostContext {
    fn new(shared: Arc<HostShared>) -> Self {
        HostContext {
            state: CtxState::Ready,
            host_in: Vec::new(),
            dev_in: Vec::new(),
            dev_out: Vec::new(),
            host_out: Vec::new(),
            out_reserved: 0,
            args: Vec::new(),
            queued: std::collections::VecDeque::new(),
            kernel_error: None,
            shared,
        }
    }

    fn run_kernel(&mut self, kernel: KernelRef, res: ResourceParam) -> Result<()> {
        if self.shared.fatal_fault.load(Ordering::Acquire) {
            return Err(Error::DeviceFatal {
                device: "host".into(),
                reason: "injected fault".into(),
            });
        }
        let func = {
            let kernels = self.shared.kernels.lock().unwrap();
            match kernels.get(kernel.0 as usize) {
                Some((_, f)) => *f,
                None => {
                    self.kernel_error = Some("unknown kernel");
                    return Ok(());
                }
            }
        };
        let globals = self.shared.snapshot_globals();
        self.dev_out.clear();
        let mut io = HostKernelIo {
            args: &self.args,
            input: &self.dev_in,
            output: &mut self.dev_out,
            res,
            globals: &globals,
        };
        if let Err(e) = func(&mut io) {
            self.kernel_error = Some(e);
        }
        Ok(())
    }
}

impl ComputeContext for HostContext {
    fn state(&self) -> CtxState {
        self.state
    }

    fn begin(&mut self) -> Result<()> {
        if self.state != CtxState::Ready {
            return Err(Error::OffloadTransient("context not READY"));
        }
        self.host_in.clear();
        self.dev_in.clear();
        self.dev_out.clear();
        self.host_out.clear();
        self.out_reserved = 0;
        self.args.clear();
        self.queued.clear();
        self.kernel_error = None;
        self.state = CtxState::Preparing;
        Ok(())
    }

    fn host_input(&mut self) -> &mut Vec<u8> {
        &mut self.host_in
    }

    fn reserve_output(&mut self, bytes: usize) {
        self.out_reserved = bytes;
    }

    fn push_kernel_arg(&mut self, arg: KernelArg) {
        self.args.push(arg);
    }

    fn enqueue_memwrite(&mut self, offset: usize, len: usize) -> Result<()> {
        if self.state != CtxState::Preparing {
            return Err(Error::OffloadTransient("memwrite outside PREPARING"));
        }
        self.queued.push_back(Op::Memwrite { offset, len });
        Ok(())
    }

    fn enqueue_kernel_launch(&mut self, kernel: KernelRef, res: &ResourceParam) -> Result<()> {
        if self.state != CtxState::Preparing {
            return Err(Error::OffloadTransient("launch outside PREPARING"));
        }
        self.queued.push_back(Op::Launch { kernel, res: *res });
        self.state = CtxState::Running;
        Ok(())
    }

    fn enqueue_memread(&mut self, offset: usize, len: usize) -> Result<()> {
        self.queued.push_back(Op::Memread { offset, len });
        Ok(())
    }

    fn poll(&mut self) -> Result<CtxState> {
        if self.state != CtxState::Running {
            return Ok(self.state);
        }
        match self.queued.pop_front() {
            Some(Op::Memwrite { offset, len }) => {
                let end = (offset + len).min(self.host_in.len());
                if self.dev_in.len() < end {
                    self.dev_in.resize(end, 0);
                }
                if offset < end {
                    self.dev_in[offset..end].copy_from_slice(&self.host_in[offset..end]);
                }
            }
            Some(Op::Launch { kernel, res }) => {
                self.run_kernel(kernel, res)?;
            }
            Some(Op::Memread { offset, len }) => {
                // Copies clamp to what the kernel actually produced;
                // under-production is visible to the caller as a short
                // host_out.
                let end = (offset + len).min(self.dev_out.len());
                if offset < end {
                    if self.host_out.len() < end {
                        self.host_out.resize(end, 0);
                    }
                    self.host_out[offset..end].copy_from_slice(&self.dev_out[offset..end]);
                }
            }
            None => {}
        }
        if self.queued.is_empty() {
            self.state = CtxState::Finished;
        }
        Ok(self.state)
    }

    fn host_output(&self) -> &[u8] {
        if self.kernel_error.is_some() {
            &[]
        } else {
            &self.host_out
        }
    }

    fn reclaim(&mut self) {
        self.state = CtxState::Ready;
    }
}

// ============================================================================
// DEVICE
// ============================================================================

pub struct HostComputeDevice {
    shared: Arc<HostShared>,
    contexts: ArrayQueue<Box<dyn ComputeContext>>,
    context_count: usize,
}

impl HostComputeDevice {
    pub fn new(num_contexts: usize) -> Self {
        let shared = Arc::new(HostShared {
            kernels: Mutex::new(Vec::new()),
            globals: Mutex::new(Vec::new()),
            fatal_fault: AtomicBool::new(false),
        });
        let contexts = ArrayQueue::new(num_contexts.max(1));
        for _ in 0..num_contexts.max(1) {
            let ctx: Box<dyn ComputeContext> = Box::new(HostContext::new(shared.clone()));
            let _ = contexts.push(ctx);
        }
        HostComputeDevice { shared, contexts, context_count: num_contexts.max(1) }
    }

    /// Register a kernel function under a name. Offload-init time only.
    pub fn register_kernel(&self, name: &str, func: HostKernelFn) -> KernelRef {
        let mut kernels = self.shared.kernels.lock().unwrap();
        if let Some(pos) = kernels.iter().position(|(n, _)| n == name) {
            kernels[pos].1 = func;
            return KernelRef(pos as u32);
        }
        kernels.push((name.to_string(), func));
        KernelRef((kernels.len() - 1) as u32)
    }

    /// Test hook: make every subsequent launch fail fatally.
    pub fn inject_fatal_fault(&self, on: bool) {
        self.shared.fatal_fault.store(on, Ordering::Release);
    }

    pub fn kernels_registered(&self) -> usize {
        self.shared.kernels.lock().unwrap().len()
    }
}

impl ComputeDevice for HostComputeDevice {
    fn name(&self) -> &'static str {
        "host"
    }

    fn context_count(&self) -> usize {
        self.context_count
    }

    fn get_available_context(&self) -> Option<Box<dyn ComputeContext>> {
        self.contexts.pop()
    }

    fn release_context(&self, mut ctx: Box<dyn ComputeContext>) {
        if ctx.state() != CtxState::Ready {
            ctx.reclaim();
        }
        let _ = self.contexts.push(ctx);
    }

    fn resolve_kernel(&self, name: &str) -> Option<KernelRef> {
        let kernels = self.shared.kernels.lock().unwrap();
        kernels.iter().position(|(n, _)| n == name).map(|i| KernelRef(i as u32))
    }

    fn alloc_device_buffer(&self, size: usize) -> Result<DevBufId> {
        let mut globals = self.shared.globals.lock().unwrap();
        globals.push(vec![0u8; size].into_boxed_slice());
        Ok(DevBufId((globals.len() - 1) as u32))
    }

    fn write_device_buffer(&self, id: DevBufId, offset: usize, data: &[u8]) -> Result<()> {
        let mut globals = self.shared.globals.lock().unwrap();
        let buf = globals
            .get_mut(id.0 as usize)
            .ok_or(Error::OffloadTransient("bad device buffer id"))?;
        if offset + data.len() > buf.len() {
            return Err(Error::OffloadTransient("device buffer write out of range"));
        }
        buf[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doubling_kernel(io: &mut HostKernelIo<'_>) -> std::result::Result<(), &'static str> {
        io.output.extend(io.input.iter().map(|b| b.wrapping_mul(2)));
        Ok(())
    }

    fn failing_kernel(_io: &mut HostKernelIo<'_>) -> std::result::Result<(), &'static str> {
        Err("kernel exploded")
    }

    fn drive_to_finished(ctx: &mut Box<dyn ComputeContext>) {
        for _ in 0..16 {
            if ctx.poll().unwrap() == CtxState::Finished {
                return;
            }
        }
        panic!("context did not finish");
    }

    #[test]
    fn pipeline_copies_launches_and_reads_back() {
        let dev = HostComputeDevice::new(2);
        let k = dev.register_kernel("double", doubling_kernel);
        assert_eq!(dev.resolve_kernel("double"), Some(k));

        let mut ctx = dev.get_available_context().unwrap();
        ctx.begin().unwrap();
        ctx.host_input().extend_from_slice(&[1, 2, 3, 4]);
        ctx.reserve_output(4);
        ctx.enqueue_memwrite(0, 4).unwrap();
        ctx.enqueue_kernel_launch(k, &ResourceParam { num_items: 4, num_batches: 1, workgroup_size: 32 })
            .unwrap();
        ctx.enqueue_memread(0, 4).unwrap();
        assert_eq!(ctx.state(), CtxState::Running);
        drive_to_finished(&mut ctx);
        assert_eq!(ctx.host_output(), &[2, 4, 6, 8]);
        ctx.reclaim();
        dev.release_context(ctx);
    }

    #[test]
    fn context_pool_exhausts_and_refills() {
        let dev = HostComputeDevice::new(2);
        let a = dev.get_available_context().unwrap();
        let _b = dev.get_available_context().unwrap();
        assert!(dev.get_available_context().is_none());
        dev.release_context(a);
        assert!(dev.get_available_context().is_some());
    }

    #[test]
    fn kernel_item_error_yields_empty_output() {
        let dev = HostComputeDevice::new(1);
        let k = dev.register_kernel("boom", failing_kernel);
        let mut ctx = dev.get_available_context().unwrap();
        ctx.begin().unwrap();
        ctx.host_input().extend_from_slice(&[9; 8]);
        ctx.enqueue_memwrite(0, 8).unwrap();
        ctx.enqueue_kernel_launch(k, &ResourceParam::default()).unwrap();
        ctx.enqueue_memread(0, 8).unwrap();
        drive_to_finished(&mut ctx);
        assert!(ctx.host_output().is_empty());
    }

    #[test]
    fn fatal_fault_surfaces_from_poll() {
        let dev = HostComputeDevice::new(1);
        let k = dev.register_kernel("double", doubling_kernel);
        dev.inject_fatal_fault(true);
        let mut ctx = dev.get_available_context().unwrap();
        ctx.begin().unwrap();
        ctx.host_input().push(1);
        ctx.enqueue_memwrite(0, 1).unwrap();
        ctx.enqueue_kernel_launch(k, &ResourceParam::default()).unwrap();
        let mut saw_fatal = false;
        for _ in 0..4 {
            match ctx.poll() {
                Err(crate::Error::DeviceFatal { .. }) => {
                    saw_fatal = true;
                    break;
                }
                Ok(CtxState::Finished) => break,
                _ => {}
            }
        }
        assert!(saw_fatal);
    }

    #[test]
    fn persistent_buffers_visible_to_kernels() {
        fn table_kernel(io: &mut HostKernelIo<'_>) -> std::result::Result<(), &'static str> {
            let id = io.args[0].as_u64() as usize;
            let table = io.globals.get(id).ok_or("missing table")?;
            io.output.extend_from_slice(&table.bytes()[..4]);
            Ok(())
        }
        let dev = HostComputeDevice::new(1);
        let k = dev.register_kernel("table", table_kernel);
        let buf = dev.alloc_device_buffer(16).unwrap();
        dev.write_device_buffer(buf, 0, &[0xCA, 0xFE, 0xBA, 0xBE]).unwrap();

        let mut ctx = dev.get_available_context().unwrap();
        ctx.begin().unwrap();
        ctx.push_kernel_arg(KernelArg::from_dev_buf(buf));
        ctx.reserve_output(4);
        ctx.enqueue_kernel_launch(k, &ResourceParam::default()).unwrap();
        ctx.enqueue_memread(0, 4).unwrap();
        drive_to_finished(&mut ctx);
        assert_eq!(ctx.host_output(), &[0xCA, 0xFE, 0xBA, 0xBE]);
        ctx.reclaim();
        dev.release_context(ctx);
    }
}
