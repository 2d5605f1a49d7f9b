// FLOWLINE — COPROCESSOR WORKER
// One per device per node. Before traffic it executes the offload-init
// closures the node's computation leader hands over. In steady state it
// consumes the task input ring, stages each task onto an available compute
// context (copy in → launch → copy out, queued together), polls the
// in-flight pipelines, and returns finished tasks on the originating
// worker's completion ring with a status byte.
//
// A fatal device error fails every pending task back to its owner, marks
// the device down, and triggers supervisor shutdown — there is no fallback
// device in this configuration.

use std::collections::VecDeque;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::engine::nls::NodeLocalStorage;
use crate::engine::ring::{Notifier, Ring, WorkerWake};
use crate::offload::device::{ComputeContext, CtxState, SharedDevice};
use crate::offload::task::{OffloadTask, TaskStatus};
use crate::stats::WorkerStats;
use crate::topology;
use crate::worker::comp::OffloadInitRequest;
use crate::worker::Halt;
use crate::{Error, Result};

const IDLE_PARK: Duration = Duration::from_micros(200);
const DRAIN_WINDOW: Duration = Duration::from_millis(500);

pub struct CoprocWorkerCtx {
    pub id: usize,
    pub core: usize,
    pub node: usize,
    pub device: SharedDevice,
    pub nls: Arc<NodeLocalStorage>,
    pub task_ring: Arc<Ring<Box<OffloadTask>>>,
    pub task_notifier: Notifier,
    /// Completion ring + notifier per computation worker, indexed by the
    /// task's `comp_worker`.
    pub completion_rings: Vec<(Arc<Ring<Box<OffloadTask>>>, Notifier)>,
    pub wake: Arc<WorkerWake>,
    pub halt: Halt,
    pub stats: Arc<WorkerStats>,
    pub init_rx: Receiver<OffloadInitRequest>,
}

pub fn coproc_loop(ctx: CoprocWorkerCtx) {
    topology::pin_to_core(ctx.core);
    ctx.wake.register();
    info!(worker = ctx.id, core = ctx.core, node = ctx.node, device = ctx.device.name(), "coproc worker up");

    if !run_offload_init(&ctx) {
        return;
    }
    run_loop(&ctx);
    info!(worker = ctx.id, "coproc worker down");
}

/// Execute the offload-init closures for this (device, node) pair. Returns
/// false when the supervisor tore the system down before init arrived.
fn run_offload_init(ctx: &CoprocWorkerCtx) -> bool {
    loop {
        match ctx.init_rx.recv_timeout(Duration::from_millis(50)) {
            Ok((fns, done_tx)) => {
                let mut result: Result<()> = Ok(());
                for f in fns {
                    if let Err(e) = f(ctx.device.as_ref(), &ctx.nls) {
                        error!(error = %e, "offload init failed");
                        result = Err(e);
                        break;
                    }
                }
                let failed = result.is_err();
                let _ = done_tx.send(result);
                return !failed;
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                if ctx.halt.is_set() {
                    return false;
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                // No computation leader will ever ask; nothing to init.
                return true;
            }
        }
    }
}

struct InFlight {
    cctx: Box<dyn ComputeContext>,
    task: Box<OffloadTask>,
}

fn run_loop(ctx: &CoprocWorkerCtx) {
    let mut inflight: VecDeque<InFlight> = VecDeque::new();
    let mut stash: VecDeque<Box<OffloadTask>> = VecDeque::new();
    let mut seen = ctx.wake.snapshot();
    let mut device_down = false;
    let mut halt_deadline: Option<std::time::Instant> = None;

    loop {
        let halted = ctx.halt.is_set();
        if halted && halt_deadline.is_none() {
            halt_deadline = Some(std::time::Instant::now() + DRAIN_WINDOW);
            debug!(worker = ctx.id, "coproc worker draining");
        }
        let mut work = 0usize;

        // Poll in-flight pipelines; completions may land in any order.
        let mut i = 0;
        while i < inflight.len() {
            let state = inflight[i].cctx.poll();
            match state {
                Ok(CtxState::Finished) => {
                    let InFlight { mut cctx, mut task } = inflight.remove(i).expect("index valid");
                    finish(&mut *cctx, &mut task);
                    cctx.reclaim();
                    ctx.device.release_context(cctx);
                    stash.push_back(task);
                    work += 1;
                }
                Ok(_) => i += 1,
                Err(e) => {
                    error!(device = ctx.device.name(), error = %e, "fatal device error");
                    let InFlight { mut cctx, mut task } = inflight.remove(i).expect("index valid");
                    task.status = TaskStatus::DeviceError;
                    cctx.reclaim();
                    ctx.device.release_context(cctx);
                    stash.push_back(task);
                    device_down = true;
                    work += 1;
                }
            }
        }

        if device_down {
            // Kill everything pending for this device, then bring the
            // process down: no fallback device exists.
            for mut fl in inflight.drain(..) {
                fl.task.status = TaskStatus::DeviceError;
                fl.cctx.reclaim();
                ctx.device.release_context(fl.cctx);
                stash.push_back(fl.task);
            }
            while let Some(mut task) = ctx.task_ring.dequeue() {
                task.status = TaskStatus::DeviceError;
                stash.push_back(task);
            }
            flush_stash(ctx, &mut stash);
            error!(device = ctx.device.name(), "device marked down, triggering shutdown");
            ctx.halt.trigger();
            break;
        }

        // Admit new tasks while contexts are free.
        loop {
            let Some(cctx) = ctx.device.get_available_context() else { break };
            match ctx.task_ring.dequeue() {
                Some(task) => {
                    work += 1;
                    match launch(cctx, task) {
                        Ok(fl) => inflight.push_back(fl),
                        Err((cctx, mut task, e)) => {
                            error!(error = %e, "task launch failed");
                            task.status = TaskStatus::DeviceError;
                            ctx.device.release_context(cctx);
                            stash.push_back(task);
                            WorkerStats::bump(&ctx.stats.offload_task_failures, 1);
                        }
                    }
                }
                None => {
                    ctx.device.release_context(cctx);
                    break;
                }
            }
        }

        work += flush_stash(ctx, &mut stash);

        if halted {
            let drained = inflight.is_empty() && stash.is_empty() && ctx.task_ring.is_empty();
            let expired = halt_deadline.map(|d| std::time::Instant::now() > d).unwrap_or(false);
            if drained || expired {
                if !drained {
                    // Window expired: fail the leftovers home so batches
                    // still retire on the computation side.
                    for mut fl in inflight.drain(..) {
                        fl.task.status = TaskStatus::DeviceError;
                        fl.cctx.reclaim();
                        ctx.device.release_context(fl.cctx);
                        stash.push_back(fl.task);
                    }
                    while let Some(mut task) = ctx.task_ring.dequeue() {
                        task.status = TaskStatus::DeviceError;
                        stash.push_back(task);
                    }
                    flush_stash(ctx, &mut stash);
                }
                break;
            }
        }
        if work == 0 {
            ctx.task_notifier.clear();
            if ctx.task_ring.is_empty() && inflight.is_empty() && stash.is_empty() {
                seen = ctx.wake.wait(seen, IDLE_PARK);
            }
        }
    }
}

/// Stage one task onto a context: host input moves in, the copy/launch/copy
/// pipeline is queued in one go.
fn launch(
    mut cctx: Box<dyn ComputeContext>,
    mut task: Box<OffloadTask>,
) -> std::result::Result<InFlight, (Box<dyn ComputeContext>, Box<OffloadTask>, Error)> {
    let staged = (|| -> Result<()> {
        cctx.begin()?;
        std::mem::swap(cctx.host_input(), &mut task.input);
        let len = cctx.host_input().len();
        cctx.reserve_output(task.output_expected);
        for arg in &task.args {
            cctx.push_kernel_arg(*arg);
        }
        cctx.enqueue_memwrite(0, len)?;
        cctx.enqueue_kernel_launch(task.kernel, &task.res)?;
        cctx.enqueue_memread(0, task.output_expected)?;
        Ok(())
    })();
    match staged {
        Ok(()) => Ok(InFlight { cctx, task }),
        Err(e) => Err((cctx, task, e)),
    }
}

fn finish(cctx: &mut dyn ComputeContext, task: &mut Box<OffloadTask>) {
    let out = cctx.host_output();
    task.output.clear();
    task.output.extend_from_slice(out);
    // An empty output against a non-empty expectation is the device's way
    // of reporting a failed run.
    task.status = if task.output_expected > 0 && task.output.is_empty() {
        TaskStatus::DeviceError
    } else {
        TaskStatus::Ok
    };
}

/// Push finished tasks home; a full completion ring keeps them stashed.
fn flush_stash(ctx: &CoprocWorkerCtx, stash: &mut VecDeque<Box<OffloadTask>>) -> usize {
    let mut moved = 0;
    for _ in 0..stash.len() {
        let Some(task) = stash.pop_front() else { break };
        let wid = task.comp_worker as usize;
        let Some((ring, notifier)) = ctx.completion_rings.get(wid) else {
            debug_assert!(false, "task with unknown comp worker");
            continue;
        };
        match ring.enqueue(task) {
            Ok(_) => {
                notifier.signal();
                moved += 1;
            }
            Err(task) => {
                stash.push_front(task);
                break;
            }
        }
    }
    moved
}
