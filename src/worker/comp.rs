// FLOWLINE — COMPUTATION WORKER
// Owns a private element graph and its executor. Wakes on the RX handoff
// ring or the task-completion ring, drains retries and scheduler batches
// first, then completions (they free offload depth), then up to PPDEPTH
// fresh batches. The init ladder runs here under the supervisor's barriers
// before the first packet moves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Barrier};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::{PipelineConfig, SystemParams};
use crate::element::{ElementContext, OffloadInitFn};
use crate::engine::nls::NodeLocalStorage;
use crate::engine::pool::MemoryPool;
use crate::engine::ring::{Notifier, Ring, WorkerWake};
use crate::graph::executor::{Executor, ExecutorSinks};
use crate::graph::ElementGraph;
use crate::offload::device::SharedDevice;
use crate::offload::task::OffloadTask;
use crate::packet::batch::PacketBatch;
use crate::stats::WorkerStats;
use crate::topology;
use crate::worker::Halt;
use crate::Result;

const IDLE_PARK: Duration = Duration::from_micros(200);
const DRAIN_WINDOW_NS: u64 = 500_000_000;

/// Offload-init handoff to the node's coprocessor worker: the closures to
/// run, and a channel for the verdict.
pub type OffloadInitRequest = (Vec<OffloadInitFn>, Sender<Result<()>>);

pub struct CompWorkerCtx {
    pub id: usize,
    pub core: usize,
    pub node: usize,
    /// First computation worker overall: runs global init.
    pub global_leader: bool,
    /// First computation worker on its node: runs per-node init, the
    /// offload-init handoff, and the freeze.
    pub node_leader: bool,
    pub pipeline: Arc<PipelineConfig>,
    pub params: SystemParams,
    pub preserve_latency: bool,
    pub num_tx_ports: usize,
    pub nls: Arc<NodeLocalStorage>,
    pub device: Option<SharedDevice>,
    pub rx_ring: Arc<Ring<Box<PacketBatch>>>,
    pub rx_notifier: Notifier,
    pub completion_ring: Arc<Ring<Box<OffloadTask>>>,
    pub completion_notifier: Notifier,
    /// Taken once when the executor is built.
    pub sinks: Option<ExecutorSinks>,
    pub batch_pool: MemoryPool<PacketBatch>,
    pub task_pool: MemoryPool<OffloadTask>,
    pub wake: Arc<WorkerWake>,
    pub halt: Halt,
    pub stats: Arc<WorkerStats>,
    pub init_barrier: Arc<Barrier>,
    pub init_failed: Arc<AtomicBool>,
    pub offload_init_tx: Option<Sender<OffloadInitRequest>>,
    pub ready_tx: Sender<bool>,
    /// Raised on exit so the paired I/O worker knows no more TX/drop
    /// traffic can arrive.
    pub done: Arc<AtomicBool>,
    pub clock: crate::engine::clock::TscCal,
}

pub fn comp_loop(mut ctx: CompWorkerCtx) {
    topology::pin_to_core(ctx.core);
    ctx.wake.register();

    let executor = match init_ladder(&mut ctx) {
        Some(exec) => exec,
        None => {
            ctx.done.store(true, Ordering::Release);
            let _ = ctx.ready_tx.send(false);
            return;
        }
    };
    let _ = ctx.ready_tx.send(true);
    info!(worker = ctx.id, core = ctx.core, node = ctx.node, "comp worker up");
    run_loop(&ctx, executor);
    ctx.done.store(true, Ordering::Release);
    info!(worker = ctx.id, "comp worker down");
}

/// The serialized init phases. Every thread hits every barrier exactly once
/// whether or not its own step failed, so a failure never deadlocks the
/// ladder — it just propagates through `init_failed`.
fn init_ladder(ctx: &mut CompWorkerCtx) -> Option<Executor> {
    let ectx = ElementContext {
        node: ctx.node,
        comp_batch_size: ctx.params.comp_batch_size,
        num_tx_ports: ctx.num_tx_ports,
    };
    let fail = |e: crate::Error| {
        error!(worker = ctx.id, error = %e, "graph init failed");
        ctx.init_failed.store(true, Ordering::Release);
    };

    let mut graph = match ElementGraph::build(&ctx.pipeline, &ectx) {
        Ok(g) => Some(g),
        Err(e) => {
            fail(e);
            None
        }
    };
    ctx.init_barrier.wait();

    // Global init: once per element class, on the global leader.
    if !ctx.init_failed.load(Ordering::Acquire) && ctx.global_leader {
        if let Some(g) = graph.as_mut() {
            if let Err(e) = g.init_global() {
                fail(e);
            }
        }
    }
    ctx.init_barrier.wait();

    // Per-node init.
    if !ctx.init_failed.load(Ordering::Acquire) && ctx.node_leader {
        if let Some(g) = graph.as_mut() {
            if let Err(e) = g.init_per_node(&ctx.nls) {
                fail(e);
            }
        }
    }
    ctx.init_barrier.wait();

    // Offload init on the owning coprocessor worker.
    if !ctx.init_failed.load(Ordering::Acquire) && ctx.node_leader {
        if let (Some(tx), Some(g)) = (&ctx.offload_init_tx, graph.as_ref()) {
            let fns = g.offload_init_fns();
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            if tx.send((fns, done_tx)).is_ok() {
                match done_rx.recv() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => fail(e),
                    Err(_) => fail(crate::Error::DeviceFatal {
                        device: "coproc".into(),
                        reason: "offload init channel closed".into(),
                    }),
                }
            } else {
                fail(crate::Error::DeviceFatal {
                    device: "coproc".into(),
                    reason: "coprocessor worker gone before offload init".into(),
                });
            }
        }
    }
    ctx.init_barrier.wait();

    // Per-thread init, then device binding.
    if !ctx.init_failed.load(Ordering::Acquire) {
        if let Some(g) = graph.as_mut() {
            let r = g.init_per_thread(&ctx.nls).and_then(|_| match &ctx.device {
                Some(dev) => g.bind_offload_devices(dev.as_ref(), &ctx.nls),
                None => Ok(()),
            });
            if let Err(e) = r {
                fail(e);
            }
        }
    }
    ctx.init_barrier.wait();

    // Freeze node-local storage; reads are lock-free from here on.
    if ctx.node_leader {
        ctx.nls.freeze();
    }
    ctx.init_barrier.wait();

    if ctx.init_failed.load(Ordering::Acquire) {
        return None;
    }
    let graph = graph?;
    Some(Executor::new(
        graph,
        ctx.id as u32,
        ctx.device.as_ref().map(|d| d.name().to_string()),
        ctx.params.coproc_ppdepth as u32,
        ctx.preserve_latency,
        ctx.batch_pool.handle(),
        ctx.task_pool.handle(),
        ctx.sinks.take().expect("sinks taken once"),
        ctx.stats.clone(),
    ))
}

fn run_loop(ctx: &CompWorkerCtx, mut exec: Executor) {
    let mut seen = ctx.wake.snapshot();
    let mut halt_seen_at: Option<u64> = None;
    let mut completions: Vec<Box<OffloadTask>> = Vec::new();
    let mut batches: Vec<Box<PacketBatch>> = Vec::new();

    loop {
        let now = ctx.clock.now_ns();
        let halted = ctx.halt.is_set();
        if halted && halt_seen_at.is_none() {
            halt_seen_at = Some(now);
            debug!(worker = ctx.id, "comp worker draining");
        }
        let mut work = 0usize;

        exec.drain_retries();
        exec.drain_scheduled();

        // Completions first: they free offload depth for new submissions.
        completions.clear();
        work += ctx.completion_ring.dequeue_burst(&mut completions, ctx.params.coproc_ppdepth.max(8));
        for task in completions.drain(..) {
            exec.on_completion(task);
        }

        // Fresh RX work, up to PPDEPTH batches per wakeup. Draining
        // continues through shutdown: in-flight batches retire before exit.
        batches.clear();
        work += ctx.rx_ring.dequeue_burst(&mut batches, ctx.params.coproc_ppdepth.max(1));
        for batch in batches.drain(..) {
            exec.run_batch(batch);
        }

        if halted {
            let drained = exec.outstanding() == 0
                && ctx.rx_ring.is_empty()
                && ctx.completion_ring.is_empty();
            let window_over = halt_seen_at
                .map(|t| now.saturating_sub(t) > DRAIN_WINDOW_NS)
                .unwrap_or(false);
            if drained || window_over {
                break;
            }
        }
        if work == 0 {
            ctx.rx_notifier.clear();
            ctx.completion_notifier.clear();
            if ctx.rx_ring.is_empty() && ctx.completion_ring.is_empty() {
                seen = ctx.wake.wait(seen, IDLE_PARK);
            }
        }
    }

    // Abandon whatever the drain window could not finish; pools flush on
    // executor drop.
    if exec.outstanding() > 0 {
        debug!(worker = ctx.id, outstanding = exec.outstanding(), "drain window expired");
    }
}
