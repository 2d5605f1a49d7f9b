// FLOWLINE — I/O WORKER
// Owns a disjoint set of NIC RX queues and the rings that feed/drain its
// paired computation worker: the RX handoff ring outbound, the TX rings
// (one per egress port) and the drop ring inbound. The first I/O worker on
// a node is the node master and additionally emits the once-per-second
// statistics aggregate.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::engine::clock::TscCal;
use crate::engine::pool::{MemoryPool, PoolHandle};
use crate::engine::ring::{Notifier, Ring, WorkerWake};
use crate::nic::NicDriver;
use crate::packet::batch::PacketBatch;
use crate::packet::Packet;
use crate::stats::{aggregate, Totals, WorkerStats};
use crate::topology;
use crate::worker::Halt;

const IDLE_PARK: Duration = Duration::from_micros(200);
const STATS_INTERVAL_NS: u64 = 1_000_000_000;
/// Bounded drain window after the terminate signal. Longer than the
/// computation worker's window: the I/O side drains last.
const DRAIN_WINDOW_NS: u64 = 1_000_000_000;

pub struct RxQueue {
    pub port: u16,
    pub queue: u16,
    pub pool: MemoryPool<Packet>,
}

pub struct IoWorkerCtx {
    pub id: usize,
    pub core: usize,
    pub node: usize,
    pub is_node_master: bool,
    pub nic: Arc<dyn NicDriver>,
    pub rxqs: Vec<RxQueue>,
    pub batch_pool: MemoryPool<PacketBatch>,
    pub rx_ring: Arc<Ring<Box<PacketBatch>>>,
    pub rx_notifier: Notifier,
    /// One TX ring per egress port, consumed here, produced by the paired
    /// computation worker.
    pub tx_rings: Vec<Arc<Ring<Box<Packet>>>>,
    pub tx_notifiers: Vec<Notifier>,
    pub drop_ring: Arc<Ring<Box<Packet>>>,
    pub drop_notifier: Notifier,
    pub wake: Arc<WorkerWake>,
    pub halt: Halt,
    /// Raised by the paired computation worker when it exits; until then the
    /// TX/drop rings may still receive traffic during the drain.
    pub comp_done: Arc<std::sync::atomic::AtomicBool>,
    pub stats: Arc<WorkerStats>,
    /// All workers' stats, for the node master's aggregate line.
    pub all_stats: Vec<Arc<WorkerStats>>,
    pub io_batch_size: usize,
    pub comp_batch_size: usize,
    pub clock: TscCal,
}

pub fn io_loop(ctx: IoWorkerCtx) {
    topology::pin_to_core(ctx.core);
    ctx.wake.register();
    info!(worker = ctx.id, core = ctx.core, node = ctx.node, master = ctx.is_node_master, "io worker up");

    let mut pkt_handles: Vec<PoolHandle<Packet>> = ctx.rxqs.iter().map(|q| q.pool.handle()).collect();
    let mut batch_handle = ctx.batch_pool.handle();

    let mut seen = ctx.wake.snapshot();
    let mut last_stats = ctx.clock.now_ns();
    let mut last_totals = Totals::default();
    let mut halt_seen_at: Option<u64> = None;
    let mut tx_scratch: Vec<Box<Packet>> = Vec::new();
    let mut batch_scratch: Vec<Box<PacketBatch>> = Vec::new();

    loop {
        let now = ctx.clock.now_ns();
        let halted = ctx.halt.is_set();
        if halted && halt_seen_at.is_none() {
            halt_seen_at = Some(now);
            debug!(worker = ctx.id, "io worker draining");
        }
        let mut work = 0usize;

        // RX: poll each owned queue for a burst and hand off batches.
        if !halted {
            for (qi, rxq) in ctx.rxqs.iter().enumerate() {
                work += rx_one_queue(&ctx, rxq, &mut pkt_handles[qi], &mut batch_handle, &mut batch_scratch, now);
            }
        }

        // TX: drain each egress ring and transmit.
        for (port, ring) in ctx.tx_rings.iter().enumerate() {
            tx_scratch.clear();
            let n = ring.dequeue_burst(&mut tx_scratch, ctx.io_batch_size.max(32));
            if n == 0 {
                continue;
            }
            work += n;
            let sent = ctx.nic.tx_burst(port, ctx.id, &tx_scratch);
            WorkerStats::bump(&ctx.stats.ports[port.min(crate::MAX_PORTS - 1)].sent_pkts, sent as u64);
            if sent < n {
                WorkerStats::bump(
                    &ctx.stats.ports[port.min(crate::MAX_PORTS - 1)].tx_drop_pkts,
                    (n - sent) as u64,
                );
            }
            for pkt in tx_scratch.drain(..) {
                release_packet(&ctx, &mut pkt_handles, pkt);
            }
        }

        // Drop ring: recycle killed packets.
        {
            tx_scratch.clear();
            let n = ctx.drop_ring.dequeue_burst(&mut tx_scratch, 4 * ctx.comp_batch_size);
            work += n;
            for pkt in tx_scratch.drain(..) {
                release_packet(&ctx, &mut pkt_handles, pkt);
            }
        }

        // Node master: periodic statistics aggregation.
        if ctx.is_node_master && now.saturating_sub(last_stats) >= STATS_INTERVAL_NS {
            let totals = aggregate(&ctx.all_stats);
            info!(
                node = ctx.node,
                rx_pps = totals.recv.saturating_sub(last_totals.recv),
                tx_pps = totals.sent.saturating_sub(last_totals.sent),
                drops = totals.sw_drop.saturating_sub(last_totals.sw_drop),
                offloaded = totals.offloaded.saturating_sub(last_totals.offloaded),
                "node stats"
            );
            last_totals = totals;
            last_stats = now;
        }

        if halted {
            let rings_empty =
                ctx.drop_ring.is_empty() && ctx.tx_rings.iter().all(|r| r.is_empty());
            let upstream_done = ctx.comp_done.load(std::sync::atomic::Ordering::Acquire);
            let window_over = halt_seen_at
                .map(|t| now.saturating_sub(t) > DRAIN_WINDOW_NS)
                .unwrap_or(false);
            if (rings_empty && upstream_done) || window_over {
                break;
            }
        }
        if work == 0 {
            // Clear the consumed notifiers, then recheck before parking so
            // a signal landing in between is never lost. The short park
            // doubles as the RX poll timer.
            for n in &ctx.tx_notifiers {
                n.clear();
            }
            ctx.drop_notifier.clear();
            let still_empty =
                ctx.drop_ring.is_empty() && ctx.tx_rings.iter().all(|r| r.is_empty());
            if still_empty {
                seen = ctx.wake.wait(seen, IDLE_PARK);
            }
        }
    }

    for h in &mut pkt_handles {
        h.flush();
    }
    batch_handle.flush();
    info!(worker = ctx.id, "io worker down");
}

fn rx_one_queue(
    ctx: &IoWorkerCtx,
    rxq: &RxQueue,
    pkts: &mut PoolHandle<Packet>,
    batches: &mut PoolHandle<PacketBatch>,
    batch_scratch: &mut Vec<Box<PacketBatch>>,
    now: u64,
) -> usize {
    let port_stats = &ctx.stats.ports[(rxq.port as usize).min(crate::MAX_PORTS - 1)];

    // Pull fresh packet buffers first; an empty pool is a counted RX drop.
    let mut slots: Vec<Box<Packet>> = Vec::with_capacity(ctx.io_batch_size);
    for _ in 0..ctx.io_batch_size {
        match pkts.alloc() {
            Some(mut p) => {
                p.reset(rxq.port, rxq.queue, now);
                slots.push(p);
            }
            None => break,
        }
    }
    if slots.is_empty() {
        // Packet pool dry; the NIC queue keeps the frames for the next poll
        // (or drops them in hardware, visible in its own counters).
        return 0;
    }

    let filled = ctx.nic.rx_burst(rxq.port as usize, rxq.queue as usize, &mut slots);
    for pkt in slots.drain(filled..) {
        pkts.free(pkt);
    }
    if filled == 0 {
        return 0;
    }
    WorkerStats::bump(&port_stats.recv_pkts, filled as u64);

    // Assemble handoff batches of COMP_BATCH_SIZE.
    batch_scratch.clear();
    let mut iter = slots.into_iter().peekable();
    while iter.peek().is_some() {
        let Some(mut batch) = batches.alloc() else {
            // Batch pool dry: the rest of the burst is an RX drop.
            let mut lost = 0u64;
            for pkt in iter.by_ref() {
                pkts.free(pkt);
                lost += 1;
            }
            WorkerStats::bump(&port_stats.rx_drop_pkts, lost);
            break;
        };
        for pkt in iter.by_ref().take(ctx.comp_batch_size) {
            batch.push(pkt);
        }
        batch_scratch.push(batch);
    }

    if batch_scratch.is_empty() {
        return filled;
    }
    let pushed = ctx.rx_ring.enqueue_burst(batch_scratch);
    if pushed.moved > 0 {
        ctx.rx_notifier.signal();
    }
    // Ring full: the leftover batches are RX drops.
    for mut batch in batch_scratch.drain(..) {
        let mut pkts_back = Vec::new();
        batch.drain_all(&mut pkts_back);
        WorkerStats::bump(&port_stats.rx_drop_pkts, pkts_back.len() as u64);
        for pkt in pkts_back {
            pkts.free(pkt);
        }
        batch.reset();
        batches.free(batch);
    }
    filled
}

fn release_packet(ctx: &IoWorkerCtx, handles: &mut [PoolHandle<Packet>], pkt: Box<Packet>) {
    let key = (pkt.source_port(), pkt.source_queue());
    match ctx.rxqs.iter().position(|q| (q.port, q.queue) == key) {
        Some(i) => handles[i].free(pkt),
        None => {
            // Packet from a queue this worker does not own (re-wired test
            // harness); push to whichever pool matches, else first.
            if let Some(q) = ctx.rxqs.first() {
                q.pool.release(pkt);
            }
        }
    }
}
