// FLOWLINE — GRAPH EXECUTOR
// The per-worker dataflow interpreter. Batches pop off a small work stack;
// each vertex processes its entire batch before anything moves downstream,
// scattering survivors into per-output-port sub-batches. Offloadable
// vertices capture the whole live batch into a task and hand it to the
// coprocessor ring; completions re-enter here and resume routing from the
// element's output ports.
//
// Nothing in this file blocks. Exhaustion (batch pool, task pool, any ring)
// is a counted drop or a bounded requeue on the retry deque, drained at the
// next wakeup.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tracing::debug;

use crate::element::Action;
use crate::engine::clock::prefetch_read_l1;
use crate::engine::pool::{MemoryPool, PoolHandle};
use crate::engine::ring::{Notifier, Ring};
use crate::graph::ElementGraph;
use crate::offload::datablock::Roi;
use crate::offload::task::{self, OffloadTask, TaskStatus};
use crate::packet::batch::PacketBatch;
use crate::packet::{Anno, Packet};
use crate::stats::WorkerStats;

/// Bounded requeues before an offload batch is dropped.
const MAX_OFFLOAD_RETRIES: u8 = 8;

pub struct TxSink {
    pub ring: Arc<Ring<Box<Packet>>>,
    pub notifier: Notifier,
}

/// Where the executor's packets leave the worker.
pub struct ExecutorSinks {
    /// One TX ring per egress port, into the paired I/O worker.
    pub tx: Vec<TxSink>,
    pub drop_ring: Arc<Ring<Box<Packet>>>,
    pub drop_notifier: Notifier,
    /// Task input ring into the node's coprocessor worker, if one exists.
    pub task_ring: Option<Arc<Ring<Box<OffloadTask>>>>,
    pub task_notifier: Option<Notifier>,
    /// Per-(port, queue) packet pools, for the overflow path when a ring to
    /// the I/O worker is full: packets go straight back to their pool.
    pub packet_pools: Vec<MemoryPool<Packet>>,
    pub num_rxq_per_port: usize,
}

impl ExecutorSinks {
    fn pool_for(&self, pkt: &Packet) -> Option<&MemoryPool<Packet>> {
        let idx = pkt.source_port() as usize * self.num_rxq_per_port + pkt.source_queue() as usize;
        self.packet_pools.get(idx)
    }
}

pub struct Executor {
    pub graph: ElementGraph,
    worker_id: u32,
    device_name: Option<String>,
    ppdepth: u32,
    preserve_latency: bool,
    batch_pool: PoolHandle<PacketBatch>,
    task_pool: PoolHandle<OffloadTask>,
    sinks: ExecutorSinks,
    stats: Arc<WorkerStats>,

    // Per-vertex offload bookkeeping.
    inflight: Vec<u32>,
    submit_seq: Vec<u64>,
    next_complete: Vec<u64>,
    reorder: Vec<BTreeMap<u64, Box<OffloadTask>>>,

    /// Batches that hit pool/ring exhaustion on the offload path.
    retry: VecDeque<(usize, usize, Box<PacketBatch>)>,
    /// Batches parked in scheduler-capable vertices, reinjected next round.
    scheduled: VecDeque<(usize, Box<PacketBatch>)>,
    stack: Vec<(usize, usize, Box<PacketBatch>)>,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: ElementGraph,
        worker_id: u32,
        device_name: Option<String>,
        ppdepth: u32,
        preserve_latency: bool,
        batch_pool: PoolHandle<PacketBatch>,
        task_pool: PoolHandle<OffloadTask>,
        sinks: ExecutorSinks,
        stats: Arc<WorkerStats>,
    ) -> Self {
        let n = graph.len();
        Executor {
            graph,
            worker_id,
            device_name,
            ppdepth,
            preserve_latency,
            batch_pool,
            task_pool,
            sinks,
            stats,
            inflight: vec![0; n],
            submit_seq: vec![0; n],
            next_complete: vec![0; n],
            reorder: (0..n).map(|_| BTreeMap::new()).collect(),
            retry: VecDeque::new(),
            scheduled: VecDeque::new(),
            stack: Vec::with_capacity(16),
        }
    }

    /// Work still owned by this executor (shutdown drain accounting).
    pub fn outstanding(&self) -> usize {
        self.retry.len()
            + self.scheduled.len()
            + self.inflight.iter().map(|&n| n as usize).sum::<usize>()
            + self.reorder.iter().map(|m| m.len()).sum::<usize>()
    }

    pub fn retry_len(&self) -> usize {
        self.retry.len()
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Route one freshly assembled batch from its source port's root.
    pub fn run_batch(&mut self, batch: Box<PacketBatch>) {
        let source_port = batch
            .live_indices()
            .next()
            .and_then(|i| batch.pkt(i).map(|p| p.source_port()))
            .unwrap_or(0);
        match self.graph.root_for(source_port) {
            Some(root) => {
                self.stack.push((root, 0, batch));
                self.run_stack();
            }
            None => {
                // No pipeline consumes this port; counted, not fatal.
                WorkerStats::bump(&self.stats.comp_drops, batch.live_count() as u64);
                self.kill_and_retire(batch);
            }
        }
    }

    /// Re-attempt batches that hit transient exhaustion. Called at the top
    /// of every wakeup, before new RX work.
    pub fn drain_retries(&mut self) {
        for _ in 0..self.retry.len() {
            match self.retry.pop_front() {
                Some((v, in_port, batch)) => {
                    self.stack.push((v, in_port, batch));
                    self.run_stack();
                }
                None => break,
            }
        }
    }

    /// Reinject batches parked in scheduler elements.
    pub fn drain_scheduled(&mut self) {
        for _ in 0..self.scheduled.len() {
            match self.scheduled.pop_front() {
                Some((v, batch)) => match self.graph.downstream(v, 0) {
                    Some((dst, dst_port)) => {
                        self.stack.push((dst, dst_port, batch));
                        self.run_stack();
                    }
                    None => {
                        WorkerStats::bump(&self.stats.comp_drops, batch.live_count() as u64);
                        self.kill_and_retire(batch);
                    }
                },
                None => break,
            }
        }
    }

    /// Handle one completed task off the completion ring.
    pub fn on_completion(&mut self, task: Box<OffloadTask>) {
        let v = task.element as usize;
        self.inflight[v] = self.inflight[v].saturating_sub(1);
        WorkerStats::bump(&self.stats.offload_completions, 1);

        if !self.preserve_latency {
            self.finish_task(task);
            return;
        }
        if task.seq != self.next_complete[v] {
            self.reorder[v].insert(task.seq, task);
            return;
        }
        self.finish_task(task);
        self.next_complete[v] += 1;
        while let Some(t) = self.reorder[v].remove(&self.next_complete[v]) {
            self.finish_task(t);
            self.next_complete[v] += 1;
        }
    }

    // ------------------------------------------------------------------
    // Stack machine
    // ------------------------------------------------------------------

    fn run_stack(&mut self) {
        while let Some((v, in_port, batch)) = self.stack.pop() {
            if batch.live_count() == 0 {
                // A batch of zero live packets is silently dropped.
                self.retire_batch(batch);
                continue;
            }
            if self.graph.vertices[v].schedulable {
                let mut batch = batch;
                batch.set_last_element(v as u32);
                self.scheduled.push_back((v, batch));
                continue;
            }
            self.process_vertex(v, in_port, batch);
        }
    }

    fn process_vertex(&mut self, v: usize, in_port: usize, mut batch: Box<PacketBatch>) {
        batch.set_last_element(v as u32);
        let out_ports = self.graph.vertices[v].elem.port_count().1;
        let mut groups: Vec<Vec<usize>> = vec![Vec::new(); out_ports.max(1)];
        let mut slowpath = 0u64;
        let mut pending = false;

        let live: Vec<usize> = batch.live_indices().collect();
        for (pos, &idx) in live.iter().enumerate() {
            // Warm the packet four slots ahead while this one processes.
            if let Some(ahead) = live.get(pos + 4).and_then(|&n| batch.pkt(n)) {
                unsafe { prefetch_read_l1(ahead.data().as_ptr()) };
            }
            let pkt = batch.pkt_mut(idx).expect("live slot holds packet");
            match self.graph.vertices[v].elem.process(in_port, pkt) {
                Action::Continue(p) => {
                    let p = p as usize;
                    if p < out_ports {
                        groups[p].push(idx);
                    } else {
                        debug_assert!(false, "element pushed beyond declared out-arity");
                        pkt.kill();
                    }
                }
                Action::Drop => pkt.kill(),
                Action::SlowPath => {
                    slowpath += 1;
                    pkt.kill();
                }
                Action::Pending => {
                    // Uniform per batch: the first packet decides.
                    pending = true;
                    break;
                }
            }
        }
        if slowpath > 0 {
            WorkerStats::bump(&self.stats.comp_slowpath, slowpath);
        }
        if pending {
            self.try_offload(v, in_port, batch);
            return;
        }

        self.flush_killed(&mut batch);
        if batch.live_count() == 0 {
            self.retire_batch(batch);
            return;
        }
        if self.graph.vertices[v].is_tx_sink {
            self.push_tx(batch);
            return;
        }
        self.route_groups(v, batch, groups);
    }

    /// Scatter surviving packets into per-port sub-batches and push the
    /// downstream work. The last used port reuses the parent's storage; the
    /// others pull fresh batches from the pool.
    fn route_groups(&mut self, v: usize, mut batch: Box<PacketBatch>, groups: Vec<Vec<usize>>) {
        let used: Vec<usize> = (0..groups.len()).filter(|&p| !groups[p].is_empty()).collect();
        if used.is_empty() {
            self.retire_batch(batch);
            return;
        }
        for &p in &used[..used.len() - 1] {
            let (dst, dst_port) = self.graph.downstream(v, p).expect("validated at build");
            match self.batch_pool.alloc() {
                Some(mut nb) => {
                    for &idx in &groups[p] {
                        nb.push(batch.take(idx).expect("grouped slot live"));
                    }
                    self.stack.push((dst, dst_port, nb));
                }
                None => {
                    // Processing already happened; re-running it on a retry
                    // would double-apply. Counted drop.
                    WorkerStats::bump(&self.stats.comp_exhausted, groups[p].len() as u64);
                    let mut dead = Vec::with_capacity(groups[p].len());
                    for &idx in &groups[p] {
                        let mut pkt = batch.take(idx).expect("grouped slot live");
                        pkt.kill();
                        dead.push(pkt);
                    }
                    self.push_drops(dead);
                }
            }
        }
        let p = *used.last().expect("non-empty");
        let (dst, dst_port) = self.graph.downstream(v, p).expect("validated at build");
        batch.compact();
        self.stack.push((dst, dst_port, batch));
    }

    /// Move the batch's survivors onto the paired I/O worker's TX rings,
    /// keyed by the egress-port annotation.
    fn push_tx(&mut self, mut batch: Box<PacketBatch>) {
        let mut per_port: Vec<Vec<Box<Packet>>> = (0..self.sinks.tx.len()).map(|_| Vec::new()).collect();
        let live: Vec<usize> = batch.live_indices().collect();
        for idx in live {
            let pkt = batch.take(idx).expect("live slot holds packet");
            let port = pkt.anno.get(Anno::IfaceOut) as usize;
            if port < per_port.len() {
                per_port[port].push(pkt);
            } else {
                WorkerStats::bump(&self.stats.ports[0].invalid_pkts, 1);
                self.release_packet(pkt);
            }
        }
        for (port, mut pkts) in per_port.into_iter().enumerate() {
            if pkts.is_empty() {
                continue;
            }
            let sink = &self.sinks.tx[port];
            let pushed = sink.ring.enqueue_burst(&mut pkts);
            if pushed.moved > 0 {
                sink.notifier.signal();
            }
            if pushed.watermark {
                // Crossing the TX watermark is the backpressure edge; the
                // producer backs off by letting subsequent fulls drop.
                debug!(port, "tx ring watermark crossed");
            }
            if !pkts.is_empty() {
                WorkerStats::bump(&self.stats.ports[port.min(crate::MAX_PORTS - 1)].tx_drop_pkts, pkts.len() as u64);
                for pkt in pkts {
                    self.release_packet(pkt);
                }
            }
        }
        self.retire_batch(batch);
    }

    // ------------------------------------------------------------------
    // Offload path
    // ------------------------------------------------------------------

    fn try_offload(&mut self, v: usize, in_port: usize, mut batch: Box<PacketBatch>) {
        if self.inflight[v] >= self.ppdepth {
            self.requeue_or_drop(v, in_port, batch);
            return;
        }
        let (specs, kernel, args, workgroup) = {
            let off = self.graph.vertices[v]
                .elem
                .offload()
                .expect("Pending from a non-offloadable element");
            let dev = self.device_name.as_deref().unwrap_or("host");
            (
                off.datablocks(),
                off.kernel(),
                off.kernel_args().to_vec(),
                off.desired_workgroup_size(dev),
            )
        };
        if self.sinks.task_ring.is_none() {
            // Offload bound but no coprocessor wired: configuration hole.
            WorkerStats::bump(&self.stats.comp_drops, batch.live_count() as u64);
            self.kill_and_retire(batch);
            return;
        }

        // Packets that cannot carry every ROI never ship.
        let miss = task::roi_miss_mask(specs, &batch);
        if miss != 0 {
            for idx in 0..batch.count() {
                if miss & (1u64 << idx) != 0 {
                    if let Some(pkt) = batch.pkt_mut(idx) {
                        pkt.kill();
                    }
                }
            }
            WorkerStats::bump(&self.stats.comp_drops, miss.count_ones() as u64);
            self.flush_killed(&mut batch);
            if batch.live_count() == 0 {
                self.retire_batch(batch);
                return;
            }
        }

        let Some(mut tsk) = self.task_pool.alloc() else {
            self.requeue_or_drop(v, in_port, batch);
            return;
        };
        let seq = self.submit_seq[v];
        task::stage(
            &mut tsk,
            batch,
            v as u32,
            in_port,
            self.worker_id,
            seq,
            specs,
            kernel,
            &args,
            workgroup,
        );

        let ring = self.sinks.task_ring.as_ref().expect("checked above");
        match ring.enqueue(tsk) {
            Ok(_) => {
                self.submit_seq[v] += 1;
                self.inflight[v] += 1;
                WorkerStats::bump(&self.stats.offload_tasks, 1);
                if let Some(n) = &self.sinks.task_notifier {
                    n.signal();
                }
            }
            Err(mut tsk) => {
                // Ring full: unstage and requeue the batch, keep the task.
                let mut batch = tsk.batch.take().expect("staged task holds batch");
                batch.offload_finished();
                tsk.reset();
                self.task_pool.free(tsk);
                self.requeue_or_drop(v, in_port, batch);
            }
        }
    }

    fn requeue_or_drop(&mut self, v: usize, in_port: usize, mut batch: Box<PacketBatch>) {
        if batch.note_retry() > MAX_OFFLOAD_RETRIES {
            WorkerStats::bump(&self.stats.offload_retry_drops, batch.live_count() as u64);
            self.kill_and_retire(batch);
        } else {
            WorkerStats::bump(&self.stats.offload_retries, 1);
            self.retry.push_back((v, in_port, batch));
        }
    }

    /// Postproc + resume routing for one completed task, in packet order.
    fn finish_task(&mut self, mut tsk: Box<OffloadTask>) {
        let v = tsk.element as usize;
        let mut batch = tsk.batch.take().expect("completed task holds batch");
        batch.offload_finished();

        let failed = tsk.status != TaskStatus::Ok;
        if failed {
            WorkerStats::bump(&self.stats.offload_task_failures, 1);
        }
        let specs = self.graph.vertices[v]
            .elem
            .offload()
            .expect("task from non-offloadable element")
            .datablocks();
        let primary = tsk.dbs.iter().position(|db| specs[db.spec_idx].roi_out != Roi::None);

        let out_ports = self.graph.vertices[v].elem.port_count().1;
        let mut groups: Vec<Vec<usize>> = vec![Vec::new(); out_ports.max(1)];
        let mut slowpath = 0u64;
        let mut underproduced = 0u64;

        let live: Vec<usize> = batch.live_indices().collect();
        for (k, &idx) in live.iter().enumerate() {
            let pkt = batch.pkt_mut(idx).expect("live slot holds packet");

            let mut item_ok = !failed;
            if item_ok {
                for db in &tsk.dbs {
                    let spec = &specs[db.spec_idx];
                    if spec.roi_out == Roi::None {
                        continue;
                    }
                    match task::output_item(&tsk, db, k) {
                        Some(bytes) => {
                            if !crate::offload::datablock::unpack_output_item(spec, pkt, bytes) {
                                item_ok = false;
                            }
                        }
                        None => item_ok = false,
                    }
                }
            }
            if !item_ok {
                if !failed {
                    underproduced += 1;
                }
                pkt.kill();
            }
            let dev_out = if item_ok {
                primary.and_then(|p| task::output_item(&tsk, &tsk.dbs[p], k))
            } else {
                None
            };
            let action = self.graph.vertices[v]
                .elem
                .offload_mut()
                .expect("checked")
                .postproc(tsk.input_port, dev_out, batch.pkt_mut(idx).expect("live"));
            match action {
                Action::Continue(p) => {
                    let p = p as usize;
                    if p < out_ports {
                        groups[p].push(idx);
                    } else {
                        debug_assert!(false, "postproc pushed beyond declared out-arity");
                        batch.pkt_mut(idx).expect("live").kill();
                    }
                }
                Action::Drop => batch.pkt_mut(idx).expect("live").kill(),
                Action::SlowPath => {
                    slowpath += 1;
                    batch.pkt_mut(idx).expect("live").kill();
                }
                Action::Pending => {
                    debug_assert!(false, "postproc must not return Pending");
                    batch.pkt_mut(idx).expect("live").kill();
                }
            }
        }
        if slowpath > 0 {
            WorkerStats::bump(&self.stats.comp_slowpath, slowpath);
        }
        if underproduced > 0 {
            WorkerStats::bump(&self.stats.offload_underproduced, underproduced);
        }

        tsk.reset();
        self.task_pool.free(tsk);

        self.flush_killed(&mut batch);
        if batch.live_count() == 0 {
            self.retire_batch(batch);
            return;
        }
        if self.graph.vertices[v].is_tx_sink {
            self.push_tx(batch);
            return;
        }
        self.route_groups(v, batch, groups);
        self.run_stack();
    }

    // ------------------------------------------------------------------
    // Retirement and drops
    // ------------------------------------------------------------------

    fn flush_killed(&mut self, batch: &mut PacketBatch) {
        let mut dead = Vec::new();
        batch.drain_killed(&mut dead);
        if !dead.is_empty() {
            WorkerStats::bump(&self.stats.comp_drops, dead.len() as u64);
            self.push_drops(dead);
        }
    }

    fn kill_and_retire(&mut self, mut batch: Box<PacketBatch>) {
        for idx in 0..batch.count() {
            if let Some(pkt) = batch.pkt_mut(idx) {
                pkt.kill();
            }
        }
        self.retire_batch(batch);
    }

    fn retire_batch(&mut self, mut batch: Box<PacketBatch>) {
        debug_assert_eq!(batch.pending_offloads(), 0, "retiring a pending batch");
        let mut leftovers = Vec::new();
        batch.drain_all(&mut leftovers);
        if !leftovers.is_empty() {
            self.push_drops(leftovers);
        }
        batch.reset();
        self.batch_pool.free(batch);
    }

    fn push_drops(&mut self, mut pkts: Vec<Box<Packet>>) {
        let pushed = self.sinks.drop_ring.enqueue_burst(&mut pkts);
        if pushed.moved > 0 {
            self.sinks.drop_notifier.signal();
        }
        // Drop ring full: return the remainder straight to their pools so
        // nothing ever leaks.
        for pkt in pkts {
            self.release_packet(pkt);
        }
    }

    fn release_packet(&self, pkt: Box<Packet>) {
        match self.sinks.pool_for(&pkt) {
            Some(pool) => pool.release(pkt),
            None => {
                debug_assert!(false, "packet with no owning pool");
                drop(pkt);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_pipeline;
    use crate::element::ElementContext;
    use crate::engine::ring::{ProducerMode, WorkerWake};
    use crate::engines::host::HostComputeDevice;
    use crate::engine::nls::NodeLocalStorage;
    use crate::offload::device::{ComputeDevice, CtxState};

    struct Harness {
        exec: Executor,
        drop_ring: Arc<Ring<Box<Packet>>>,
        tx_rings: Vec<Arc<Ring<Box<Packet>>>>,
        task_ring: Arc<Ring<Box<OffloadTask>>>,
        completion_ring: Arc<Ring<Box<OffloadTask>>>,
        pkt_pool: MemoryPool<Packet>,
        batch_pool: MemoryPool<PacketBatch>,
        stats: Arc<WorkerStats>,
        device: Arc<HostComputeDevice>,
    }

    fn harness(pipeline: &str, preserve_latency: bool) -> Harness {
        let ctx = ElementContext { node: 0, comp_batch_size: 64, num_tx_ports: 2 };
        let p = parse_pipeline(pipeline).unwrap();
        let mut graph = ElementGraph::build(&p, &ctx).unwrap();

        let device = Arc::new(HostComputeDevice::new(2));
        device.register_kernel(
            crate::elements::ipsec_hmac::KERNEL_NAME,
            crate::elements::ipsec_hmac::hmac_sha1_host_kernel,
        );
        let nls = NodeLocalStorage::new(0);
        graph.init_global().unwrap();
        graph.init_per_node(&nls).unwrap();
        for f in graph.offload_init_fns() {
            f(device.as_ref(), &nls).unwrap();
        }
        graph.init_per_thread(&nls).unwrap();
        let has_offloadable = graph.vertices.iter().any(|v| v.offloadable);
        if has_offloadable {
            graph.bind_offload_devices(device.as_ref(), &nls).unwrap();
        }
        nls.freeze();

        let wake = WorkerWake::new();
        wake.register();
        let drop_ring: Arc<Ring<Box<Packet>>> = Arc::new(Ring::new(512, ProducerMode::Single));
        let tx_rings: Vec<Arc<Ring<Box<Packet>>>> =
            (0..2).map(|_| Arc::new(Ring::new(512, ProducerMode::Single))).collect();
        let task_ring: Arc<Ring<Box<OffloadTask>>> = Arc::new(Ring::new(64, ProducerMode::Single));
        let completion_ring: Arc<Ring<Box<OffloadTask>>> =
            Arc::new(Ring::new(64, ProducerMode::Single));

        let pkt_pool = MemoryPool::new("pkt", 0, 256, Packet::new);
        let batch_pool = MemoryPool::new("batch", 0, 64, PacketBatch::new);
        let task_pool = MemoryPool::new("task", 0, 16, OffloadTask::new);
        let stats = WorkerStats::new_shared();

        let sinks = ExecutorSinks {
            tx: tx_rings
                .iter()
                .map(|r| TxSink { ring: r.clone(), notifier: Notifier::new(wake.clone()) })
                .collect(),
            drop_ring: drop_ring.clone(),
            drop_notifier: Notifier::new(wake.clone()),
            task_ring: Some(task_ring.clone()),
            task_notifier: Some(Notifier::new(wake.clone())),
            packet_pools: vec![pkt_pool.clone()],
            num_rxq_per_port: 1,
        };
        let exec = Executor::new(
            graph,
            0,
            Some("host".into()),
            4,
            preserve_latency,
            batch_pool.handle(),
            task_pool.handle(),
            sinks,
            stats.clone(),
        );
        Harness {
            exec,
            drop_ring,
            tx_rings,
            task_ring,
            completion_ring: completion_ring.clone(),
            pkt_pool,
            batch_pool,
            stats,
            device,
        }
    }

    fn make_batch(h: &mut Harness, frames: &[Vec<u8>]) -> Box<PacketBatch> {
        let mut handle = h.pkt_pool.handle();
        let mut batch = Box::new(PacketBatch::new());
        for f in frames {
            let mut pkt = handle.alloc().unwrap();
            pkt.reset(0, 0, 1);
            assert!(pkt.fill(f));
            batch.push(pkt);
        }
        batch
    }

    fn eth_frame(dst_last: u8, ethertype: u16, len: usize) -> Vec<u8> {
        let mut f = vec![0u8; len];
        f[..6].copy_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, dst_last]);
        f[12..14].copy_from_slice(&ethertype.to_be_bytes());
        f
    }

    fn drain<T>(ring: &Ring<T>) -> Vec<T> {
        let mut out = Vec::new();
        ring.dequeue_burst(&mut out, usize::MAX >> 1);
        out
    }

    /// Emulate the coprocessor worker synchronously for one task.
    fn run_coproc_once(h: &mut Harness) {
        let mut tsk = h.task_ring.dequeue().expect("task queued");
        let mut ctx = h.device.get_available_context().expect("context free");
        ctx.begin().unwrap();
        *ctx.host_input() = tsk.input.clone();
        ctx.reserve_output(tsk.output_expected);
        for a in &tsk.args {
            ctx.push_kernel_arg(*a);
        }
        ctx.enqueue_memwrite(0, tsk.input.len()).unwrap();
        ctx.enqueue_kernel_launch(tsk.kernel, &tsk.res).unwrap();
        ctx.enqueue_memread(0, tsk.output_expected).unwrap();
        loop {
            match ctx.poll().unwrap() {
                CtxState::Finished => break,
                _ => {}
            }
        }
        tsk.output = ctx.host_output().to_vec();
        tsk.status = TaskStatus::Ok;
        ctx.reclaim();
        h.device.release_context(ctx);
        h.completion_ring.enqueue(tsk).map_err(|_| ()).unwrap();
    }

    #[test]
    fn discard_pipeline_drops_everything() {
        let mut h = harness("fi :: FromInput(0); d :: Discard(); fi -> d", false);
        let frames: Vec<Vec<u8>> = (0..10).map(|i| eth_frame(i, 0x0800, 64)).collect();
        let batch = make_batch(&mut h, &frames);
        h.exec.run_batch(batch);
        let dropped = drain(&h.drop_ring);
        assert_eq!(dropped.len(), 10);
        assert_eq!(h.stats.comp_drops.load(std::sync::atomic::Ordering::Relaxed), 10);
        assert!(drain(&h.tx_rings[0]).is_empty());
    }

    #[test]
    fn l2_forward_reaches_tx_ring() {
        let mut h = harness(
            "fi :: FromInput(0); fwd :: L2Forward(); out :: ToOutput(); fi -> fwd -> out",
            false,
        );
        let frames: Vec<Vec<u8>> = (0..8).map(|_| eth_frame(1, 0x0800, 64)).collect();
        let batch = make_batch(&mut h, &frames);
        h.exec.run_batch(batch);
        assert_eq!(drain(&h.tx_rings[1]).len(), 8);
        assert!(drain(&h.tx_rings[0]).is_empty());
        assert!(drain(&h.drop_ring).is_empty());
    }

    #[test]
    fn classifier_splits_batches_per_port() {
        let mut h = harness(
            "fi :: FromInput(0); cl :: Classifier(0x0800, 0x86DD); a :: Discard(); \
             fwd :: L2Forward(next=0); out :: ToOutput(); b :: Discard(); \
             fi -> cl; cl[0] -> fwd -> out; cl[1] -> a; cl[2] -> b",
            false,
        );
        let mut frames = Vec::new();
        for i in 0..6 {
            frames.push(eth_frame(i, 0x0800, 64)); // → tx
        }
        for _ in 0..3 {
            frames.push(eth_frame(0, 0x86DD, 64)); // → discard
        }
        frames.push(eth_frame(0, 0x0806, 64)); // → default discard
        let batch = make_batch(&mut h, &frames);
        h.exec.run_batch(batch);
        assert_eq!(drain(&h.tx_rings[0]).len(), 6);
        assert_eq!(drain(&h.drop_ring).len(), 4);
    }

    #[test]
    fn empty_batch_is_silently_retired() {
        let mut h = harness("fi :: FromInput(0); d :: Discard(); fi -> d", false);
        let batch = Box::new(PacketBatch::new());
        h.exec.run_batch(batch);
        assert!(drain(&h.drop_ring).is_empty());
    }

    fn hmac_pipeline() -> &'static str {
        "fi :: FromInput(0); auth :: IPsecAuthHMACSHA1(); out :: ToOutput(0); fi -> auth -> out"
    }

    fn esp_frames(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| eth_frame(0, 0x0800, 120 + (i % 5) * 8)).collect()
    }

    #[test]
    fn offload_round_trip_matches_cpu_path() {
        // Offload path.
        let mut h = harness(hmac_pipeline(), false);
        let frames = esp_frames(4);
        let mut batch = make_batch(&mut h, &frames);
        for idx in 0..batch.count() {
            batch.pkt_mut(idx).unwrap().anno.set(Anno::IpsecFlowId, (idx % 1024) as u64);
        }
        h.exec.run_batch(batch);
        assert_eq!(h.task_ring.len(), 1);
        run_coproc_once(&mut h);
        let done = h.completion_ring.dequeue().unwrap();
        h.exec.on_completion(done);
        let offloaded = drain(&h.tx_rings[0]);
        assert_eq!(offloaded.len(), 4);

        // CPU reference: same frames through an unbound element.
        let mut elem = crate::elements::IpsecAuthHmacSha1::new();
        let ectx = ElementContext { node: 0, comp_batch_size: 64, num_tx_ports: 1 };
        elem.configure(&ectx, &[]).unwrap();
        elem.initialize_global().unwrap();
        let nls = NodeLocalStorage::new(0);
        elem.initialize_per_node(&nls).unwrap();
        elem.initialize(&nls).unwrap();
        use crate::element::Element;
        for (i, f) in frames.iter().enumerate() {
            let mut pkt = Packet::new();
            pkt.reset(0, 0, 0);
            pkt.fill(f);
            pkt.anno.set(Anno::IpsecFlowId, (i % 1024) as u64);
            assert_eq!(elem.process(0, &mut pkt), Action::Continue(0));
            assert_eq!(pkt.data(), offloaded[i].data(), "offload differs from cpu at {i}");
        }
    }

    #[test]
    fn annotation_survives_offload() {
        let mut h = harness(hmac_pipeline(), false);
        let mut batch = make_batch(&mut h, &esp_frames(1));
        batch.pkt_mut(0).unwrap().anno.set(Anno::IpsecFlowId, 7);
        h.exec.run_batch(batch);
        run_coproc_once(&mut h);
        let done = h.completion_ring.dequeue().unwrap();
        h.exec.on_completion(done);
        let out = drain(&h.tx_rings[0]);
        assert_eq!(out[0].anno.get(Anno::IpsecFlowId), 7);
    }

    #[test]
    fn preserve_latency_reorders_completions() {
        let mut h = harness(hmac_pipeline(), true);
        for _ in 0..3 {
            let mut batch = make_batch(&mut h, &esp_frames(2));
            for idx in 0..batch.count() {
                batch.pkt_mut(idx).unwrap().anno.set(Anno::IpsecFlowId, 1);
            }
            h.exec.run_batch(batch);
        }
        assert_eq!(h.task_ring.len(), 3);
        run_coproc_once(&mut h);
        run_coproc_once(&mut h);
        run_coproc_once(&mut h);
        let t0 = h.completion_ring.dequeue().unwrap();
        let t1 = h.completion_ring.dequeue().unwrap();
        let t2 = h.completion_ring.dequeue().unwrap();
        assert_eq!((t0.seq, t1.seq, t2.seq), (0, 1, 2));

        // Deliver out of order: 2, 0, 1.
        h.exec.on_completion(t2);
        assert!(drain(&h.tx_rings[0]).is_empty(), "seq 2 must wait for 0 and 1");
        h.exec.on_completion(t0);
        assert_eq!(drain(&h.tx_rings[0]).len(), 2, "only seq 0 may pass");
        h.exec.on_completion(t1);
        assert_eq!(drain(&h.tx_rings[0]).len(), 4, "seq 1 then stashed seq 2");
        assert_eq!(h.exec.outstanding(), 0);
    }

    #[test]
    fn task_failure_kills_batch_via_postproc_null() {
        let mut h = harness(hmac_pipeline(), false);
        let mut batch = make_batch(&mut h, &esp_frames(3));
        for idx in 0..batch.count() {
            batch.pkt_mut(idx).unwrap().anno.set(Anno::IpsecFlowId, 0);
        }
        h.exec.run_batch(batch);
        let mut tsk = h.task_ring.dequeue().unwrap();
        tsk.status = TaskStatus::DeviceError;
        h.exec.on_completion(tsk);
        assert_eq!(drain(&h.drop_ring).len(), 3);
        assert!(drain(&h.tx_rings[0]).is_empty());
        assert_eq!(
            h.stats.offload_task_failures.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn depth_cap_requeues_then_bounded_drop() {
        let mut h = harness(hmac_pipeline(), false);
        // ppdepth is 4 in the harness; submit 4 tasks to fill the window.
        for _ in 0..4 {
            let mut batch = make_batch(&mut h, &esp_frames(1));
            batch.pkt_mut(0).unwrap().anno.set(Anno::IpsecFlowId, 0);
            h.exec.run_batch(batch);
        }
        assert_eq!(h.task_ring.len(), 4);
        // The fifth lands on the retry deque.
        let mut batch = make_batch(&mut h, &esp_frames(1));
        batch.pkt_mut(0).unwrap().anno.set(Anno::IpsecFlowId, 0);
        h.exec.run_batch(batch);
        assert_eq!(h.exec.retry_len(), 1);

        // Retrying past the bound turns into a counted drop.
        for _ in 0..=MAX_OFFLOAD_RETRIES {
            h.exec.drain_retries();
        }
        assert_eq!(h.exec.retry_len(), 0);
        assert_eq!(drain(&h.drop_ring).len(), 1);
        assert!(h.stats.offload_retry_drops.load(std::sync::atomic::Ordering::Relaxed) >= 1);
    }

    #[test]
    fn scheduler_element_parks_batches_for_the_next_round() {
        let mut h = harness(
            "fi :: FromInput(0); q :: Queue(); fwd :: L2Forward(next=0); out :: ToOutput(); \
             fi -> q; q -> fwd; fwd -> out",
            false,
        );
        let frames: Vec<Vec<u8>> = (0..4).map(|_| eth_frame(1, 0x0800, 64)).collect();
        let batch = make_batch(&mut h, &frames);
        h.exec.run_batch(batch);
        // Parked in the Queue vertex: nothing transmitted yet.
        assert!(drain(&h.tx_rings[0]).is_empty());
        assert_eq!(h.exec.outstanding(), 1);
        // The next dispatch round reinjects it downstream.
        h.exec.drain_scheduled();
        assert_eq!(drain(&h.tx_rings[0]).len(), 4);
        assert_eq!(h.exec.outstanding(), 0);
    }

    #[test]
    fn batches_and_packets_return_to_pools() {
        let mut h = harness("fi :: FromInput(0); d :: Discard(); fi -> d", false);
        for _ in 0..20 {
            let frames: Vec<Vec<u8>> = (0..5).map(|i| eth_frame(i, 0x0800, 64)).collect();
            let batch = make_batch(&mut h, &frames);
            h.exec.run_batch(batch);
        }
        // Return drop-ring packets to their pool as the io worker would.
        let mut handle = h.pkt_pool.handle();
        for pkt in drain(&h.drop_ring) {
            handle.free(pkt);
        }
        handle.flush();
        drop(h.exec); // flush executor-held pool caches
        assert_eq!(h.pkt_pool.occupancy(), 256);
        assert_eq!(h.batch_pool.occupancy(), 64);
    }
}
