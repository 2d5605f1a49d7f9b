// FLOWLINE — SUPERVISOR
// Wires pools, rings and notifiers from the system config, then brings the
// three worker tiers up in dependency order: coprocessor workers first
// (device init), computation workers (the barrier-serialized graph init
// ladder), I/O workers last — traffic only flows once everything upstream
// reported ready. Shutdown is the reverse: trigger the halt flag, kick
// every parked worker, join.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;

use tracing::{error, info};

use crate::config::{PipelineConfig, SystemConfig};
use crate::engine::clock::{calibrate_tsc, TscCal};
use crate::engine::nls::NodeLocalStorage;
use crate::engine::pool::MemoryPool;
use crate::engine::ring::{Notifier, ProducerMode, Ring, WorkerWake};
use crate::engines::DeviceRegistry;
use crate::graph::executor::{ExecutorSinks, TxSink};
use crate::nic::NicDriver;
use crate::offload::device::SharedDevice;
use crate::offload::task::OffloadTask;
use crate::packet::batch::PacketBatch;
use crate::packet::Packet;
use crate::stats::WorkerStats;
use crate::topology;
use crate::worker::comp::{comp_loop, CompWorkerCtx};
use crate::worker::coproc::{coproc_loop, CoprocWorkerCtx};
use crate::worker::io::{io_loop, IoWorkerCtx, RxQueue};
use crate::worker::{Halt, WakeRoster};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, Default)]
pub struct LaunchOptions {
    pub preserve_latency: bool,
}

pub struct Supervisor {
    halt: Halt,
    roster: WakeRoster,
    /// Joined in tier order on shutdown: computation, coprocessor, I/O.
    comp_handles: Vec<JoinHandle<()>>,
    coproc_handles: Vec<JoinHandle<()>>,
    io_handles: Vec<JoinHandle<()>>,
    stats: Vec<Arc<WorkerStats>>,
    packet_pools: Vec<MemoryPool<Packet>>,
    batch_pools: Vec<MemoryPool<PacketBatch>>,
    task_pools: Vec<MemoryPool<OffloadTask>>,
}

impl Supervisor {
    /// Phased startup. Returns once traffic is flowing or with the first
    /// init error.
    pub fn launch(
        cfg: &SystemConfig,
        pipeline: PipelineConfig,
        nic: Arc<dyn NicDriver>,
        devices: &DeviceRegistry,
        opts: LaunchOptions,
    ) -> Result<Supervisor> {
        cfg.validate()?;
        let params = cfg.params();
        let num_pairs = cfg.threads.io.len();
        let num_ports = cfg.num_ports;
        let pipeline = Arc::new(pipeline);
        let clock: TscCal = calibrate_tsc();
        let halt = Halt::new();
        let mut roster = WakeRoster::default();
        let mut comp_handles = Vec::new();
        let mut coproc_handles = Vec::new();
        let mut io_handles = Vec::new();
        let mut all_stats: Vec<Arc<WorkerStats>> = Vec::new();
        let comp_done: Vec<Arc<AtomicBool>> =
            (0..num_pairs).map(|_| Arc::new(AtomicBool::new(false))).collect();

        // ------------------------------------------------------------------
        // Shared resources: pools, rings, wakes, node-local storage.
        // ------------------------------------------------------------------

        // Packet pools, one per hardware (port, queue).
        let mut packet_pools = Vec::with_capacity(num_ports * params.num_rxq_per_port);
        for _ in 0..num_ports * params.num_rxq_per_port {
            packet_pools.push(MemoryPool::new("pktbuf", 0, params.io_desc_per_hwrxq, Packet::new));
        }

        let comp_wakes: Vec<Arc<WorkerWake>> = (0..num_pairs).map(|_| WorkerWake::new()).collect();
        let io_wakes: Vec<Arc<WorkerWake>> = (0..num_pairs).map(|_| WorkerWake::new()).collect();

        // One notifier instance per ring pairing, cloned to both ends so the
        // producer's arming edge and the consumer's clear hit the same flag.
        let rx_notifiers: Vec<Notifier> =
            (0..num_pairs).map(|i| Notifier::new(comp_wakes[i].clone())).collect();
        let completion_notifiers: Vec<Notifier> =
            (0..num_pairs).map(|i| Notifier::new(comp_wakes[i].clone())).collect();
        let drop_notifiers: Vec<Notifier> =
            (0..num_pairs).map(|i| Notifier::new(io_wakes[i].clone())).collect();
        let tx_notifiers: Vec<Vec<Notifier>> = (0..num_pairs)
            .map(|i| (0..num_ports).map(|_| Notifier::new(io_wakes[i].clone())).collect())
            .collect();

        // NUMA placement of every thread, from its core.
        let comp_nodes: Vec<usize> =
            cfg.threads.comp.iter().map(|c| topology::node_of_cpu(c.core)).collect();
        let io_nodes: Vec<usize> =
            cfg.threads.io.iter().map(|c| topology::node_of_cpu(c.core)).collect();

        let mut nls_by_node: std::collections::HashMap<usize, Arc<NodeLocalStorage>> =
            std::collections::HashMap::new();
        for &node in &comp_nodes {
            nls_by_node.entry(node).or_insert_with(|| Arc::new(NodeLocalStorage::new(node)));
        }

        // Coprocessor workers: one per configured entry, keyed by node.
        struct CoprocPlan {
            node: usize,
            core: usize,
            device: SharedDevice,
            task_ring: Arc<Ring<Box<OffloadTask>>>,
            task_notifier: Notifier,
            wake: Arc<WorkerWake>,
            init_tx: std::sync::mpsc::Sender<crate::worker::comp::OffloadInitRequest>,
            init_rx: Option<std::sync::mpsc::Receiver<crate::worker::comp::OffloadInitRequest>>,
        }
        let mut coproc_plans: std::collections::HashMap<usize, CoprocPlan> =
            std::collections::HashMap::new();
        for conf in &cfg.threads.coproc {
            let node = topology::node_of_cpu(conf.core);
            if coproc_plans.contains_key(&node) {
                return Err(Error::ConfigInvalid(format!(
                    "two coprocessor workers on node {node}"
                )));
            }
            let (init_tx, init_rx) = std::sync::mpsc::channel();
            let wake = WorkerWake::new();
            coproc_plans.insert(
                node,
                CoprocPlan {
                    node,
                    core: conf.core,
                    device: devices.get(&conf.device)?,
                    task_ring: Arc::new(
                        Ring::new(params.coproc_inputq_length, ProducerMode::Multi)
                            .with_watermark_margin(8),
                    ),
                    task_notifier: Notifier::new(wake.clone()),
                    wake,
                    init_tx,
                    init_rx: Some(init_rx),
                },
            );
        }

        // Per-pair rings and pools.
        let mut rx_rings = Vec::new();
        let mut drop_rings = Vec::new();
        let mut tx_rings: Vec<Vec<Arc<Ring<Box<Packet>>>>> = Vec::new();
        let mut completion_rings = Vec::new();
        let mut batch_pools = Vec::new();
        let mut task_pools = Vec::new();
        for i in 0..num_pairs {
            rx_rings.push(Arc::new(Ring::<Box<PacketBatch>>::new(
                params.io_rxq_length,
                ProducerMode::Single,
            )));
            drop_rings.push(Arc::new(Ring::<Box<Packet>>::new(
                8 * params.comp_batch_size,
                ProducerMode::Single,
            )));
            tx_rings.push(
                (0..num_ports)
                    .map(|_| {
                        Arc::new(
                            Ring::<Box<Packet>>::new(8 * params.comp_batch_size, ProducerMode::Single)
                                .with_watermark_margin(16),
                        )
                    })
                    .collect(),
            );
            completion_rings.push(Arc::new(Ring::<Box<OffloadTask>>::new(
                params.coproc_completionq_length,
                ProducerMode::Single,
            )));
            batch_pools.push(MemoryPool::new("batchpool", comp_nodes[i], params.batchpool_size, PacketBatch::new));
            task_pools.push(MemoryPool::new("taskpool", comp_nodes[i], params.taskpool_size, OffloadTask::new));
        }

        // ------------------------------------------------------------------
        // Spawn coprocessor workers.
        // ------------------------------------------------------------------
        for plan in coproc_plans.values_mut() {
            let stats = WorkerStats::new_shared();
            all_stats.push(stats.clone());
            roster.add(plan.wake.clone());
            let ctx = CoprocWorkerCtx {
                id: plan.node,
                core: plan.core,
                node: plan.node,
                device: plan.device.clone(),
                nls: nls_by_node
                    .entry(plan.node)
                    .or_insert_with(|| Arc::new(NodeLocalStorage::new(plan.node)))
                    .clone(),
                task_ring: plan.task_ring.clone(),
                task_notifier: plan.task_notifier.clone(),
                completion_rings: completion_rings
                    .iter()
                    .enumerate()
                    .map(|(i, r)| (r.clone(), completion_notifiers[i].clone()))
                    .collect(),
                wake: plan.wake.clone(),
                halt: halt.clone(),
                stats,
                init_rx: plan.init_rx.take().expect("init channel handed out once"),
            };
            let name = format!("fl-coproc{}", plan.node);
            coproc_handles.push(spawn_worker(&name, move || coproc_loop(ctx))?);
        }
        info!(count = coproc_plans.len(), "spawned coprocessor workers");

        // ------------------------------------------------------------------
        // Spawn computation workers and wait for the init ladder.
        // ------------------------------------------------------------------
        let init_barrier = Arc::new(Barrier::new(num_pairs));
        let init_failed = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let mut node_leader_seen: std::collections::HashSet<usize> = std::collections::HashSet::new();

        for i in 0..num_pairs {
            let node = comp_nodes[i];
            let node_leader = node_leader_seen.insert(node);
            let stats = WorkerStats::new_shared();
            all_stats.push(stats.clone());
            roster.add(comp_wakes[i].clone());
            let plan = coproc_plans.get(&node);

            let sinks = ExecutorSinks {
                tx: tx_rings[i]
                    .iter()
                    .zip(&tx_notifiers[i])
                    .map(|(r, n)| TxSink { ring: r.clone(), notifier: n.clone() })
                    .collect(),
                drop_ring: drop_rings[i].clone(),
                drop_notifier: drop_notifiers[i].clone(),
                task_ring: plan.map(|p| p.task_ring.clone()),
                task_notifier: plan.map(|p| p.task_notifier.clone()),
                packet_pools: packet_pools.clone(),
                num_rxq_per_port: params.num_rxq_per_port,
            };
            let ctx = CompWorkerCtx {
                id: i,
                core: cfg.threads.comp[i].core,
                node,
                global_leader: i == 0,
                node_leader,
                pipeline: pipeline.clone(),
                params: params.clone(),
                preserve_latency: opts.preserve_latency,
                num_tx_ports: num_ports,
                nls: nls_by_node[&node].clone(),
                device: plan.map(|p| p.device.clone()),
                rx_ring: rx_rings[i].clone(),
                rx_notifier: rx_notifiers[i].clone(),
                completion_ring: completion_rings[i].clone(),
                completion_notifier: completion_notifiers[i].clone(),
                sinks: Some(sinks),
                batch_pool: batch_pools[i].clone(),
                task_pool: task_pools[i].clone(),
                wake: comp_wakes[i].clone(),
                halt: halt.clone(),
                stats,
                init_barrier: init_barrier.clone(),
                init_failed: init_failed.clone(),
                offload_init_tx: plan.map(|p| p.init_tx.clone()),
                ready_tx: ready_tx.clone(),
                done: comp_done[i].clone(),
                clock,
            };
            comp_handles.push(spawn_worker(&format!("fl-comp{i}"), move || comp_loop(ctx))?);
        }
        drop(ready_tx);

        let mut ready = 0;
        let mut failed = false;
        while ready < num_pairs {
            match ready_rx.recv() {
                Ok(true) => ready += 1,
                Ok(false) => {
                    failed = true;
                    ready += 1;
                }
                Err(_) => {
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            error!("computation worker init failed, tearing down");
            halt.trigger();
            roster.kick_all();
            for h in comp_handles.into_iter().chain(coproc_handles) {
                let _ = h.join();
            }
            return Err(Error::ConfigInvalid("element graph initialization failed".into()));
        }
        info!(count = num_pairs, "computation workers ready");

        // ------------------------------------------------------------------
        // Spawn I/O workers; traffic starts here.
        // ------------------------------------------------------------------
        let io_stats: Vec<Arc<WorkerStats>> =
            (0..num_pairs).map(|_| WorkerStats::new_shared()).collect();
        all_stats.extend(io_stats.iter().cloned());

        let mut io_master_seen: std::collections::HashSet<usize> = std::collections::HashSet::new();
        for i in 0..num_pairs {
            let conf = &cfg.threads.io[i];
            let node = io_nodes[i];
            let is_node_master = io_master_seen.insert(node);
            let stats = io_stats[i].clone();
            roster.add(io_wakes[i].clone());
            let rxqs = conf
                .rxqs
                .iter()
                .map(|&(port, queue)| RxQueue {
                    port: port as u16,
                    queue: queue as u16,
                    pool: packet_pools[port * params.num_rxq_per_port + queue].clone(),
                })
                .collect();
            let ctx = IoWorkerCtx {
                id: i,
                core: conf.core,
                node,
                is_node_master,
                nic: nic.clone(),
                rxqs,
                batch_pool: batch_pools[i].clone(),
                rx_ring: rx_rings[i].clone(),
                rx_notifier: rx_notifiers[i].clone(),
                tx_rings: tx_rings[i].clone(),
                tx_notifiers: tx_notifiers[i].clone(),
                drop_ring: drop_rings[i].clone(),
                drop_notifier: drop_notifiers[i].clone(),
                wake: io_wakes[i].clone(),
                halt: halt.clone(),
                comp_done: comp_done[i].clone(),
                stats,
                all_stats: all_stats.clone(),
                io_batch_size: params.io_batch_size,
                comp_batch_size: params.comp_batch_size,
                clock,
            };
            io_handles.push(spawn_worker(&format!("fl-io{i}"), move || io_loop(ctx))?);
        }
        info!(count = num_pairs, "spawned io workers, traffic running");

        Ok(Supervisor {
            halt,
            roster,
            comp_handles,
            coproc_handles,
            io_handles,
            stats: all_stats,
            packet_pools,
            batch_pools,
            task_pools,
        })
    }

    pub fn halt_handle(&self) -> Halt {
        self.halt.clone()
    }

    pub fn stats(&self) -> &[Arc<WorkerStats>] {
        &self.stats
    }

    /// Graceful teardown: signal, kick parked loops, join tier by tier —
    /// computation drains first, the coprocessor follows, I/O drains last so
    /// every in-flight packet finds its way back to a pool.
    pub fn shutdown(&mut self) {
        self.halt.trigger();
        self.roster.kick_all();
        for h in self.comp_handles.drain(..) {
            let _ = h.join();
        }
        for h in self.coproc_handles.drain(..) {
            let _ = h.join();
        }
        for h in self.io_handles.drain(..) {
            let _ = h.join();
        }
        info!("all workers stopped");
    }

    /// Block until the halt flag is raised (by a signal handler or a fatal
    /// device error), then tear down.
    pub fn wait_for_halt(&mut self) {
        while !self.halt.is_set() {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        self.shutdown();
    }

    /// Pool occupancy after shutdown: (name, in-pool, capacity) per pool.
    /// With all caches flushed on worker exit, a leak-free run reports
    /// in-pool == capacity everywhere.
    pub fn pool_occupancy(&self) -> Vec<(&'static str, usize, usize)> {
        let mut out = Vec::new();
        for p in &self.packet_pools {
            out.push((p.name(), p.occupancy(), p.capacity()));
        }
        for p in &self.batch_pools {
            out.push((p.name(), p.occupancy(), p.capacity()));
        }
        for p in &self.task_pools {
            out.push((p.name(), p.occupancy(), p.capacity()));
        }
        out
    }
}

fn spawn_worker(name: &str, body: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(name.to_string())
        .stack_size(2 * 1024 * 1024)
        .spawn(body)
        .map_err(|e| Error::ConfigInvalid(format!("cannot spawn {name}: {e}")))
}
