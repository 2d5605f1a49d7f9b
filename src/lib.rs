// FLOWLINE — CRATE ROOT (LIBRARY)
// Element-graph packet processing over NUMA-pinned cooperative workers.
//
// Module hierarchy:
//   config/    — System parameter file + pipeline DSL + thread wiring plan
//   topology/  — CPU/NUMA discovery, core pinning
//   engine/    — TSC clock, rings + notifiers, memory pools, node-local storage
//   packet/    — Packet, annotations, fixed-capacity batches
//   offload/   — Datablocks, tasks, compute device/context contracts
//   engines/   — Concrete compute engines (host-memory engine)
//   element/   — Element contract, capability record, class registry
//   elements/  — Standard element classes (Discard, L2Forward, IPsec HMAC, ...)
//   graph/     — Element graph build/validation + the per-worker executor
//   worker/    — The three cooperative event loops (io, comp, coproc)
//   nic/       — NIC driver seam + deterministic sim driver
//   stats/     — Per-worker counters, node-master aggregation

pub mod config;
pub mod element;
pub mod elements;
pub mod engine;
pub mod engines;
pub mod error;
pub mod graph;
pub mod nic;
pub mod offload;
pub mod packet;
pub mod stats;
pub mod topology;
pub mod worker;

pub use error::{Error, Result};

/// Headroom reserved in front of every packet buffer.
pub const PACKET_HEADROOM: usize = 128;
/// Maximum packet payload size carried by one packet buffer.
pub const MAX_PACKET_SIZE: usize = 2048;
/// Hard upper bound on packets per computation batch. The runtime value
/// (`COMP_BATCH_SIZE`) may be lower, never higher. Must stay at 64 so the
/// batch live-map fits one u64 word.
pub const MAX_COMP_BATCH_SIZE: usize = 64;
const _: () = assert!(MAX_COMP_BATCH_SIZE == 64);

/// Maximum NIC ports and NUMA nodes the static tables are sized for.
pub const MAX_PORTS: usize = 8;
pub const MAX_NODES: usize = 4;

/// Per-worker object cache depth for the memory pools.
pub const MP_CACHE: usize = 512;
