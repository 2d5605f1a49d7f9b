// FLOWLINE — STATISTICS
// Per-worker atomic counters, written relaxed on the owning worker and read
// by the node-master I/O worker once per second for the aggregate line. No
// locks anywhere; aggregation is a racy-but-monotonic snapshot, which is all
// a rate display needs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::MAX_PORTS;

#[derive(Default)]
pub struct PortStats {
    pub recv_pkts: AtomicU64,
    pub sent_pkts: AtomicU64,
    pub sw_drop_pkts: AtomicU64,
    pub rx_drop_pkts: AtomicU64,
    pub tx_drop_pkts: AtomicU64,
    pub invalid_pkts: AtomicU64,
}

#[derive(Default)]
pub struct WorkerStats {
    pub ports: [PortStats; MAX_PORTS],
    // Computation-side counters.
    pub comp_drops: AtomicU64,
    pub comp_slowpath: AtomicU64,
    pub comp_exhausted: AtomicU64,
    pub offload_tasks: AtomicU64,
    pub offload_completions: AtomicU64,
    pub offload_retries: AtomicU64,
    pub offload_retry_drops: AtomicU64,
    pub offload_task_failures: AtomicU64,
    pub offload_underproduced: AtomicU64,
}

impl WorkerStats {
    pub fn new_shared() -> Arc<Self> {
        Arc::new(WorkerStats::default())
    }

    #[inline(always)]
    pub fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Snapshot totals across a set of workers (the node master's view).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Totals {
    pub recv: u64,
    pub sent: u64,
    pub sw_drop: u64,
    pub rx_drop: u64,
    pub tx_drop: u64,
    pub invalid: u64,
    pub offloaded: u64,
    pub completed: u64,
}

pub fn aggregate(workers: &[Arc<WorkerStats>]) -> Totals {
    let mut t = Totals::default();
    for w in workers {
        for p in &w.ports {
            t.recv += p.recv_pkts.load(Ordering::Relaxed);
            t.sent += p.sent_pkts.load(Ordering::Relaxed);
            t.sw_drop += p.sw_drop_pkts.load(Ordering::Relaxed);
            t.rx_drop += p.rx_drop_pkts.load(Ordering::Relaxed);
            t.tx_drop += p.tx_drop_pkts.load(Ordering::Relaxed);
            t.invalid += p.invalid_pkts.load(Ordering::Relaxed);
        }
        t.sw_drop += w.comp_drops.load(Ordering::Relaxed);
        t.offloaded += w.offload_tasks.load(Ordering::Relaxed);
        t.completed += w.offload_completions.load(Ordering::Relaxed);
    }
    t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_sums_across_workers() {
        let a = WorkerStats::new_shared();
        let b = WorkerStats::new_shared();
        WorkerStats::bump(&a.ports[0].recv_pkts, 10);
        WorkerStats::bump(&b.ports[1].recv_pkts, 5);
        WorkerStats::bump(&b.comp_drops, 3);
        let t = aggregate(&[a, b]);
        assert_eq!(t.recv, 15);
        assert_eq!(t.sw_drop, 3);
    }
}
