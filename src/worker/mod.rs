// FLOWLINE — WORKER LAYER
// The three cooperative event loops and the supervisor that wires and
// phases them. Each worker is one pinned kernel thread running drain-all-
// then-park over {ring notifiers, device completions, timer, terminate}.

pub mod comp;
pub mod coproc;
pub mod io;
pub mod supervisor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::engine::ring::WorkerWake;

/// Process-wide terminate signal. Monotonic: once set it stays set; workers
/// check it at the top of every loop iteration, the supervisor kicks every
/// worker's wake so parked loops notice immediately.
#[derive(Clone)]
pub struct Halt {
    flag: Arc<AtomicBool>,
}

impl Halt {
    pub fn new() -> Self {
        Halt { flag: Arc::new(AtomicBool::new(false)) }
    }

    #[inline(always)]
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

impl Default for Halt {
    fn default() -> Self {
        Halt::new()
    }
}

/// Wake handles of every spawned worker, for the terminate broadcast.
#[derive(Default)]
pub struct WakeRoster {
    wakes: Vec<Arc<WorkerWake>>,
}

impl WakeRoster {
    pub fn add(&mut self, wake: Arc<WorkerWake>) {
        self.wakes.push(wake);
    }

    pub fn kick_all(&self) {
        for w in &self.wakes {
            w.kick();
        }
    }
}
