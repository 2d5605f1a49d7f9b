// FLOWLINE — BOUNDED BURST RING + WAKEUP NOTIFIER
// DPDK-model ring: reserve-then-publish indices, masked power-of-two buffer,
// burst enqueue/dequeue that return the number actually moved. Enqueue side
// is SP or MP (chosen at construction), dequeue side is always SC — every
// handoff ring in the system has exactly one consumer worker.
//
// Each ring is paired with a one-shot notifier: the producer signals after a
// non-empty enqueue, the consumer's event loop wakes and drains until empty.
// The consumer must clear() the notifier BEFORE its final emptiness check,
// otherwise an enqueue landing between drain and park is lost.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::Thread;
use std::time::Duration;

use crossbeam::utils::CachePadded;

/// Enqueue mode. Dequeue is single-consumer by construction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProducerMode {
    Single,
    Multi,
}

/// Result of a burst enqueue. `watermark` is set when this enqueue crossed
/// the watermark upward; producers use it to back off (TX backpressure).
#[derive(Clone, Copy, Debug, Default)]
pub struct Enqueued {
    pub moved: usize,
    pub watermark: bool,
}

pub struct Ring<T> {
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    cap: usize,
    watermark: usize,
    mode: ProducerMode,
    prod_head: CachePadded<AtomicUsize>,
    prod_tail: CachePadded<AtomicUsize>,
    cons_tail: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    /// Capacity is rounded up to a power of two. The watermark defaults to
    /// `capacity - 8` in the original system's manner; override with
    /// `set_watermark_margin` before wiring producers.
    pub fn new(capacity: usize, mode: ProducerMode) -> Self {
        let cap = capacity.max(2).next_power_of_two();
        let mut buf = Vec::with_capacity(cap);
        for _ in 0..cap {
            buf.push(UnsafeCell::new(MaybeUninit::uninit()));
        }
        Ring {
            buf: buf.into_boxed_slice(),
            mask: cap - 1,
            cap,
            watermark: cap - (cap / 8).clamp(1, 8),
            mode,
            prod_head: CachePadded::new(AtomicUsize::new(0)),
            prod_tail: CachePadded::new(AtomicUsize::new(0)),
            cons_tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_watermark_margin(mut self, margin: usize) -> Self {
        self.watermark = self.cap.saturating_sub(margin).max(1);
        self
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.prod_tail
            .load(Ordering::Acquire)
            .wrapping_sub(self.cons_tail.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    pub fn over_watermark(&self) -> bool {
        self.len() >= self.watermark
    }

    /// Move as many items as fit from the front of `items`, preserving order.
    /// Items that do not fit stay in the vector.
    pub fn enqueue_burst(&self, items: &mut Vec<T>) -> Enqueued {
        let want = items.len();
        if want == 0 {
            return Enqueued::default();
        }

        let mut head;
        let n;
        loop {
            head = self.prod_head.load(Ordering::Relaxed);
            let used = head.wrapping_sub(self.cons_tail.load(Ordering::Acquire));
            let free = self.cap - used;
            let take = want.min(free);
            if take == 0 {
                return Enqueued::default();
            }
            match self.mode {
                ProducerMode::Single => {
                    self.prod_head.store(head.wrapping_add(take), Ordering::Relaxed);
                    n = take;
                    break;
                }
                ProducerMode::Multi => {
                    if self
                        .prod_head
                        .compare_exchange_weak(
                            head,
                            head.wrapping_add(take),
                            Ordering::Relaxed,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        n = take;
                        break;
                    }
                }
            }
        }

        for (i, item) in items.drain(..n).enumerate() {
            let slot = &self.buf[head.wrapping_add(i) & self.mask];
            unsafe { (*slot.get()).write(item) };
        }

        // Publish in reservation order; MP producers wait their turn.
        while self.prod_tail.load(Ordering::Acquire) != head {
            std::hint::spin_loop();
        }
        let new_tail = head.wrapping_add(n);
        self.prod_tail.store(new_tail, Ordering::Release);

        let occ = new_tail.wrapping_sub(self.cons_tail.load(Ordering::Acquire));
        Enqueued {
            moved: n,
            watermark: occ >= self.watermark && occ - n < self.watermark,
        }
    }

    #[inline]
    pub fn enqueue(&self, item: T) -> Result<Enqueued, T> {
        let mut v = vec![item];
        let e = self.enqueue_burst(&mut v);
        if e.moved == 1 {
            Ok(e)
        } else {
            Err(v.pop().unwrap())
        }
    }

    /// Dequeue up to `max` items into `out`. Single consumer only; callers
    /// are the owning worker thread by construction.
    pub fn dequeue_burst(&self, out: &mut Vec<T>, max: usize) -> usize {
        let head = self.cons_tail.load(Ordering::Relaxed);
        let avail = self.prod_tail.load(Ordering::Acquire).wrapping_sub(head);
        let n = avail.min(max);
        if n == 0 {
            return 0;
        }
        out.reserve(n);
        for i in 0..n {
            let slot = &self.buf[head.wrapping_add(i) & self.mask];
            out.push(unsafe { (*slot.get()).assume_init_read() });
        }
        self.cons_tail.store(head.wrapping_add(n), Ordering::Release);
        n
    }

    #[inline]
    pub fn dequeue(&self) -> Option<T> {
        let head = self.cons_tail.load(Ordering::Relaxed);
        if self.prod_tail.load(Ordering::Acquire) == head {
            return None;
        }
        let slot = &self.buf[head & self.mask];
        let item = unsafe { (*slot.get()).assume_init_read() };
        self.cons_tail.store(head.wrapping_add(1), Ordering::Release);
        Some(item)
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        // Drain remaining initialized slots so owned items are not leaked.
        while self.dequeue().is_some() {}
    }
}

// ============================================================================
// WAKEUPS — one WorkerWake per worker thread, one Notifier per ring pairing
// ============================================================================

/// The parked-thread side of the wakeup mechanism. Each worker owns exactly
/// one WorkerWake and registers its thread handle before entering its loop.
pub struct WorkerWake {
    seq: AtomicU64,
    thread: OnceLock<Thread>,
}

impl WorkerWake {
    pub fn new() -> Arc<Self> {
        Arc::new(WorkerWake { seq: AtomicU64::new(0), thread: OnceLock::new() })
    }

    /// Called once by the owning worker thread before its first wait.
    pub fn register(&self) {
        let _ = self.thread.set(std::thread::current());
    }

    #[inline(always)]
    pub fn snapshot(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Park until a signal arrives or the timeout elapses. Returns the new
    /// sequence snapshot. Spurious wakeups are allowed; callers re-drain.
    pub fn wait(&self, seen: u64, timeout: Duration) -> u64 {
        let cur = self.seq.load(Ordering::Acquire);
        if cur != seen {
            return cur;
        }
        std::thread::park_timeout(timeout);
        self.seq.load(Ordering::Acquire)
    }

    /// Bump the sequence and unpark the worker. Notifiers use this on their
    /// arming edge; the supervisor uses it directly for the terminate
    /// broadcast.
    #[inline]
    pub fn kick(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        if let Some(t) = self.thread.get() {
            t.unpark();
        }
    }
}

struct NotifierInner {
    armed: AtomicBool,
    wake: Arc<WorkerWake>,
}

/// One-shot edge-triggered notifier paired with a ring. Producer half calls
/// `signal()`; consumer half calls `clear()` at the top of each drain.
#[derive(Clone)]
pub struct Notifier(Arc<NotifierInner>);

impl Notifier {
    pub fn new(wake: Arc<WorkerWake>) -> Self {
        Notifier(Arc::new(NotifierInner { armed: AtomicBool::new(false), wake }))
    }

    /// Producer side, after a non-empty enqueue. Only the arming edge pays
    /// for the unpark; repeated signals on an armed notifier are one load.
    #[inline]
    pub fn signal(&self) {
        if !self.0.armed.swap(true, Ordering::AcqRel) {
            self.0.wake.kick();
        }
    }

    /// Consumer side. Must precede the final emptiness check before parking.
    #[inline]
    pub fn clear(&self) {
        self.0.armed.store(false, Ordering::Release);
    }
}
