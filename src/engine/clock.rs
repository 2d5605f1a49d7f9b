// FLOWLINE — TSC FAST CLOCK
// Arrival timestamps are taken per RX burst, so the hot loop cannot afford
// clock_gettime. The raw cycle counter is calibrated once at boot against
// CLOCK_MONOTONIC into a 32.32 fixed-point ns-per-tick fraction. Two gates
// protect correctness: CPUID must advertise an invariant TSC, and a drift
// sweep after calibration must stay under 1µs. Failing either degrades to
// the vDSO path, never to wrong timestamps.

use std::time::Duration;

use tracing::{debug, warn};

#[inline(always)]
pub fn clock_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// TSC-to-nanosecond calibration. Computed once at boot, immutable after.
/// Conversion: ns = mono_base + ((rdtsc() - tsc_base) * mult) >> shift.
#[derive(Clone, Copy)]
pub struct TscCal {
    tsc_base: u64,
    mono_base: u64,
    mult: u32,
    shift: u32,
    valid: bool,
}

impl TscCal {
    pub fn fallback() -> Self {
        TscCal { tsc_base: 0, mono_base: 0, mult: 0, shift: 0, valid: false }
    }

    #[inline(always)]
    pub fn now_ns(&self) -> u64 {
        if !self.valid {
            return clock_ns();
        }
        let delta = read_tsc().wrapping_sub(self.tsc_base);
        self.mono_base
            .wrapping_add(((delta as u128 * self.mult as u128) >> self.shift) as u64)
    }
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn read_tsc() -> u64 {
    // Unserialized read; out-of-order skew is nanoseconds, irrelevant for
    // per-burst timestamps.
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// ARM generic timer virtual count. Constant-rate, monotonic, unprivileged.
#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn read_tsc() -> u64 {
    let cnt: u64;
    unsafe {
        core::arch::asm!(
            "mrs {cnt}, CNTVCT_EL0",
            cnt = out(reg) cnt,
            options(nostack, nomem, preserves_flags)
        );
    }
    cnt
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
pub fn read_tsc() -> u64 {
    clock_ns()
}

/// CPUID leaf 0x8000_0007, EDX bit 8: the TSC ticks at a constant rate
/// across P-states and deep sleep. Without it no calibration can hold.
#[cfg(target_arch = "x86_64")]
fn invariant_tsc_supported() -> bool {
    let max_ext = unsafe { core::arch::x86_64::__cpuid(0x8000_0000) }.eax;
    if max_ext < 0x8000_0007 {
        return false;
    }
    unsafe { core::arch::x86_64::__cpuid(0x8000_0007) }.edx & (1 << 8) != 0
}

/// The ARM generic timer is architecturally fixed-frequency; other targets
/// read clock_gettime anyway.
#[cfg(not(target_arch = "x86_64"))]
fn invariant_tsc_supported() -> bool {
    true
}

/// Tick and monotonic deltas over one sleep interval.
fn measure_interval(dur: Duration) -> (u64, u64) {
    let t0 = read_tsc();
    let m0 = clock_ns();
    std::thread::sleep(dur);
    (read_tsc().wrapping_sub(t0), clock_ns().saturating_sub(m0))
}

/// Worst observed |converted - kernel| over a sample sweep.
fn worst_drift_ns(cal: &TscCal, samples: u32) -> i64 {
    let mut worst = 0i64;
    for _ in 0..samples {
        let err = (cal.now_ns() as i64 - clock_ns() as i64).abs();
        worst = worst.max(err);
    }
    worst
}

/// One-shot boot calibration. CPUID-gated, then a 100ms two-point measure,
/// then a drift sweep; any failure returns the clock_gettime fallback.
pub fn calibrate_tsc() -> TscCal {
    if !invariant_tsc_supported() {
        warn!("cpu lacks an invariant tsc, timestamps use clock_gettime");
        return TscCal::fallback();
    }

    // Warm the read paths before sampling.
    for _ in 0..100 {
        let _ = (read_tsc(), clock_ns());
    }

    let (ticks, elapsed_ns) = measure_interval(Duration::from_millis(100));
    if ticks == 0 || elapsed_ns == 0 {
        warn!("tsc calibration measured a zero delta, using clock_gettime");
        return TscCal::fallback();
    }

    // ns-per-tick as a 32.32 fixed-point fraction.
    const FP_SHIFT: u32 = 32;
    let mult = ((elapsed_ns as u128) << FP_SHIFT) / ticks as u128;
    if mult > u32::MAX as u128 {
        warn!("tsc too slow for the fixed-point fraction, using clock_gettime");
        return TscCal::fallback();
    }

    let cal = TscCal {
        tsc_base: read_tsc(),
        mono_base: clock_ns(),
        mult: mult as u32,
        shift: FP_SHIFT,
        valid: true,
    };

    let drift = worst_drift_ns(&cal, 1000);
    if drift > 1_000 {
        warn!(drift_ns = drift, "tsc drift above 1µs, using clock_gettime");
        return TscCal::fallback();
    }
    let freq_khz = (ticks as u128) * 1_000_000 / (elapsed_ns as u128);
    debug!(freq_mhz = (freq_khz / 1000) as u64, drift_ns = drift, "tsc calibrated");
    cal
}

#[inline(always)]
pub unsafe fn prefetch_read_l1(addr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    {
        core::arch::x86_64::_mm_prefetch(addr as *const i8, core::arch::x86_64::_MM_HINT_T0);
    }
    #[cfg(target_arch = "aarch64")]
    {
        core::arch::asm!("prfm pldl1keep, [{addr}]", addr = in(reg) addr, options(nostack, preserves_flags));
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = addr;
    }
}
