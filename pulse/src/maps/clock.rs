//! Monotonic clocks for the host-side tracer

#![allow(unsafe_code)] // clock_gettime() requires unsafe

use std::sync::atomic::{AtomicU64, Ordering};

use pulse_common::MonotonicClock;

/// `CLOCK_MONOTONIC`, the clock `bpf_ktime_get_ns()` reads in the kernel
#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicNow;

impl MonotonicClock for MonotonicNow {
    #[allow(clippy::cast_sign_loss)]
    fn now_ns(&self) -> u64 {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        // SAFETY: ts is a valid, writable timespec
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        if rc != 0 {
            return 0;
        }
        (ts.tv_sec as u64).saturating_mul(1_000_000_000).saturating_add(ts.tv_nsec as u64)
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn starting_at(now_ns: u64) -> Self {
        Self { now: AtomicU64::new(now_ns) }
    }

    pub fn set(&self, now_ns: u64) {
        self.now.store(now_ns, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ns: u64) {
        self.now.fetch_add(delta_ns, Ordering::SeqCst);
    }
}

impl MonotonicClock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_now_never_goes_back() {
        let clock = MonotonicNow;
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::starting_at(1_000);
        clock.advance(500);
        assert_eq!(clock.now_ns(), 1_500);
        clock.set(10);
        assert_eq!(clock.now_ns(), 10);
    }
}
