//! Monotonic nanosecond clock.
//!
//! Timestamps are `f64` nanoseconds since the start of the second in which the
//! clock was first read, so every thread in the process shares one epoch.

use std::sync::OnceLock;

static EPOCH_SECS: OnceLock<libc::time_t> = OnceLock::new();

fn raw() -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC_RAW is always available on Linux, the call cannot fail
    // with a valid pointer.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts);
    }
    ts
}

/// Pins the epoch. Called once from `main` before any thread starts.
pub fn init() {
    EPOCH_SECS.get_or_init(|| raw().tv_sec);
}

pub fn now() -> f64 {
    let ts = raw();
    let epoch = *EPOCH_SECS.get_or_init(|| ts.tv_sec);
    (ts.tv_sec - epoch) as f64 * 1.0e9 + ts.tv_nsec as f64
}

/// Spins until `now() >= target` and returns the time observed on exit.
/// Never yields the core: send jitter must stay below a microsecond.
pub fn spin_until(target: f64) -> f64 {
    let mut t = now();
    while !deadline_reached(t, target) {
        std::hint::spin_loop();
        t = now();
    }
    t
}

#[inline]
pub fn deadline_reached(now: f64, target: f64) -> bool {
    now >= target
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        init();
        let a = now();
        let b = now();
        assert!(a >= 0.0);
        assert!(b >= a);
    }

    #[test]
    fn spin_until_returns_after_target() {
        let target = now() + 200_000.0;
        let t = spin_until(target);
        assert!(t >= target);
    }
}
