// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock interface and implementations for testability.
//!
//! Every timing-sensitive piece of the core (reconnect backoff, the
//! liveness watchdog, post-roll close-out, ONVIF subscription expiry) goes
//! through a `Clocks` implementation rather than calling
//! `std::time`/`std::thread::sleep` directly, so tests can run years of
//! simulated wall-clock time in milliseconds.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// Abstract interface to the system clocks.
pub trait Clocks: Send + Sync + 'static {
    /// Current wall-clock time.
    fn realtime(&self) -> jiff::Timestamp;

    /// Current monotonic time, as seconds+nanos since an arbitrary epoch.
    /// Never goes backwards.
    fn monotonic(&self) -> Instant;

    /// Sleeps the current thread for `how_long`, or advances a simulated
    /// clock by the same amount without actually blocking.
    fn sleep(&self, how_long: Duration);
}

/// A monotonic timestamp. Like `std::time::Instant`, but comparable across
/// `SimulatedClocks` runs, which a real `Instant` is not (it is tied to a
/// real OS clock).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct Instant(pub Duration);

impl Instant {
    pub const ZERO: Instant = Instant(Duration::ZERO);

    pub fn checked_duration_since(self, earlier: Instant) -> Option<Duration> {
        self.0.checked_sub(earlier.0)
    }

    pub fn duration_since(self, earlier: Instant) -> Duration {
        self.checked_duration_since(earlier).unwrap_or_default()
    }

    pub fn checked_add(self, d: Duration) -> Option<Instant> {
        self.0.checked_add(d).map(Instant)
    }
}

impl std::ops::Add<Duration> for Instant {
    type Output = Instant;
    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0 + rhs)
    }
}

impl std::ops::Sub<Duration> for Instant {
    type Output = Instant;
    fn sub(self, rhs: Duration) -> Instant {
        Instant(self.0.saturating_sub(rhs))
    }
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks {}

impl Clocks for RealClocks {
    fn realtime(&self) -> jiff::Timestamp {
        jiff::Timestamp::now()
    }

    fn monotonic(&self) -> Instant {
        // CLOCK_BOOTTIME includes suspended time, which matters for a
        // device that may sleep with a camera left connected.
        #[cfg(target_os = "linux")]
        let clock = libc::CLOCK_BOOTTIME;
        #[cfg(not(target_os = "linux"))]
        let clock = libc::CLOCK_MONOTONIC;
        let ts = unsafe {
            let mut ts = std::mem::MaybeUninit::uninit();
            assert_eq!(0, libc::clock_gettime(clock, ts.as_mut_ptr()));
            ts.assume_init()
        };
        Instant(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
    }

    fn sleep(&self, how_long: Duration) {
        std::thread::sleep(how_long);
    }
}

/// Logs a warning if the guard lives "too long" (a blocking call is taking
/// much longer than expected), using a lazily-computed label.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start: Instant,
}

impl<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> TimerGuard<'a, C, S, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        TimerGuard {
            clocks,
            label_f: Some(label_f),
            start: clocks.monotonic(),
        }
    }
}

impl<'a, C, S, F> Drop for TimerGuard<'a, C, S, F>
where
    C: Clocks + ?Sized,
    S: AsRef<str>,
    F: FnOnce() -> S + 'a,
{
    fn drop(&mut self) {
        let elapsed = self.clocks.monotonic().duration_since(self.start);
        if elapsed >= Duration::from_secs(1) {
            let label_f = self.label_f.take().unwrap();
            warn!(?elapsed, "{} took a long time", label_f().as_ref());
        }
    }
}

/// Simulated clock for deterministic tests of backoff/watchdog timing.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<Inner>);

struct Inner {
    boot: jiff::Timestamp,
    uptime: Mutex<Duration>,
}

impl SimulatedClocks {
    pub fn new(boot: jiff::Timestamp) -> Self {
        SimulatedClocks(Arc::new(Inner {
            boot,
            uptime: Mutex::new(Duration::ZERO),
        }))
    }
}

impl Clocks for SimulatedClocks {
    fn realtime(&self) -> jiff::Timestamp {
        let uptime = *self.0.uptime.lock().unwrap();
        self.0
            .boot
            .checked_add(jiff::SignedDuration::from(uptime))
            .expect("simulated time should stay in range")
    }

    fn monotonic(&self) -> Instant {
        Instant(*self.0.uptime.lock().unwrap())
    }

    /// Advances the clock by `how_long` without actually sleeping.
    fn sleep(&self, how_long: Duration) {
        let mut l = self.0.uptime.lock().unwrap();
        *l += how_long;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_clock_advances_on_sleep() {
        let c = SimulatedClocks::new(jiff::Timestamp::from_second(1_700_000_000).unwrap());
        let t0 = c.monotonic();
        c.sleep(Duration::from_secs(5));
        assert_eq!(c.monotonic().duration_since(t0), Duration::from_secs(5));
    }
}
