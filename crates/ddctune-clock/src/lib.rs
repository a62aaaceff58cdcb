//! The sleep clock: the one place the engine actually spends time.
//!
//! Most of a DDC session's wall-clock time is inter-transaction pauses, so
//! sleeping is treated as a first-class, instrumented operation rather than a
//! bare `thread::sleep`. Every sleep goes through [`SleepClock::sleep`], which
//! records requested vs. actual elapsed time, and the underlying time source
//! is the [`HostClock`] trait so tests can drive timing deterministically.

mod host;

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

pub use host::{FakeHostClock, HostClock, RealHostClock};

/// Why a sleep is happening. Each event kind carries the protocol's base
/// pause for that point in an exchange; the engine scales the base by the
/// user multiplier and the learned step factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepEvent {
    /// Between writing a DDC request and reading its reply.
    WriteToRead,
    /// After a write-only operation, before the bus may be touched again.
    PostWrite,
    /// After reading a reply, before the next exchange.
    PostRead,
    /// After opening a bus device.
    PostOpen,
    /// Between fragments of a multi-part exchange.
    MultiPartSegment,
}

impl SleepEvent {
    /// Protocol base pause in milliseconds, before any scaling.
    pub const fn base_millis(self) -> u64 {
        match self {
            SleepEvent::WriteToRead => 40,
            SleepEvent::PostWrite => 50,
            SleepEvent::PostRead => 20,
            SleepEvent::PostOpen => 100,
            SleepEvent::MultiPartSegment => 50,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            SleepEvent::WriteToRead => "write-to-read",
            SleepEvent::PostWrite => "post-write",
            SleepEvent::PostRead => "post-read",
            SleepEvent::PostOpen => "post-open",
            SleepEvent::MultiPartSegment => "multi-part-segment",
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Copy)]
pub struct SleepOpts {
    /// Record this sleep in the statistics. Diagnostic sleeps turn this off
    /// so they don't distort the numbers reports are built from.
    pub record_stats: bool,
}

impl Default for SleepOpts {
    fn default() -> Self {
        SleepOpts { record_stats: true }
    }
}

impl SleepOpts {
    pub const fn untracked() -> Self {
        SleepOpts {
            record_stats: false,
        }
    }
}

/// Aggregate sleep statistics. All three counters are updated together under
/// one lock so a snapshot is always internally consistent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SleepStats {
    pub total_calls: u64,
    pub requested_millis: u64,
    pub actual_nanos: u64,
}

/// Monotonic sleep primitive plus its statistics.
pub struct SleepClock {
    host: Arc<dyn HostClock>,
    stats: Mutex<SleepStats>,
}

impl SleepClock {
    pub fn new(host: Arc<dyn HostClock>) -> Self {
        SleepClock {
            host,
            stats: Mutex::new(SleepStats::default()),
        }
    }

    /// A clock backed by the real monotonic clock and `thread::sleep`.
    pub fn real() -> Self {
        SleepClock::new(Arc::new(RealHostClock::new()))
    }

    pub fn host(&self) -> &Arc<dyn HostClock> {
        &self.host
    }

    /// Suspend the caller for at least `millis`. A zero duration performs no
    /// suspension but still accrues a call.
    pub fn sleep(&self, millis: u64, opts: SleepOpts, event: SleepEvent) {
        let start = self.host.now();
        if millis > 0 {
            self.host.sleep(Duration::from_millis(millis));
        }
        let elapsed = self.host.now().saturating_sub(start);

        tracing::trace!(
            event = event.name(),
            requested_ms = millis,
            actual_us = elapsed.as_micros() as u64,
            "sleep"
        );

        if opts.record_stats {
            let mut stats = self.stats.lock().expect("sleep stats lock poisoned");
            stats.total_calls += 1;
            stats.requested_millis += millis;
            stats.actual_nanos += elapsed.as_nanos() as u64;
        }
    }

    pub fn stats(&self) -> SleepStats {
        *self.stats.lock().expect("sleep stats lock poisoned")
    }
}
