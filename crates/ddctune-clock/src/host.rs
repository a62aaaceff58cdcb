use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Time source behind the sleep clock.
///
/// `now` is monotonic and only meaningful relative to other `now` calls on
/// the same clock. `epoch_seconds` is wall-clock time, used solely to stamp
/// successful-invocation records so persisted history can be aged.
pub trait HostClock: Send + Sync {
    fn now(&self) -> Duration;

    fn sleep(&self, duration: Duration);

    fn epoch_seconds(&self) -> u64;
}

/// Production clock: `Instant` for monotonic time, `thread::sleep` for
/// suspension.
pub struct RealHostClock {
    origin: Instant,
}

impl RealHostClock {
    pub fn new() -> Self {
        RealHostClock {
            origin: Instant::now(),
        }
    }
}

impl Default for RealHostClock {
    fn default() -> Self {
        RealHostClock::new()
    }
}

impl HostClock for RealHostClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn epoch_seconds(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct FakeState {
    now_ns: u64,
    epoch_seconds: u64,
    requested_sleeps: Vec<Duration>,
}

/// Manually advanced clock for tests. `sleep` advances time by exactly the
/// requested duration and records the request.
pub struct FakeHostClock {
    state: Mutex<FakeState>,
}

impl FakeHostClock {
    pub fn new(start_ns: u64) -> Self {
        FakeHostClock {
            state: Mutex::new(FakeState {
                now_ns: start_ns,
                ..FakeState::default()
            }),
        }
    }

    pub fn advance_ns(&self, ns: u64) {
        self.state.lock().unwrap().now_ns += ns;
    }

    pub fn set_ns(&self, ns: u64) {
        self.state.lock().unwrap().now_ns = ns;
    }

    pub fn set_epoch_seconds(&self, secs: u64) {
        self.state.lock().unwrap().epoch_seconds = secs;
    }

    pub fn requested_sleeps(&self) -> Vec<Duration> {
        self.state.lock().unwrap().requested_sleeps.clone()
    }
}

impl HostClock for FakeHostClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.state.lock().unwrap().now_ns)
    }

    fn sleep(&self, duration: Duration) {
        let mut state = self.state.lock().unwrap();
        state.now_ns += duration.as_nanos() as u64;
        state.requested_sleeps.push(duration);
    }

    fn epoch_seconds(&self) -> u64 {
        self.state.lock().unwrap().epoch_seconds
    }
}
