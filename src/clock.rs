use std::time::{SystemTime, UNIX_EPOCH};

/// Source of timestamps for watchdog deadlines.
///
/// The scheduler only compares deadlines against `now`, so any monotonically
/// reasonable nanosecond clock works. `SystemClock` is the default;
/// `QuantaClock` trades NTP awareness for a much cheaper read.
pub trait Clock: Send + 'static {
    /// Current time in nanoseconds since the UNIX epoch.
    fn now(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before UNIX epoch");
        u64::try_from(elapsed.as_nanos()).expect("system time exceeds timestamp range")
    }
}

/// TSC-backed clock via `quanta`, anchored to wall time at construction.
#[derive(Debug, Clone)]
pub struct QuantaClock {
    clock: quanta::Clock,
    start_wall_ns: u64,
    start_instant: quanta::Instant,
}

impl Default for QuantaClock {
    fn default() -> Self {
        let clock = quanta::Clock::new();
        let start_instant = clock.now();
        let start_wall_ns = SystemClock.now();
        Self {
            clock,
            start_wall_ns,
            start_instant,
        }
    }
}

impl QuantaClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for QuantaClock {
    fn now(&self) -> u64 {
        let delta = self.clock.now().duration_since(self.start_instant);
        self.start_wall_ns + delta.as_nanos() as u64
    }
}
