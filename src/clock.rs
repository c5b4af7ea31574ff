use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Abstracts the loop's monotonic time source so timer scheduling can be
/// driven deterministically in tests without sleeping in real time.
///
/// Wall-clock time (`dateTime_now` in the original terminology) never drives
/// scheduling; it is exposed purely for diagnostics, so it is not part of
/// this trait.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// The production clock: `Instant::now()`, same as every non-test caller of
/// this crate will want.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock double for tests: starts at `Instant::now()` and is advanced
/// explicitly via `advance`. `Instant` has no public constructor other than
/// `now()`, so the double stores an offset and adds it on read rather than
/// faking an `Instant` value directly.
#[derive(Debug, Clone)]
pub struct TestClock {
    base: Instant,
    offset: Duration,
}

impl TestClock {
    pub fn new() -> Self {
        TestClock {
            base: Instant::now(),
            offset: Duration::ZERO,
        }
    }

    pub fn advance(&mut self, by: Duration) {
        self.offset += by;
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base + self.offset
    }
}

/// Local UTC offset in seconds, best-effort. There is no portable way to ask
/// the OS for this without a timezone database dependency; we report zero
/// rather than pulling one in, matching the "best effort" framing of the
/// surrounding timing guarantees.
pub fn local_time_utc_offset() -> i64 {
    0
}

/// Wall-clock time as a Unix timestamp in whole seconds.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
