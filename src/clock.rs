//! An injected clock seam, so duration/classification math (§8, timing
//! sensitive) can be driven deterministically in tests instead of racing
//! `Utc::now()`. Async timers (debounce, grace, flush, sweep) still use real
//! `tokio::time` and are tested with `tokio::time::pause`/`advance`; this
//! clock is for the pure arithmetic paths.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A manually-advanceable clock for unit tests that assert on exact
/// durations (e.g. "at t=192 the grace timer fires").
#[derive(Debug)]
pub struct TestClock {
    epoch_millis: AtomicI64,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            epoch_millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        self.epoch_millis
            .fetch_add(duration.num_milliseconds(), Ordering::SeqCst);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.epoch_millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.epoch_millis.load(Ordering::SeqCst))
            .expect("valid timestamp")
    }
}
