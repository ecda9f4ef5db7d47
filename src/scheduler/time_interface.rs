//! Time sources for the tick loop and dwell timers.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

pub trait TimeInterface: Send + Sync {
    fn now_monotonic(&self) -> Instant;
    fn now_wallclock(&self) -> SystemTime;
}

/// Real clock backed by `Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeInterface for SystemClock {
    fn now_monotonic(&self) -> Instant {
        Instant::now()
    }

    fn now_wallclock(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Manually advanced clock for tests and simulation runs.
///
/// Clones share the same underlying time, so a test can hand one clone to the
/// axis controllers and keep another to step time forward.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualTime>>,
}

#[derive(Debug)]
struct ManualTime {
    monotonic: Instant,
    wallclock: SystemTime,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualTime {
                monotonic: Instant::now(),
                wallclock: SystemTime::now(),
            })),
        }
    }

    pub fn advance(&self, dt: Duration) {
        let mut time = self.lock();
        time.monotonic += dt;
        time.wallclock += dt;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualTime> {
        // A poisoned clock still holds a valid instant.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeInterface for ManualClock {
    fn now_monotonic(&self) -> Instant {
        self.lock().monotonic
    }

    fn now_wallclock(&self) -> SystemTime {
        self.lock().wallclock
    }
}
