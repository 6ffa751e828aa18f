use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of the current wall-clock instant.
///
/// Anything that resolves "now" (quick time ranges, record keys) takes an
/// `Arc<dyn Clock>` so tests can pin and advance time deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;

    /// Milliseconds since the Unix epoch. Instants before the epoch are
    /// reported as negative values.
    fn epoch_millis(&self) -> i64 {
        match self.now().duration_since(UNIX_EPOCH) {
            Ok(since) => since.as_millis() as i64,
            Err(before) => -(before.duration().as_millis() as i64),
        }
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to. Millisecond resolution.
#[derive(Debug, Default)]
pub struct MockClock {
    millis: AtomicI64,
}

impl Clock for MockClock {
    fn now(&self) -> SystemTime {
        let millis = self.millis.load(Ordering::SeqCst);
        if millis >= 0 {
            UNIX_EPOCH + Duration::from_millis(millis as u64)
        } else {
            UNIX_EPOCH - Duration::from_millis(millis.unsigned_abs())
        }
    }

    fn epoch_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

impl MockClock {
    pub fn with_millis(millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(millis),
        }
    }

    pub fn at(time: SystemTime) -> Self {
        let clock = Self::default();
        clock.set_time(time);
        clock
    }

    pub fn advance(&self, duration: Duration) {
        self.millis
            .fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set_millis(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn set_time(&self, time: SystemTime) {
        let millis = match time.duration_since(UNIX_EPOCH) {
            Ok(since) => since.as_millis() as i64,
            Err(before) => -(before.duration().as_millis() as i64),
        };
        self.set_millis(millis);
    }
}
