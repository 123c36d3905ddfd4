use parking_lot::Mutex;
use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

/// A trait for wall-clock sources used when deciding whether a credential is
/// due for renewal.
///
/// This abstraction allows you to plug in the real system clock or a mocked
/// time source in tests.
///
/// # Example
///
/// ```
/// use std::time::{Duration, SystemTime};
/// use token_renewer::TimeSource;
///
/// struct FixedTime;
/// impl TimeSource for FixedTime {
///     fn now(&self) -> SystemTime {
///         SystemTime::UNIX_EPOCH + Duration::from_secs(1234)
///     }
/// }
///
/// let time = FixedTime;
/// assert_eq!(time.now(), SystemTime::UNIX_EPOCH + Duration::from_secs(1234));
/// ```
pub trait TimeSource: Send + Sync {
    /// Returns the current wall-clock time.
    fn now(&self) -> SystemTime;
}

impl<T> TimeSource for Arc<T>
where
    T: TimeSource + ?Sized,
{
    fn now(&self) -> SystemTime {
        (**self).now()
    }
}

/// The operating system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub const fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: SystemTime) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}
