//! Timeouts
//!
//! Types for timeout bookkeeping:
//! - [`Timeout`]: a duration that can be zero, positive, or infinite
//! - [`TimeoutTrigger`]: a monotonic deadline that answers "has the wall
//!   time budget elapsed?"

use std::fmt;
use std::time::{Duration, Instant};

use crate::error::Error;

/// A type for storing a timeout duration.
///
/// A timeout can be zero, positive, or infinite. A default-constructed
/// `Timeout` is infinite. Internally, the duration is stored with
/// millisecond precision.
///
/// ```
/// use std::time::Duration;
/// use taskolib::Timeout;
///
/// let a = Timeout::new(Duration::from_secs(60));
/// assert!(a.is_finite());
///
/// let b = Timeout::from_seconds(60.0).unwrap();
/// assert_eq!(a, b);
///
/// let c = Timeout::default();
/// assert!(!c.is_finite());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timeout {
    millis: u64,
}

impl Timeout {
    const INFINITE_MILLIS: u64 = u64::MAX;

    /// An infinite timeout.
    pub const fn infinite() -> Self {
        Self { millis: Self::INFINITE_MILLIS }
    }

    /// Create a timeout from a duration, rounding to milliseconds.
    ///
    /// Durations too large to be represented in milliseconds saturate to an
    /// infinite timeout.
    pub fn new(duration: Duration) -> Self {
        let millis = duration.as_millis()
            + u128::from(duration.subsec_nanos() % 1_000_000 >= 500_000);
        if millis >= u128::from(Self::INFINITE_MILLIS) {
            Self::infinite()
        } else {
            Self { millis: millis as u64 }
        }
    }

    /// Create a timeout from a number of seconds.
    ///
    /// An infinite number of seconds yields an infinite timeout. Negative or
    /// not-a-number inputs are rejected.
    pub fn from_seconds(seconds: f64) -> Result<Self, Error> {
        if seconds.is_nan() {
            return Err(Error::new("Timeout is not-a-number"));
        }
        if seconds < 0.0 {
            return Err(Error::new("Negative timeout"));
        }
        if !seconds.is_finite() {
            return Ok(Self::infinite());
        }

        let millis = (seconds * 1000.0).round();
        if millis >= Self::INFINITE_MILLIS as f64 {
            Ok(Self::infinite())
        } else {
            Ok(Self { millis: millis as u64 })
        }
    }

    /// Determine if the timeout has a finite duration.
    pub fn is_finite(&self) -> bool {
        self.millis != Self::INFINITE_MILLIS
    }

    /// Return the timeout in seconds; infinity for an infinite timeout.
    pub fn seconds(&self) -> f64 {
        if self.is_finite() {
            self.millis as f64 / 1000.0
        } else {
            f64::INFINITY
        }
    }

    /// Return the timeout as a duration; `Duration::MAX` if infinite.
    pub fn as_duration(&self) -> Duration {
        if self.is_finite() {
            Duration::from_millis(self.millis)
        } else {
            Duration::MAX
        }
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Self::infinite()
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Self::new(duration)
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_finite() {
            write!(f, "{} ms", self.millis)
        } else {
            write!(f, "infinite")
        }
    }
}

/// Evaluates when a wall time budget has elapsed.
///
/// ```
/// use std::time::Duration;
/// use taskolib::{Timeout, TimeoutTrigger};
///
/// let mut trigger = TimeoutTrigger::new();
/// trigger.set_timeout(Timeout::new(Duration::from_secs(1)));
/// trigger.reset();
/// assert!(!trigger.is_elapsed());
/// ```
///
/// This type is not thread-safe; each concurrent user gets its own instance.
#[derive(Debug, Clone)]
pub struct TimeoutTrigger {
    timeout: Timeout,
    start: Instant,
}

impl TimeoutTrigger {
    /// Create a trigger with an infinite timeout, started now.
    pub fn new() -> Self {
        Self { timeout: Timeout::infinite(), start: Instant::now() }
    }

    /// Reset the start time to the current time. The timeout duration
    /// remains unchanged.
    pub fn reset(&mut self) -> Instant {
        self.start = Instant::now();
        self.start
    }

    /// Return the timeout duration.
    pub fn timeout(&self) -> Timeout {
        self.timeout
    }

    /// Replace the timeout duration.
    pub fn set_timeout(&mut self, timeout: Timeout) {
        self.timeout = timeout;
    }

    /// Return the start time of the measurement.
    pub fn start_time(&self) -> Instant {
        self.start
    }

    /// Determine if the timeout has elapsed. Always false for an infinite
    /// timeout.
    pub fn is_elapsed(&self) -> bool {
        if !self.timeout.is_finite() {
            return false;
        }
        Instant::now() - self.start > self.timeout.as_duration()
    }

    /// Return the deadline as an instant, or None for an infinite timeout.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        if self.timeout.is_finite() {
            self.start.checked_add(self.timeout.as_duration())
        } else {
            None
        }
    }
}

impl Default for TimeoutTrigger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_timeout_default_is_infinite() {
        assert!(!Timeout::default().is_finite());
        assert!(!Timeout::infinite().is_finite());
        assert_eq!(Timeout::infinite().seconds(), f64::INFINITY);
        assert_eq!(Timeout::infinite().as_duration(), Duration::MAX);
    }

    #[test]
    fn test_timeout_from_duration() {
        let t = Timeout::new(Duration::from_millis(2500));
        assert!(t.is_finite());
        assert_eq!(t.seconds(), 2.5);
        assert_eq!(t.as_duration(), Duration::from_millis(2500));

        // Sub-millisecond durations are rounded
        assert_eq!(
            Timeout::new(Duration::from_micros(1600)),
            Timeout::new(Duration::from_millis(2))
        );
        assert_eq!(Timeout::new(Duration::MAX), Timeout::infinite());
    }

    #[test]
    fn test_timeout_from_seconds() {
        assert_eq!(
            Timeout::from_seconds(0.02).unwrap(),
            Timeout::new(Duration::from_millis(20))
        );
        assert_eq!(Timeout::from_seconds(0.0).unwrap().seconds(), 0.0);
        assert_eq!(Timeout::from_seconds(f64::INFINITY).unwrap(), Timeout::infinite());
        assert!(Timeout::from_seconds(-1.0).is_err());
        assert!(Timeout::from_seconds(f64::NAN).is_err());
    }

    #[test]
    fn test_timeout_ordering() {
        let short = Timeout::new(Duration::from_millis(1));
        let long = Timeout::new(Duration::from_secs(10));
        assert!(short < long);
        assert!(long < Timeout::infinite());
    }

    #[test]
    fn test_timeout_display() {
        assert_eq!(Timeout::new(Duration::from_millis(20)).to_string(), "20 ms");
        assert_eq!(Timeout::infinite().to_string(), "infinite");
    }

    #[test]
    fn test_trigger_infinite_never_elapses() {
        let trigger = TimeoutTrigger::new();
        assert!(!trigger.is_elapsed());
        assert_eq!(trigger.deadline(), None);
    }

    #[test]
    fn test_trigger_elapses() {
        let mut trigger = TimeoutTrigger::new();
        trigger.set_timeout(Timeout::new(Duration::from_millis(5)));
        trigger.reset();
        assert!(!trigger.is_elapsed());
        sleep(Duration::from_millis(10));
        assert!(trigger.is_elapsed());
    }

    #[test]
    fn test_trigger_reset_restarts_measurement() {
        let mut trigger = TimeoutTrigger::new();
        trigger.set_timeout(Timeout::new(Duration::from_millis(20)));
        trigger.reset();
        sleep(Duration::from_millis(5));
        let first_start = trigger.start_time();
        trigger.reset();
        assert!(trigger.start_time() > first_start);
        assert!(!trigger.is_elapsed());
    }
}
