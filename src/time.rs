//! Simulated time as integer ticks.
//!
//! A [`Time`] is a number of discrete time slots together with an `accuracy`,
//! the number of slots per simulated second. Arithmetic and ordering are only
//! defined between times of equal accuracy; mixing accuracies is a programming
//! error and panics. The process-wide default accuracy is used whenever a time
//! is built without an explicit accuracy.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize};

/// Default number of time slots per second: microsecond resolution.
pub const DEFAULT_ACCURACY: u64 = 1_000_000;

static GLOBAL_ACCURACY: AtomicU64 = AtomicU64::new(DEFAULT_ACCURACY);

/// Current process-wide default accuracy in slots per second.
#[must_use]
pub fn default_accuracy() -> u64 {
    GLOBAL_ACCURACY.load(AtomicOrdering::Relaxed)
}

/// Change the process-wide default accuracy.
///
/// Only call between simulation runs: times of different accuracy do not mix.
pub fn set_default_accuracy(accuracy: u64) {
    assert!(accuracy > 0, "accuracy must be positive");
    GLOBAL_ACCURACY.store(accuracy, AtomicOrdering::Relaxed);
}

/// A point in simulated time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Time {
    ticks: i64,
    accuracy: u64,
}

impl Time {
    /// Time at the given tick count, with the process default accuracy.
    #[must_use]
    pub fn from_ticks(ticks: i64) -> Self {
        Self {
            ticks,
            accuracy: default_accuracy(),
        }
    }

    /// Time at the given tick count and accuracy.
    #[must_use]
    pub fn new(ticks: i64, accuracy: u64) -> Self {
        assert!(accuracy > 0, "accuracy must be positive");
        Self { ticks, accuracy }
    }

    /// Time at the given number of seconds, with the process default accuracy.
    #[must_use]
    pub fn from_sec(sec: f64) -> Self {
        Self::from_sec_accuracy(sec, default_accuracy())
    }

    /// Time at the given number of seconds and accuracy, rounded to the nearest tick.
    #[must_use]
    pub fn from_sec_accuracy(sec: f64, accuracy: u64) -> Self {
        assert!(accuracy > 0, "accuracy must be positive");
        Self {
            ticks: (sec * accuracy as f64).round() as i64,
            accuracy,
        }
    }

    /// Zero time with the process default accuracy.
    #[must_use]
    pub fn zero() -> Self {
        Self::from_ticks(0)
    }

    /// Tick count.
    #[must_use]
    pub fn ticks(&self) -> i64 {
        self.ticks
    }

    /// Ticks per second of this time value.
    #[must_use]
    pub fn accuracy(&self) -> u64 {
        self.accuracy
    }

    /// This time expressed in seconds.
    #[must_use]
    pub fn sec(&self) -> f64 {
        self.ticks as f64 / self.accuracy as f64
    }

    /// This time shifted forward by a duration in seconds (same accuracy).
    #[must_use]
    pub fn add_sec(&self, sec: f64) -> Self {
        *self + Self::from_sec_accuracy(sec, self.accuracy)
    }

    fn check_accuracy(&self, other: &Self) {
        assert_eq!(
            self.accuracy, other.accuracy,
            "cannot combine times of accuracy {} and {}",
            self.accuracy, other.accuracy
        );
    }
}

impl PartialOrd for Time {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Time {
    fn cmp(&self, other: &Self) -> Ordering {
        self.check_accuracy(other);
        self.ticks.cmp(&other.ticks)
    }
}

impl Add for Time {
    type Output = Time;

    fn add(self, rhs: Time) -> Time {
        self.check_accuracy(&rhs);
        Time {
            ticks: self.ticks + rhs.ticks,
            accuracy: self.accuracy,
        }
    }
}

impl Sub for Time {
    type Output = Time;

    fn sub(self, rhs: Time) -> Time {
        self.check_accuracy(&rhs);
        Time {
            ticks: self.ticks - rhs.ticks,
            accuracy: self.accuracy,
        }
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ticks)
    }
}
