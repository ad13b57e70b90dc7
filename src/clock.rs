//! Clock and time types for voucher expiration.
//!
//! This module provides:
//! - [`ClockTime`]: A nanosecond timestamp type (8 bytes, Copy)
//! - [`Clock`]: Trait for time sources
//! - [`SystemClock`]: Monotonic system clock
//! - [`ManualClock`]: Hand-advanced clock for deterministic tests
//! - [`Timer`]: The arm/disarm contract toward an external timer service

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

// ============================================================================
// ClockTime
// ============================================================================

/// Time in nanoseconds (8 bytes, Copy).
///
/// Represents time as nanoseconds since an arbitrary epoch (usually broker
/// start). Voucher deadlines are absolute `ClockTime` values read from the
/// broker's [`Clock`]; an absent deadline is an `Option<ClockTime>`.
///
/// # Examples
///
/// ```rust
/// use depot::clock::ClockTime;
///
/// let deadline = ClockTime::from_secs(60) + ClockTime::from_secs(5);
/// assert_eq!(deadline.secs(), 65);
/// assert_eq!(format!("{deadline}"), "65.000s");
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ClockTime(u64);

impl ClockTime {
    /// Zero time.
    pub const ZERO: Self = Self(0);

    /// Maximum representable time.
    pub const MAX: Self = Self(u64::MAX);

    /// Create from nanoseconds.
    #[inline]
    pub const fn from_nanos(ns: u64) -> Self {
        Self(ns)
    }

    /// Create from seconds.
    #[inline]
    pub const fn from_secs(s: u64) -> Self {
        Self(s.saturating_mul(1_000_000_000))
    }

    /// Get as nanoseconds.
    #[inline]
    pub const fn nanos(self) -> u64 {
        self.0
    }

    /// Get as seconds (truncated).
    #[inline]
    pub const fn secs(self) -> u64 {
        self.0 / 1_000_000_000
    }

    /// Saturating addition.
    #[inline]
    pub const fn saturating_add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    /// Saturating subtraction, flooring at zero.
    #[inline]
    pub const fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl std::ops::Add for ClockTime {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        self.saturating_add(rhs)
    }
}

impl std::ops::AddAssign for ClockTime {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        *self = self.saturating_add(rhs);
    }
}

impl std::ops::Sub for ClockTime {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

impl std::ops::SubAssign for ClockTime {
    #[inline]
    fn sub_assign(&mut self, rhs: Self) {
        *self = self.saturating_sub(rhs);
    }
}

impl From<Duration> for ClockTime {
    #[inline]
    fn from(d: Duration) -> Self {
        Self(d.as_nanos() as u64)
    }
}

impl From<ClockTime> for Duration {
    #[inline]
    fn from(t: ClockTime) -> Self {
        Duration::from_nanos(t.0)
    }
}

impl std::fmt::Display for ClockTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ms = (self.0 / 1_000_000) % 1000;
        write!(f, "{}.{:03}s", self.secs(), ms)
    }
}

// ============================================================================
// Clock Trait
// ============================================================================

/// A clock that provides the current time.
///
/// Implementations should provide monotonic time (never goes backwards).
/// The broker reads it when stamping voucher deadlines and when sweeping
/// the expiration queue.
pub trait Clock: Send + Sync {
    /// Get the current time.
    fn now(&self) -> ClockTime;

    /// Get a human-readable name for the clock.
    fn name(&self) -> &str {
        "unknown"
    }
}

// ============================================================================
// SystemClock
// ============================================================================

/// System monotonic clock.
///
/// Uses `std::time::Instant` for monotonic time measurement.
/// Time is relative to when the clock was created.
pub struct SystemClock {
    epoch: Instant,
    name: String,
}

impl SystemClock {
    /// Create a new system clock with the current instant as epoch.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            name: "system-monotonic".to_string(),
        }
    }

    /// Create a system clock with a custom name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            epoch: Instant::now(),
            name: name.into(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> ClockTime {
        ClockTime::from_nanos(self.epoch.elapsed().as_nanos() as u64)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// ManualClock
// ============================================================================

/// Hand-advanced clock for deterministic tests.
///
/// Never moves on its own; callers advance it explicitly. Shared freely
/// across a test and the broker through an `Arc`.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use depot::clock::{Clock, ClockTime, ManualClock};
///
/// let clock = Arc::new(ManualClock::new(ClockTime::ZERO));
/// clock.advance(ClockTime::from_secs(60));
/// assert_eq!(clock.now().secs(), 60);
/// ```
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a manual clock starting at the given time.
    pub fn new(start: ClockTime) -> Self {
        Self {
            now: AtomicU64::new(start.nanos()),
        }
    }

    /// Move the clock forward by `delta`.
    pub fn advance(&self, delta: ClockTime) {
        self.now.fetch_add(delta.nanos(), Ordering::AcqRel);
    }

    /// Set the clock to an absolute time.
    ///
    /// Callers are expected to keep it monotonic; the clock does not check.
    pub fn set(&self, time: ClockTime) {
        self.now.store(time.nanos(), Ordering::Release);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> ClockTime {
        ClockTime::from_nanos(self.now.load(Ordering::Acquire))
    }

    fn name(&self) -> &str {
        "manual"
    }
}

// ============================================================================
// Timer
// ============================================================================

/// Deadline service for the voucher expiration queue.
///
/// The queue arms exactly one outstanding deadline: the expiration time of
/// its front entry plus the batching delay. Re-arming replaces any previous
/// deadline. Deadlines are absolute times on the broker's [`Clock`]; when
/// one fires, the embedder calls
/// [`Broker::expire_vouchers`](crate::broker::Broker::expire_vouchers).
///
/// Pull-style embeddings can ignore this seam entirely and poll
/// [`Broker::voucher_deadline`](crate::broker::Broker::voucher_deadline)
/// instead.
pub trait Timer: Send {
    /// Arm (or re-arm) the single deadline.
    fn arm(&mut self, deadline: ClockTime);

    /// Cancel any armed deadline.
    fn disarm(&mut self);
}

/// Timer that discards all requests.
///
/// The default for brokers driven by polling rather than callbacks.
#[derive(Debug, Default)]
pub struct NullTimer;

impl Timer for NullTimer {
    fn arm(&mut self, _deadline: ClockTime) {}

    fn disarm(&mut self) {}
}
