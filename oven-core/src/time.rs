//! Monotonic time abstraction used by the countdown and watchdog models.

use core::ops::Add;
use core::time::Duration;

/// Monotonic timestamp that supports offsetting and saturating differences.
pub trait MonotonicInstant: Copy + Ord + Add<Duration, Output = Self> {
    /// Returns the saturating duration from `earlier` to `self`.
    fn saturating_duration_since(&self, earlier: Self) -> Duration;
}

#[cfg(feature = "std")]
impl MonotonicInstant for std::time::Instant {
    fn saturating_duration_since(&self, earlier: Self) -> Duration {
        std::time::Instant::saturating_duration_since(self, earlier)
    }
}
