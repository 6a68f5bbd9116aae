//! Cook countdown with pause support.

use core::time::Duration;

use crate::time::MonotonicInstant;

/// Counts a cook session down from its total duration.
///
/// Paused time does not count against the session.
#[derive(Clone, Debug)]
pub struct Countdown<TInstant> {
    total: Duration,
    started_at: TInstant,
    paused_at: Option<TInstant>,
    paused_for: Duration,
}

impl<TInstant> Countdown<TInstant>
where
    TInstant: MonotonicInstant,
{
    #[must_use]
    pub const fn start(total: Duration, now: TInstant) -> Self {
        Self {
            total,
            started_at: now,
            paused_at: None,
            paused_for: Duration::ZERO,
        }
    }

    #[must_use]
    pub const fn total(&self) -> Duration {
        self.total
    }

    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    /// Active time consumed so far.
    #[must_use]
    pub fn elapsed(&self, now: TInstant) -> Duration {
        let until = self.paused_at.unwrap_or(now);
        until
            .saturating_duration_since(self.started_at)
            .saturating_sub(self.paused_for)
    }

    /// `max(0, total - elapsed)`.
    #[must_use]
    pub fn remaining(&self, now: TInstant) -> Duration {
        self.total.saturating_sub(self.elapsed(now))
    }

    #[must_use]
    pub fn is_finished(&self, now: TInstant) -> bool {
        self.remaining(now).is_zero()
    }

    /// Fraction of the session completed, in `[0, 1]`.
    #[must_use]
    pub fn progress(&self, now: TInstant) -> f32 {
        if self.total.is_zero() {
            return 1.0;
        }
        (self.elapsed(now).as_secs_f32() / self.total.as_secs_f32()).clamp(0.0, 1.0)
    }

    /// Freezes the countdown. No-op when already paused.
    pub fn pause(&mut self, now: TInstant) {
        if self.paused_at.is_none() {
            self.paused_at = Some(now);
        }
    }

    /// Resumes a paused countdown, excluding the paused interval.
    pub fn resume(&mut self, now: TInstant) {
        if let Some(paused_at) = self.paused_at.take() {
            self.paused_for = self
                .paused_for
                .saturating_add(now.saturating_duration_since(paused_at));
        }
    }
}
