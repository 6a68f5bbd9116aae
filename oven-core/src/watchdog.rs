//! Communication watchdog for the controller link.
//!
//! The deadline starts out at `start + startup_grace + timeout` and is pushed
//! to `now + timeout` every time qualifying traffic arrives. Expiry is
//! reported once; the watchdog stays tripped until traffic is seen again.

use core::time::Duration;

use crate::time::MonotonicInstant;

/// Timeout settings for the link watchdog.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WatchdogConfig {
    pub timeout: Duration,
    pub startup_grace: Duration,
}

impl WatchdogConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);
    pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(2000);

    #[must_use]
    pub const fn new(timeout: Duration, startup_grace: Duration) -> Self {
        Self {
            timeout,
            startup_grace,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TIMEOUT, Self::DEFAULT_STARTUP_GRACE)
    }
}

/// What a [`LinkWatchdog::poll`] observed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WatchdogStatus {
    Healthy,
    /// The deadline passed during this poll.
    Expired,
    /// The deadline passed during an earlier poll and no traffic arrived since.
    Tripped,
}

/// Deadline tracker for link traffic.
#[derive(Clone, Debug)]
pub struct LinkWatchdog<TInstant> {
    config: WatchdogConfig,
    deadline: TInstant,
    last_kick: Option<TInstant>,
    tripped: bool,
}

impl<TInstant> LinkWatchdog<TInstant>
where
    TInstant: MonotonicInstant,
{
    /// Arms the watchdog at `start`, allowing the startup grace on top of the
    /// regular timeout.
    #[must_use]
    pub fn new(config: WatchdogConfig, start: TInstant) -> Self {
        Self {
            config,
            deadline: start + config.startup_grace + config.timeout,
            last_kick: None,
            tripped: false,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Instant after which the link is considered lost.
    #[must_use]
    pub const fn deadline(&self) -> TInstant {
        self.deadline
    }

    #[must_use]
    pub const fn is_tripped(&self) -> bool {
        self.tripped
    }

    /// Records qualifying traffic. Returns the gap since the previous kick.
    pub fn kick(&mut self, now: TInstant) -> Option<Duration> {
        let gap = self
            .last_kick
            .map(|previous| now.saturating_duration_since(previous));
        self.last_kick = Some(now);
        self.deadline = now + self.config.timeout;
        self.tripped = false;
        gap
    }

    /// Checks the deadline at `now`.
    pub fn poll(&mut self, now: TInstant) -> WatchdogStatus {
        if self.tripped {
            return WatchdogStatus::Tripped;
        }
        if now >= self.deadline {
            self.tripped = true;
            WatchdogStatus::Expired
        } else {
            WatchdogStatus::Healthy
        }
    }

    /// Time left before expiry, zero once the deadline has passed.
    #[must_use]
    pub fn remaining(&self, now: TInstant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }
}
