//! Over-temperature hysteresis driven by thermistor readings.
//!
//! The controller reports two thermistor resistances; lower resistance means
//! hotter. The monitor enters alarm as soon as either reading drops below the
//! alarm level and only leaves it once both readings have recovered past the
//! level plus the hysteresis band. Only edges are reported so callers issue a
//! single throttle command per transition.

/// Alarm thresholds and the throttle applied while in alarm.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct OverTempConfig {
    pub alarm_level: i32,
    pub hysteresis: i32,
    /// Power scale in `[0, 1]` applied while the alarm is active.
    pub throttle: f32,
}

impl OverTempConfig {
    pub const DEFAULT_ALARM_LEVEL: i32 = 1500;
    pub const DEFAULT_HYSTERESIS: i32 = 400;
    pub const DEFAULT_THROTTLE: f32 = 0.75;

    #[must_use]
    pub const fn new(alarm_level: i32, hysteresis: i32, throttle: f32) -> Self {
        Self {
            alarm_level,
            hysteresis,
            throttle,
        }
    }

    /// Reading both thermistors must exceed before the alarm clears.
    #[must_use]
    pub const fn clear_level(&self) -> i32 {
        self.alarm_level.saturating_add(self.hysteresis)
    }

    /// Scale to apply for the given alarm state.
    #[must_use]
    pub fn scale_for(&self, in_alarm: bool) -> f32 {
        if in_alarm {
            self.throttle.clamp(0.0, 1.0)
        } else {
            1.0
        }
    }
}

impl Default for OverTempConfig {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_ALARM_LEVEL,
            Self::DEFAULT_HYSTERESIS,
            Self::DEFAULT_THROTTLE,
        )
    }
}

/// Result of feeding one reading into the monitor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AlarmTransition {
    /// First reading of the session; the indicator should be initialized.
    Initialized,
    /// Alarm state did not change.
    Unchanged,
    Entered,
    Cleared,
}

/// Edge-triggered over-temperature state for one cook session.
#[derive(Clone, Debug)]
pub struct OverTempMonitor {
    config: OverTempConfig,
    in_alarm: Option<bool>,
}

impl OverTempMonitor {
    #[must_use]
    pub const fn new(config: OverTempConfig) -> Self {
        Self {
            config,
            in_alarm: None,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &OverTempConfig {
        &self.config
    }

    /// Returns `None` until the first reading of the session.
    #[must_use]
    pub const fn in_alarm(&self) -> Option<bool> {
        self.in_alarm
    }

    /// Forgets the alarm state; called whenever a new cook begins.
    pub fn reset(&mut self) {
        self.in_alarm = None;
    }

    /// Evaluates one `R=r1,r2` reading.
    pub fn observe(&mut self, r1: i32, r2: i32) -> AlarmTransition {
        let Some(previous) = self.in_alarm else {
            self.in_alarm = Some(false);
            return AlarmTransition::Initialized;
        };

        let level = self.config.alarm_level;
        let clear = self.config.clear_level();
        let now = if previous {
            !(r1 > clear && r2 > clear)
        } else {
            r1 < level || r2 < level
        };
        self.in_alarm = Some(now);

        match (previous, now) {
            (false, true) => AlarmTransition::Entered,
            (true, false) => AlarmTransition::Cleared,
            _ => AlarmTransition::Unchanged,
        }
    }
}

/// Percentage shown on the power indicator for a base power and scale.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn indicator_percent(base_power: u8, scale: f32) -> u8 {
    (f32::from(base_power) * scale.clamp(0.0, 1.0)) as u8
}
