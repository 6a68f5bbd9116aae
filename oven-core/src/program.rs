//! Program data model: per-zone power/duration steps and the cook plan
//! extracted from them.
//!
//! A program is a fixed grid of [`ZONE_COUNT`] zones with [`PHASE_COUNT`]
//! steps each. The grid is what gets persisted and edited; a [`CookPlan`]
//! is the runnable subset handed to the sequence manager when a cook starts.

use core::fmt::{self, Write as _};
use core::time::Duration;

use heapless::{String, Vec};
use serde::{Deserialize, Serialize};

/// Number of physical heating zones.
pub const ZONE_COUNT: usize = 8;
/// Number of steps (phases) stored for every zone.
pub const PHASE_COUNT: usize = 4;
/// Upper bound on a zone name (`Zone1`..`Zone8`).
pub const ZONE_NAME_CAPACITY: usize = 8;
/// Largest power percentage accepted by the controller.
pub const MAX_POWER: u8 = 100;

/// Identifier for a physical zone, numbered `1..=ZONE_COUNT`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ZoneId(u8);

impl ZoneId {
    /// Builds a zone from its one-based number.
    #[must_use]
    pub const fn new(number: u8) -> Option<Self> {
        if number >= 1 && number as usize <= ZONE_COUNT {
            Some(Self(number))
        } else {
            None
        }
    }

    /// Builds a zone from its zero-based index.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_index(index: usize) -> Option<Self> {
        if index < ZONE_COUNT {
            Some(Self(index as u8 + 1))
        } else {
            None
        }
    }

    /// One-based zone number as it appears on the wire.
    #[must_use]
    pub const fn number(self) -> u8 {
        self.0
    }

    /// Zero-based index into a [`SequenceCollection`].
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize - 1
    }

    /// Iterates every zone in wire order.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..ZONE_COUNT).filter_map(Self::from_index)
    }

    /// Parses a `ZoneN` name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let digits = name.strip_prefix("Zone")?;
        digits.parse::<u8>().ok().and_then(Self::new)
    }

    /// Canonical `ZoneN` name.
    #[must_use]
    pub fn name(self) -> String<ZONE_NAME_CAPACITY> {
        let mut name = String::new();
        // "Zone" plus a single digit always fits.
        let _ = write!(name, "{self}");
        name
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Zone{}", self.0)
    }
}

/// One phase of a zone: hold `power` percent for `duration` seconds.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub power: u8,
    pub duration: f32,
}

impl Step {
    pub const ZERO: Self = Self::new(0, 0.0);

    #[must_use]
    pub const fn new(power: u8, duration: f32) -> Self {
        Self { power, duration }
    }

    /// Returns the hold time, or `None` when the stored duration is not a
    /// finite non-negative number of seconds.
    #[must_use]
    pub fn hold_duration(&self) -> Option<Duration> {
        Duration::try_from_secs_f32(self.duration).ok()
    }

    /// Returns `true` when the step would energize the zone for some time.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.power > 0 && self.hold_duration().is_some_and(|d| !d.is_zero())
    }
}

/// Stored steps for a single zone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZoneSequence {
    pub name: String<ZONE_NAME_CAPACITY>,
    pub index: u8,
    pub steps: [Step; PHASE_COUNT],
}

impl ZoneSequence {
    /// Zone with every step zeroed.
    #[must_use]
    pub fn zeroed(zone: ZoneId) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let index = zone.index() as u8;
        Self {
            name: zone.name(),
            index,
            steps: [Step::ZERO; PHASE_COUNT],
        }
    }

    /// Zone this sequence belongs to, derived from its index.
    #[must_use]
    pub fn zone(&self) -> Option<ZoneId> {
        ZoneId::from_index(usize::from(self.index))
    }

    /// Sum of every stored step duration, including idle steps.
    #[must_use]
    pub fn total_duration(&self) -> Duration {
        self.steps
            .iter()
            .filter_map(Step::hold_duration)
            .fold(Duration::ZERO, |acc, d| acc.saturating_add(d))
    }

    fn validate(&self) -> Result<ZoneId, ProgramError> {
        let zone = self
            .zone()
            .ok_or(ProgramError::ZoneIndexOutOfRange(self.index))?;
        if ZoneId::from_name(&self.name) != Some(zone) {
            return Err(ProgramError::NameMismatch { zone });
        }
        for (phase, step) in self.steps.iter().enumerate() {
            if step.power > MAX_POWER {
                return Err(ProgramError::PowerOutOfRange {
                    zone,
                    phase,
                    power: step.power,
                });
            }
            if step.hold_duration().is_none() {
                return Err(ProgramError::InvalidDuration { zone, phase });
            }
        }
        Ok(zone)
    }
}

/// Errors raised while editing or hydrating a program.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ProgramError {
    ZoneIndexOutOfRange(u8),
    PhaseOutOfRange(usize),
    NameMismatch { zone: ZoneId },
    PowerOutOfRange { zone: ZoneId, phase: usize, power: u8 },
    InvalidDuration { zone: ZoneId, phase: usize },
    DuplicateZone(ZoneId),
}

impl fmt::Display for ProgramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramError::ZoneIndexOutOfRange(index) => {
                write!(f, "zone index {index} is outside 0..{ZONE_COUNT}")
            }
            ProgramError::PhaseOutOfRange(phase) => {
                write!(f, "phase {phase} is outside 0..{PHASE_COUNT}")
            }
            ProgramError::NameMismatch { zone } => {
                write!(f, "name does not match index for {zone}")
            }
            ProgramError::PowerOutOfRange { zone, phase, power } => {
                write!(f, "{zone} phase {phase}: power {power} exceeds {MAX_POWER}")
            }
            ProgramError::InvalidDuration { zone, phase } => {
                write!(f, "{zone} phase {phase}: duration must be finite and >= 0")
            }
            ProgramError::DuplicateZone(zone) => write!(f, "{zone} appears twice"),
        }
    }
}

/// The current program: one [`ZoneSequence`] per physical zone, in order.
///
/// Always holds exactly [`ZONE_COUNT`] zones; deserialization goes through
/// [`SequenceCollection::hydrate`] so partial or malformed files are either
/// normalized or rejected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredCollection")]
pub struct SequenceCollection {
    zone_sequences: Vec<ZoneSequence, ZONE_COUNT>,
}

#[derive(Deserialize)]
struct StoredCollection {
    zone_sequences: Vec<ZoneSequence, ZONE_COUNT>,
}

impl TryFrom<StoredCollection> for SequenceCollection {
    type Error = ProgramError;

    fn try_from(stored: StoredCollection) -> Result<Self, Self::Error> {
        let mut collection = Self::zeroed();
        collection.hydrate(&stored.zone_sequences)?;
        Ok(collection)
    }
}

impl Default for SequenceCollection {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl SequenceCollection {
    /// Program with all eight zones present and every step zeroed.
    #[must_use]
    pub fn zeroed() -> Self {
        let mut zone_sequences = Vec::new();
        for zone in ZoneId::all() {
            // Capacity equals ZONE_COUNT.
            let _ = zone_sequences.push(ZoneSequence::zeroed(zone));
        }
        Self { zone_sequences }
    }

    /// Zones in wire order.
    #[must_use]
    pub fn zone_sequences(&self) -> &[ZoneSequence] {
        &self.zone_sequences
    }

    #[must_use]
    pub fn zone(&self, zone: ZoneId) -> &ZoneSequence {
        &self.zone_sequences[zone.index()]
    }

    /// Looks up a zone by its `ZoneN` name.
    #[must_use]
    pub fn zone_by_name(&self, name: &str) -> Option<&ZoneSequence> {
        ZoneId::from_name(name).map(|zone| self.zone(zone))
    }

    /// Returns the stored step for `zone` at `phase`.
    pub fn step(&self, zone: ZoneId, phase: usize) -> Result<Step, ProgramError> {
        self.zone(zone)
            .steps
            .get(phase)
            .copied()
            .ok_or(ProgramError::PhaseOutOfRange(phase))
    }

    /// Replaces a single step after validating it.
    pub fn set_step(&mut self, zone: ZoneId, phase: usize, step: Step) -> Result<(), ProgramError> {
        if step.power > MAX_POWER {
            return Err(ProgramError::PowerOutOfRange {
                zone,
                phase,
                power: step.power,
            });
        }
        if step.hold_duration().is_none() {
            return Err(ProgramError::InvalidDuration { zone, phase });
        }
        let slot = self.zone_sequences[zone.index()]
            .steps
            .get_mut(phase)
            .ok_or(ProgramError::PhaseOutOfRange(phase))?;
        *slot = step;
        Ok(())
    }

    /// Overwrites this program in place from loaded zone data.
    ///
    /// Zones missing from `zones` are zeroed. On error the program is left
    /// untouched.
    pub fn hydrate(&mut self, zones: &[ZoneSequence]) -> Result<(), ProgramError> {
        let mut next = Self::zeroed();
        let mut seen = [false; ZONE_COUNT];
        for sequence in zones {
            let zone = sequence.validate()?;
            if core::mem::replace(&mut seen[zone.index()], true) {
                return Err(ProgramError::DuplicateZone(zone));
            }
            next.zone_sequences[zone.index()] = sequence.clone();
        }
        *self = next;
        Ok(())
    }

    /// Zones run in parallel, so the program lasts as long as its longest zone.
    #[must_use]
    pub fn total_duration(&self) -> Duration {
        self.zone_sequences
            .iter()
            .map(ZoneSequence::total_duration)
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// Extracts the runnable plan: inactive steps are dropped and zones left
    /// without steps do not take part in the cook.
    #[must_use]
    pub fn plan(&self) -> CookPlan {
        let mut plan = CookPlan::default();
        for sequence in &self.zone_sequences {
            let Some(zone) = sequence.zone() else {
                continue;
            };
            let mut steps = Vec::new();
            for step in sequence.steps.iter().filter(|step| step.is_active()) {
                if let Some(duration) = step.hold_duration() {
                    let _ = steps.push(PlanStep {
                        power: step.power.min(MAX_POWER),
                        duration,
                    });
                }
            }
            if !steps.is_empty() {
                let _ = plan.zones.push(ZonePlan { zone, steps });
            }
        }
        plan
    }
}

/// Step as executed by a runner.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PlanStep {
    pub power: u8,
    pub duration: Duration,
}

/// Runnable steps for one zone.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ZonePlan {
    pub zone: ZoneId,
    pub steps: Vec<PlanStep, PHASE_COUNT>,
}

impl ZonePlan {
    /// Builds a plan from explicit steps; `None` when more than
    /// [`PHASE_COUNT`] are given.
    #[must_use]
    pub fn new(zone: ZoneId, steps: &[PlanStep]) -> Option<Self> {
        Vec::from_slice(steps)
            .ok()
            .map(|steps| Self { zone, steps })
    }

    #[must_use]
    pub fn total_duration(&self) -> Duration {
        self.steps
            .iter()
            .fold(Duration::ZERO, |acc, step| acc.saturating_add(step.duration))
    }
}

/// Zones that take part in one cook cycle.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CookPlan {
    pub zones: Vec<ZonePlan, ZONE_COUNT>,
}

impl CookPlan {
    /// Every zone held at `power` for `duration`, as used by manual cooking.
    #[must_use]
    pub fn uniform(power: u8, duration: Duration) -> Self {
        let mut plan = Self::default();
        if power == 0 || duration.is_zero() {
            return plan;
        }
        for zone in ZoneId::all() {
            let mut steps = Vec::new();
            let _ = steps.push(PlanStep {
                power: power.min(MAX_POWER),
                duration,
            });
            let _ = plan.zones.push(ZonePlan { zone, steps });
        }
        plan
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Length of the longest zone.
    #[must_use]
    pub fn total_duration(&self) -> Duration {
        self.zones
            .iter()
            .map(ZonePlan::total_duration)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

/// Applies a power scale to a target percentage.
///
/// The scale is clamped to `[0, 1]` and the result rounded half away from
/// zero.
#[must_use]
pub fn scale_power(target: u8, scale: f32) -> u8 {
    let scale = if scale.is_nan() {
        0.0
    } else {
        scale.clamp(0.0, 1.0)
    };
    let scaled = f32::from(target) * scale + 0.5;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let rounded = scaled as u8;
    rounded.min(MAX_POWER)
}

/// Formats a program length for display: `MM:SS` below an hour, `H:MM` above.
#[must_use]
pub fn format_total_time(total: Duration) -> String<16> {
    let mut secs = total.as_secs();
    if total.subsec_millis() >= 500 {
        secs += 1;
    }
    let mut out = String::new();
    let _ = if secs >= 3600 {
        write!(out, "{}:{:02}", secs / 3600, (secs % 3600) / 60)
    } else {
        write!(out, "{:02}:{:02}", secs / 60, secs % 60)
    };
    out
}
