#![cfg_attr(not(feature = "std"), no_std)]

//! Portable cooking-engine logic shared by the host controller and the
//! device emulator.
//!
//! Everything here is free of threads, clocks and I/O: timing rules are
//! expressed over the [`time::MonotonicInstant`] trait so the same state
//! machines run against `std::time::Instant` on the host and against mock
//! instants in tests.

pub mod countdown;
pub mod overtemp;
pub mod program;
pub mod protocol;
pub mod repl;
pub mod time;
pub mod watchdog;

pub use program::{
    CookPlan, PHASE_COUNT, PlanStep, ProgramError, SequenceCollection, Step, ZONE_COUNT, ZoneId,
    ZonePlan, ZoneSequence,
};
