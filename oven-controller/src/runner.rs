//! Per-zone step execution.
//!
//! A [`StepRunner`] drives one zone through its steps on a dedicated thread.
//! Stop and pause are cooperative flags polled every `poll_interval`; the
//! power scale is read from a shared supplier on every poll so global
//! throttling reaches the zone without waiting for a step boundary.
//!
//! Every output for a zone is emitted while holding that runner's state lock,
//! so resends triggered from the controller thread (`resume`, `apply_scale`)
//! never interleave out of order with the runner thread's own sends.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use oven_core::program::scale_power;
use oven_core::{PlanStep, ZoneId, ZonePlan};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::ManagerError;

/// Receives `(zone, scaled power, step duration)`. The duration is the full
/// hold time for a new step and zero for resends and the final off command.
pub type ZoneOutput = Arc<dyn Fn(ZoneId, u8, Duration) + Send + Sync>;

/// Returns the current global power scale.
pub type ScaleSupplier = Arc<dyn Fn() -> f32 + Send + Sync>;

/// Invoked once when the runner thread exits.
pub type DoneCallback = Box<dyn FnOnce(ZoneId) + Send + 'static>;

/// Default polling period of the runner loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle of a runner.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RunnerPhase {
    Idle,
    Running,
    Paused,
    Stopped,
    Complete,
}

impl RunnerPhase {
    /// `true` while the runner thread is executing steps.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, RunnerPhase::Running | RunnerPhase::Paused)
    }
}

struct OutputState {
    phase: RunnerPhase,
    current_target: Option<u8>,
    last_sent: Option<u8>,
    output_cut: bool,
}

struct Shared {
    zone: ZoneId,
    output: ZoneOutput,
    scale: ScaleSupplier,
    poll_interval: Duration,
    stop: AtomicBool,
    paused: AtomicBool,
    cut_on_pause: AtomicBool,
    state: Mutex<OutputState>,
}

impl Shared {
    fn emit(&self, state: &mut OutputState, power: u8, duration: Duration) {
        let output = &self.output;
        let zone = self.zone;
        if panic::catch_unwind(AssertUnwindSafe(|| output(zone, power, duration))).is_err() {
            error!(%zone, power, "zone output callback panicked");
        }
        state.last_sent = Some(power);
    }

    fn scaled(&self, target: u8, scale: Option<f32>) -> u8 {
        scale_power(target, scale.unwrap_or_else(|| (self.scale)()))
    }

    /// Resends the scaled target when it differs from the last value sent,
    /// or unconditionally when `force` is set.
    fn reapply(&self, scale: Option<f32>, force: bool) {
        let mut state = self.state.lock();
        self.reapply_locked(&mut state, scale, force);
    }

    fn reapply_locked(&self, state: &mut OutputState, scale: Option<f32>, force: bool) {
        if !state.phase.is_active() || state.output_cut {
            return;
        }
        let Some(target) = state.current_target else {
            return;
        };
        let scaled = self.scaled(target, scale);
        if force || state.last_sent != Some(scaled) {
            debug!(zone = %self.zone, target, scaled, "zone output rescaled");
            self.emit(state, scaled, Duration::ZERO);
        }
    }

    /// Drives the zone to zero for a cut pause unless that already happened.
    fn cut_locked(&self, state: &mut OutputState) {
        if !state.phase.is_active() || state.output_cut || state.current_target.is_none() {
            return;
        }
        state.phase = RunnerPhase::Paused;
        self.emit(state, 0, Duration::ZERO);
        state.output_cut = true;
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn sleep_tick(&self, limit: Duration) {
        thread::sleep(self.poll_interval.min(limit));
    }
}

/// Executes one zone's steps on its own thread.
pub struct StepRunner {
    shared: Arc<Shared>,
    steps: Mutex<Option<Vec<PlanStep>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StepRunner {
    pub fn new(plan: &ZonePlan, output: ZoneOutput, scale: ScaleSupplier) -> Self {
        Self::with_poll_interval(plan, output, scale, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(
        plan: &ZonePlan,
        output: ZoneOutput,
        scale: ScaleSupplier,
        poll_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                zone: plan.zone,
                output,
                scale,
                poll_interval: poll_interval.max(Duration::from_millis(1)),
                stop: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                cut_on_pause: AtomicBool::new(true),
                state: Mutex::new(OutputState {
                    phase: RunnerPhase::Idle,
                    current_target: None,
                    last_sent: None,
                    output_cut: false,
                }),
            }),
            steps: Mutex::new(Some(plan.steps.iter().copied().collect())),
            handle: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn zone(&self) -> ZoneId {
        self.shared.zone
    }

    #[must_use]
    pub fn phase(&self) -> RunnerPhase {
        self.shared.state.lock().phase
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.phase().is_active()
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Spawns the runner thread. A runner can only be started once.
    pub fn start(&self, done: DoneCallback) -> Result<(), ManagerError> {
        let Some(steps) = self.steps.lock().take() else {
            return Err(ManagerError::AlreadyStarted);
        };
        let zone = self.shared.zone;
        self.shared.state.lock().phase = RunnerPhase::Running;

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("runner-{}", zone.number()))
            .spawn(move || run(&shared, &steps, done));
        match spawned {
            Ok(handle) => {
                *self.handle.lock() = Some(handle);
                Ok(())
            }
            Err(source) => {
                self.shared.state.lock().phase = RunnerPhase::Stopped;
                Err(ManagerError::Spawn { zone, source })
            }
        }
    }

    /// Requests a pause; with `cut_output` the zone is driven to zero at once
    /// and held there until [`resume`](Self::resume).
    pub fn pause(&self, cut_output: bool) {
        let mut state = self.shared.state.lock();
        self.shared.cut_on_pause.store(cut_output, Ordering::SeqCst);
        self.shared.paused.store(true, Ordering::SeqCst);
        if cut_output {
            self.shared.cut_locked(&mut state);
        }
    }

    /// Clears the pause and immediately resends the scaled target.
    pub fn resume(&self) {
        let mut state = self.shared.state.lock();
        self.shared.paused.store(false, Ordering::SeqCst);
        state.output_cut = false;
        self.shared.reapply_locked(&mut state, None, true);
    }

    /// Requests the runner to unwind. Idempotent.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }

    /// Recomputes the scaled output now, resending it when it changed.
    /// No-op unless the runner is active.
    pub fn apply_scale(&self, scale: Option<f32>) {
        self.shared.reapply(scale, false);
    }

    /// Waits up to `timeout` for the runner thread to exit. Returns `true`
    /// when it has exited (or was never started).
    pub fn join(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut handle = self.handle.lock();
        let Some(running) = handle.as_ref() else {
            return true;
        };
        while !running.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        if let Some(finished) = handle.take()
            && finished.join().is_err()
        {
            error!(zone = %self.shared.zone, "runner thread panicked");
        }
        true
    }
}

fn run(shared: &Shared, steps: &[PlanStep], done: DoneCallback) {
    let zone = shared.zone;

    'steps: for step in steps {
        if shared.stop_requested() {
            break;
        }

        {
            let mut state = shared.state.lock();
            state.current_target = Some(step.power);
            let scaled = shared.scaled(step.power, None);
            debug!(%zone, target = step.power, scaled, duration = ?step.duration, "zone step");
            // A cut pause that landed on the step boundary holds the zone at
            // zero; resume sends the new target.
            if !state.output_cut {
                shared.emit(&mut state, scaled, step.duration);
            }
        }

        let mut end = Instant::now() + step.duration;
        loop {
            if shared.stop_requested() {
                break 'steps;
            }

            if shared.paused.load(Ordering::SeqCst) {
                let pause_started = Instant::now();
                loop {
                    {
                        let mut state = shared.state.lock();
                        if !shared.paused.load(Ordering::SeqCst) {
                            state.phase = RunnerPhase::Running;
                            state.output_cut = false;
                            break;
                        }
                        state.phase = RunnerPhase::Paused;
                        // A resume and re-pause between two ticks leaves the
                        // resent power on the wire; cut it again here.
                        if shared.cut_on_pause.load(Ordering::SeqCst) {
                            shared.cut_locked(&mut state);
                        }
                    }
                    if shared.stop_requested() {
                        break;
                    }
                    shared.sleep_tick(shared.poll_interval);
                }
                end += pause_started.elapsed();

                if shared.stop_requested() {
                    break 'steps;
                }
                shared.reapply(None, false);
                continue;
            }

            let now = Instant::now();
            if now >= end {
                break;
            }
            shared.reapply(None, false);
            shared.sleep_tick(end - now);
        }
    }

    let stopped = shared.stop_requested();
    {
        let mut state = shared.state.lock();
        shared.emit(&mut state, 0, Duration::ZERO);
        state.current_target = None;
        state.output_cut = false;
        state.phase = if stopped {
            RunnerPhase::Stopped
        } else {
            RunnerPhase::Complete
        };
    }
    debug!(%zone, stopped, "zone sequence finished");

    if panic::catch_unwind(AssertUnwindSafe(|| done(zone))).is_err() {
        error!(%zone, "zone done callback panicked");
    }
}
