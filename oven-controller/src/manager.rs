//! Coordination of all zone runners for one cook cycle.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use oven_core::{CookPlan, ZoneId, ZonePlan};
use parking_lot::Mutex;
use tracing::{error, info};

use crate::error::ManagerError;
use crate::runner::{DEFAULT_POLL_INTERVAL, RunnerPhase, ScaleSupplier, StepRunner, ZoneOutput};

/// Callback fired once every runner of a cycle has finished.
pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Completion {
    started: bool,
    pending: usize,
    completed_once: bool,
    on_all_complete: Option<CompletionCallback>,
}

/// Lock-free cell holding the shared power scale.
#[derive(Debug)]
struct ScaleCell(AtomicU32);

impl ScaleCell {
    fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::SeqCst))
    }

    fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::SeqCst);
    }
}

/// Owns the runners of one cook cycle. Single use: a manager can be started
/// once.
pub struct SequenceManager {
    runners: BTreeMap<ZoneId, StepRunner>,
    scale: Arc<ScaleCell>,
    completion: Arc<Mutex<Completion>>,
    poll_interval: Duration,
}

impl Default for SequenceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceManager {
    #[must_use]
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    /// Manager whose runners poll every `poll_interval`.
    #[must_use]
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            runners: BTreeMap::new(),
            scale: Arc::new(ScaleCell::new(1.0)),
            completion: Arc::new(Mutex::new(Completion::default())),
            poll_interval,
        }
    }

    /// Builds a manager with one runner per zone in `plan`, all sharing
    /// `output`.
    #[must_use]
    pub fn from_plan(plan: &CookPlan, output: &ZoneOutput, poll_interval: Duration) -> Self {
        let mut manager = Self::with_poll_interval(poll_interval);
        for zone in &plan.zones {
            manager.add_zone(zone, Arc::clone(output));
        }
        manager
    }

    /// Registers a runner for `plan.zone`, replacing any earlier one.
    pub fn add_zone(&mut self, plan: &ZonePlan, output: ZoneOutput) {
        let scale = Arc::clone(&self.scale);
        let supplier: ScaleSupplier = Arc::new(move || scale.load());
        self.runners.insert(
            plan.zone,
            StepRunner::with_poll_interval(plan, output, supplier, self.poll_interval),
        );
    }

    /// Registers the callback fired once all runners have finished. It runs
    /// on a dedicated thread.
    pub fn set_on_all_complete(&self, callback: impl FnOnce() + Send + 'static) {
        self.completion.lock().on_all_complete = Some(Box::new(callback));
    }

    /// Starts every registered runner.
    pub fn start_all(&self) -> Result<(), ManagerError> {
        {
            let mut completion = self.completion.lock();
            if completion.started {
                return Err(ManagerError::AlreadyStarted);
            }
            completion.started = true;
            completion.pending = self.runners.len();
            completion.completed_once = false;
        }
        info!(zones = self.runners.len(), "starting cook cycle");

        if self.runners.is_empty() {
            fire_completion(&self.completion);
            return Ok(());
        }

        let mut first_error = None;
        for runner in self.runners.values() {
            let completion = Arc::clone(&self.completion);
            let done = Box::new(move |_zone: ZoneId| runner_finished(&completion));
            if let Err(err) = runner.start(done) {
                error!(zone = %runner.zone(), %err, "runner failed to start");
                runner_finished(&self.completion);
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Requests every runner to stop without waiting. Idempotent.
    pub fn stop_all(&self) {
        for runner in self.runners.values() {
            runner.stop();
        }
    }

    pub fn pause_all(&self, cut_output: bool) {
        for runner in self.runners.values() {
            runner.pause(cut_output);
        }
    }

    pub fn resume_all(&self) {
        for runner in self.runners.values() {
            runner.resume();
        }
    }

    /// Sets the global power scale (clamped to `[0, 1]`) and pushes it to
    /// every active runner immediately.
    pub fn set_power_scale(&self, scale: f32) {
        let scale = if scale.is_nan() {
            0.0
        } else {
            scale.clamp(0.0, 1.0)
        };
        self.scale.store(scale);
        for runner in self.runners.values() {
            runner.apply_scale(Some(scale));
        }
    }

    #[must_use]
    pub fn power_scale(&self) -> f32 {
        self.scale.load()
    }

    #[must_use]
    pub fn is_any_running(&self) -> bool {
        self.runners.values().any(StepRunner::is_running)
    }

    #[must_use]
    pub fn is_any_paused(&self) -> bool {
        self.runners.values().any(StepRunner::is_paused)
    }

    /// `true` once the all-complete event has fired for this manager.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completion.lock().completed_once
    }

    /// Phase of every registered runner.
    #[must_use]
    pub fn status(&self) -> BTreeMap<ZoneId, RunnerPhase> {
        self.runners
            .iter()
            .map(|(zone, runner)| (*zone, runner.phase()))
            .collect()
    }

    #[must_use]
    pub fn zone_count(&self) -> usize {
        self.runners.len()
    }

    /// Waits up to `timeout` for every runner thread to exit.
    pub fn join_all(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.runners.values().all(|runner| {
            runner.join(deadline.saturating_duration_since(Instant::now()))
        })
    }
}

fn runner_finished(completion: &Arc<Mutex<Completion>>) {
    {
        let mut state = completion.lock();
        state.pending = state.pending.saturating_sub(1);
        if state.pending > 0 {
            return;
        }
    }
    fire_completion(completion);
}

/// Latches completion and runs the callback on a fresh thread, at most once.
fn fire_completion(completion: &Arc<Mutex<Completion>>) {
    let callback = {
        let mut state = completion.lock();
        if state.completed_once || state.pending > 0 {
            return;
        }
        state.completed_once = true;
        state.on_all_complete.take()
    };
    info!("cook cycle complete");

    let Some(callback) = callback else {
        return;
    };
    let spawned = thread::Builder::new()
        .name("all-complete".into())
        .spawn(move || {
            if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                error!("all-complete callback panicked");
            }
        });
    if let Err(err) = spawned {
        error!(%err, "failed to spawn all-complete callback");
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;
    use oven_core::PlanStep;
    use std::sync::atomic::AtomicUsize;

    const POLL: Duration = Duration::from_millis(10);

    fn zone_plan(number: u8, steps: &[(u64, u8)]) -> ZonePlan {
        let steps: Vec<PlanStep> = steps
            .iter()
            .map(|&(millis, power)| PlanStep {
                power,
                duration: Duration::from_millis(millis),
            })
            .collect();
        ZonePlan::new(ZoneId::new(number).expect("zone"), &steps).expect("plan")
    }

    type Log = Arc<Mutex<Vec<(ZoneId, u8, Instant)>>>;

    fn recording_output() -> (ZoneOutput, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        (
            Arc::new(move |zone, power, _| sink.lock().push((zone, power, Instant::now()))),
            log,
        )
    }

    fn completion_counter(manager: &SequenceManager) -> Arc<AtomicUsize> {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        manager.set_on_all_complete(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        fired
    }

    fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn completion_fires_exactly_once_per_cycle() {
        for _ in 0..10 {
            let (output, _) = recording_output();
            let mut manager = SequenceManager::with_poll_interval(POLL);
            for number in 1..=8 {
                manager.add_zone(&zone_plan(number, &[(15, 50)]), Arc::clone(&output));
            }
            let fired = completion_counter(&manager);
            manager.start_all().expect("start");

            assert!(manager.join_all(Duration::from_secs(2)));
            assert!(wait_for(Duration::from_secs(1), || fired.load(Ordering::SeqCst) > 0));
            thread::sleep(Duration::from_millis(20));
            assert_eq!(fired.load(Ordering::SeqCst), 1);
            assert!(manager.is_complete());
        }
    }

    #[test]
    fn completion_runs_on_its_own_thread() {
        let (output, _) = recording_output();
        let mut manager = SequenceManager::with_poll_interval(POLL);
        manager.add_zone(&zone_plan(2, &[(10, 30)]), output);
        let thread_name = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&thread_name);
        manager.set_on_all_complete(move || {
            *sink.lock() = thread::current().name().map(str::to_owned);
        });
        manager.start_all().expect("start");

        assert!(wait_for(Duration::from_secs(1), || thread_name.lock().is_some()));
        assert_eq!(thread_name.lock().as_deref(), Some("all-complete"));
    }

    #[test]
    fn empty_manager_completes_immediately() {
        let manager = SequenceManager::with_poll_interval(POLL);
        let fired = completion_counter(&manager);
        manager.stop_all();
        manager.start_all().expect("start");
        assert!(wait_for(Duration::from_secs(1), || fired.load(Ordering::SeqCst) == 1));
        assert!(!manager.is_any_running());
    }

    #[test]
    fn manager_is_single_use() {
        let manager = SequenceManager::with_poll_interval(POLL);
        manager.start_all().expect("first start");
        assert!(matches!(manager.start_all(), Err(ManagerError::AlreadyStarted)));
    }

    #[test]
    fn power_scale_reaches_active_runner_within_a_tick() {
        let (output, log) = recording_output();
        let mut manager = SequenceManager::with_poll_interval(POLL);
        manager.add_zone(&zone_plan(3, &[(500, 80)]), output);
        manager.start_all().expect("start");
        thread::sleep(Duration::from_millis(40));

        let changed_at = Instant::now();
        manager.set_power_scale(0.5);
        assert_eq!(manager.power_scale(), 0.5);
        assert!(wait_for(POLL * 2, || log.lock().iter().any(|(_, p, _)| *p == 40)));
        let resent_at = log
            .lock()
            .iter()
            .find(|(_, power, _)| *power == 40)
            .map(|(_, _, at)| *at)
            .expect("resend");
        assert!(resent_at.duration_since(changed_at) <= POLL);

        manager.stop_all();
        assert!(manager.join_all(Duration::from_secs(1)));
    }

    #[test]
    fn scale_is_clamped() {
        let manager = SequenceManager::new();
        manager.set_power_scale(3.0);
        assert_eq!(manager.power_scale(), 1.0);
        manager.set_power_scale(-1.0);
        assert_eq!(manager.power_scale(), 0.0);
    }

    #[test]
    fn stop_all_ends_every_zone_and_still_completes_once() {
        let (output, log) = recording_output();
        let mut manager = SequenceManager::with_poll_interval(POLL);
        for number in [1, 4, 6] {
            manager.add_zone(&zone_plan(number, &[(5_000, 60)]), Arc::clone(&output));
        }
        let fired = completion_counter(&manager);
        manager.start_all().expect("start");
        thread::sleep(Duration::from_millis(30));
        assert!(manager.is_any_running());

        manager.stop_all();
        manager.stop_all();
        assert!(manager.join_all(Duration::from_secs(1)));
        assert!(wait_for(Duration::from_secs(1), || fired.load(Ordering::SeqCst) == 1));

        let log = log.lock();
        for zone in manager.status().keys() {
            let last = log
                .iter()
                .rev()
                .find(|(z, _, _)| z == zone)
                .expect("zone output");
            assert_eq!(last.1, 0, "{zone} did not end de-energized");
        }
        assert!(manager
            .status()
            .values()
            .all(|phase| *phase == RunnerPhase::Stopped));
    }

    #[test]
    fn pause_and_resume_broadcast_to_every_zone() {
        let (output, _) = recording_output();
        let mut manager = SequenceManager::with_poll_interval(POLL);
        for number in [1, 2] {
            manager.add_zone(&zone_plan(number, &[(5_000, 60)]), Arc::clone(&output));
        }
        manager.start_all().expect("start");
        manager.pause_all(true);
        assert!(manager.is_any_paused());
        manager.resume_all();
        assert!(!manager.is_any_paused());
        manager.stop_all();
        assert!(manager.join_all(Duration::from_secs(1)));
    }

    #[test]
    fn from_plan_registers_one_runner_per_zone() {
        let plan = CookPlan::uniform(40, Duration::from_secs(1));
        let (output, _) = recording_output();
        let manager = SequenceManager::from_plan(&plan, &output, POLL);
        assert_eq!(manager.zone_count(), 8);
        assert!(manager
            .status()
            .values()
            .all(|phase| *phase == RunnerPhase::Idle));
    }
}
