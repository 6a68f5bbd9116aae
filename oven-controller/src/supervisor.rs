//! Cook session supervision.
//!
//! The [`Supervisor`] owns the timers that run on the dispatcher: the cook
//! countdown, the periodic thermistor/IR poll and the link watchdog. It
//! reacts to controller telemetry by throttling the active
//! [`SequenceManager`] on over-temperature, pausing the cook when the door
//! opens and aborting it when the link goes quiet.
//!
//! Timer closures hold only a weak reference to the supervisor state, so
//! dropping the [`Supervisor`] detaches everything it registered.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use oven_core::countdown::Countdown;
use oven_core::overtemp::{AlarmTransition, OverTempConfig, OverTempMonitor, indicator_percent};
use oven_core::protocol::{HostCommand, IR_SENSOR_COUNT, LockState, Telemetry, parse_telemetry};
use oven_core::watchdog::{LinkWatchdog, WatchdogConfig, WatchdogStatus};
use oven_core::{CookPlan, SequenceCollection, ZoneId};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::Appliance;
use crate::config::Settings;
use crate::dispatch::{DispatchHandle, TimerHandle};
use crate::error::SessionError;
use crate::interlock::{FlagListener, InterlockModel};
use crate::manager::SequenceManager;
use crate::runner::{DEFAULT_POLL_INTERVAL, RunnerPhase, ZoneOutput};
use crate::transport::{LineListener, Transport};

/// Period of the countdown tick.
pub const TICK_INTERVAL: Duration = Duration::from_millis(50);
/// Delay between attaching and the initial door query.
pub const DOOR_QUERY_DELAY: Duration = Duration::from_millis(150);

/// Timing and policy knobs of a [`Supervisor`].
#[derive(Clone, Debug, PartialEq)]
pub struct SupervisorConfig {
    pub over_temp: OverTempConfig,
    pub watchdog: WatchdogConfig,
    pub poll_interval: Duration,
    pub fan_off_delay: Duration,
    /// Poll telemetry and arm the link watchdog.
    pub periodic_telemetry: bool,
    /// Report a watchdog expiry as a user-facing [`SupervisorEvent::Error`].
    pub interactive_errors: bool,
    pub runner_poll: Duration,
    pub tick_interval: Duration,
    pub door_query_delay: Duration,
}

impl SupervisorConfig {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            over_temp: settings.over_temp(),
            watchdog: settings.watchdog(),
            poll_interval: settings.poll_interval(),
            fan_off_delay: settings.fan_off_delay(),
            periodic_telemetry: settings.periodic_telemetry,
            interactive_errors: settings.interactive_errors,
            runner_poll: DEFAULT_POLL_INTERVAL,
            tick_interval: TICK_INTERVAL,
            door_query_delay: DOOR_QUERY_DELAY,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// How the active cook was started.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CookMode {
    /// Per-zone steps from the loaded program.
    Program,
    /// Every zone at one power.
    Manual { power: u8 },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StopReason {
    /// The countdown ran out or every zone completed.
    Finished,
    User,
    /// The link watchdog expired.
    Watchdog,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PauseReason {
    User,
    Door,
}

/// Notifications delivered to the [`EventSink`] on the dispatcher.
#[derive(Clone, Debug, PartialEq)]
pub enum SupervisorEvent {
    Started { mode: CookMode, total: Duration },
    Progress { remaining: Duration, progress: f32 },
    PowerIndicator(String),
    OverTemp { in_alarm: bool, scale: f32 },
    Paused(PauseReason),
    Resumed,
    Ended(StopReason),
    RunningChanged { running: bool, session: u64 },
    Thermistors { r1: i32, r2: i32 },
    IrTemperature { sensor: u8, value: f32 },
    Versions { firmware: String, hardware: String },
    Fan(bool),
    DoorLock(LockState),
    SupplyVoltages(Vec<f32>),
    FanCurrent(f32),
    /// Every line received from the controller, verbatim.
    LastLine(String),
    Error(String),
}

pub type EventSink = Arc<dyn Fn(&SupervisorEvent) + Send + Sync>;

/// Snapshot returned by [`Supervisor::status`].
#[derive(Clone, Debug, PartialEq)]
pub struct SessionStatus {
    pub mode: Option<CookMode>,
    pub paused: Option<PauseReason>,
    pub remaining: Duration,
    pub power_scale: f32,
    pub in_alarm: Option<bool>,
    pub running: bool,
    pub session: u64,
    pub zones: BTreeMap<ZoneId, RunnerPhase>,
}

impl SessionStatus {
    #[must_use]
    pub fn is_cooking(&self) -> bool {
        self.mode.is_some()
    }
}

/// Text of the power indicator for `mode` at `scale`.
#[must_use]
pub fn indicator_text(mode: CookMode, scale: f32) -> String {
    match mode {
        CookMode::Manual { power } => format!("{}% Power", indicator_percent(power, scale)),
        CookMode::Program => format!("Scale: {}%", indicator_percent(100, scale)),
    }
}

/// `true` when `gap` exceeds 1.25 times `interval`.
fn is_overrun(gap: Duration, interval: Duration) -> bool {
    gap * 4 > interval * 5
}

struct Cook {
    id: u64,
    mode: CookMode,
    manager: SequenceManager,
    countdown: Countdown<Instant>,
    /// Cleared when the cook ends; late runner output is forced to zero.
    live: Arc<AtomicBool>,
    pause: Option<PauseReason>,
    tick_timer: TimerHandle,
}

struct State {
    cook: Option<Cook>,
    next_cook_id: u64,
    monitor: OverTempMonitor,
    watchdog: LinkWatchdog<Instant>,
    watchdog_timer: Option<TimerHandle>,
    poll_timer: Option<TimerHandle>,
    last_poll: Option<Instant>,
    running: bool,
    session: u64,
    detached: bool,
}

struct Inner {
    config: SupervisorConfig,
    dispatch: DispatchHandle,
    transport: Arc<Transport>,
    interlock: Arc<InterlockModel>,
    sink: EventSink,
    fan_off: Arc<Mutex<Option<TimerHandle>>>,
    state: Mutex<State>,
}

/// Page-level controller for cook sessions on one appliance.
pub struct Supervisor {
    inner: Arc<Inner>,
    transport: Arc<Transport>,
    interlock: Arc<InterlockModel>,
    line_listener: LineListener,
    door_listener: FlagListener,
}

impl Supervisor {
    /// Registers with the transport and interlocks and starts the poll and
    /// watchdog timers. Events are delivered to `sink` on the dispatcher.
    pub fn attach(appliance: &Appliance, config: SupervisorConfig, sink: EventSink) -> Self {
        let now = Instant::now();
        let inner = Arc::new(Inner {
            dispatch: appliance.dispatch.clone(),
            transport: Arc::clone(&appliance.transport),
            interlock: Arc::clone(&appliance.interlock),
            sink,
            fan_off: Arc::new(Mutex::new(None)),
            state: Mutex::new(State {
                cook: None,
                next_cook_id: 0,
                monitor: OverTempMonitor::new(config.over_temp),
                watchdog: LinkWatchdog::new(config.watchdog, now),
                watchdog_timer: None,
                poll_timer: None,
                last_poll: None,
                running: false,
                session: 0,
                detached: false,
            }),
            config,
        });

        let weak = Arc::downgrade(&inner);
        let line_listener: LineListener = Arc::new(move |line| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_line(line);
            }
        });
        appliance.transport.add_listener(Arc::clone(&line_listener));

        let weak = Arc::downgrade(&inner);
        let door_listener: FlagListener = Arc::new(move |open| {
            if let Some(inner) = weak.upgrade() {
                inner.door_changed(open);
            }
        });
        appliance
            .interlock
            .door()
            .add_listener(Arc::clone(&door_listener), false);

        inner.after(inner.config.door_query_delay, |inner| {
            inner.send(HostCommand::ReadDoor);
        });
        if inner.config.periodic_telemetry {
            let mut state = inner.state.lock();
            state.poll_timer = Some(inner.after(inner.config.poll_interval, Inner::poll_telemetry));
            inner.arm_watchdog(&mut state);
        }

        Self {
            transport: Arc::clone(&appliance.transport),
            interlock: Arc::clone(&appliance.interlock),
            inner,
            line_listener,
            door_listener,
        }
    }

    /// Starts cooking the runnable steps of `program`.
    pub fn start_program(&self, program: &SequenceCollection) -> Result<(), SessionError> {
        self.inner.start(&program.plan(), CookMode::Program)
    }

    /// Starts every zone at `power` for `duration`.
    pub fn start_manual(&self, power: u8, duration: Duration) -> Result<(), SessionError> {
        let power = power.min(oven_core::program::MAX_POWER);
        self.inner
            .start(&CookPlan::uniform(power, duration), CookMode::Manual { power })
    }

    /// Pauses the cook with output cut and freezes the countdown.
    pub fn pause(&self) -> Result<(), SessionError> {
        if self.inner.pause_cook(PauseReason::User) {
            Ok(())
        } else {
            Err(SessionError::NotCooking)
        }
    }

    /// Resumes a paused cook. Refused while the door is open.
    pub fn resume(&self) -> Result<(), SessionError> {
        self.inner.resume_cook()
    }

    /// Ends the cook and powers every zone down.
    pub fn stop(&self) -> Result<(), SessionError> {
        if self.inner.end_cook(None, StopReason::User) {
            Ok(())
        } else {
            Err(SessionError::NotCooking)
        }
    }

    /// Overrides the power scale of the active cook.
    pub fn set_power_scale(&self, scale: f32) -> Result<(), SessionError> {
        let state = self.inner.state.lock();
        let Some(cook) = state.cook.as_ref() else {
            return Err(SessionError::NotCooking);
        };
        cook.manager.set_power_scale(scale);
        let text = indicator_text(cook.mode, cook.manager.power_scale());
        drop(state);
        self.inner.emit(SupervisorEvent::PowerIndicator(text));
        Ok(())
    }

    #[must_use]
    pub fn is_cooking(&self) -> bool {
        self.inner.state.lock().cook.is_some()
    }

    /// State of the oven-running flag and its change counter.
    #[must_use]
    pub fn running(&self) -> (bool, u64) {
        let state = self.inner.state.lock();
        (state.running, state.session)
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        let now = Instant::now();
        let state = self.inner.state.lock();
        let cook = state.cook.as_ref();
        SessionStatus {
            mode: cook.map(|cook| cook.mode),
            paused: cook.and_then(|cook| cook.pause),
            remaining: cook.map_or(Duration::ZERO, |cook| cook.countdown.remaining(now)),
            power_scale: cook.map_or(1.0, |cook| cook.manager.power_scale()),
            in_alarm: state.monitor.in_alarm(),
            running: state.running,
            session: state.session,
            zones: cook.map(|cook| cook.manager.status()).unwrap_or_default(),
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.transport.remove_listener(&self.line_listener);
        self.interlock.door().remove_listener(&self.door_listener);
        self.inner.detach();
    }
}

impl Inner {
    /// Schedules `task` on the dispatcher unless the supervisor is gone by
    /// then.
    fn after(
        self: &Arc<Self>,
        delay: Duration,
        task: impl FnOnce(&Arc<Self>) + Send + 'static,
    ) -> TimerHandle {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.dispatch.post_after(delay, move || {
            if let Some(inner) = weak.upgrade() {
                task(&inner);
            }
        })
    }

    fn emit(&self, event: SupervisorEvent) {
        let sink = Arc::clone(&self.sink);
        self.dispatch.post(move || sink(&event));
    }

    fn send(&self, command: HostCommand) {
        if let Err(err) = self.transport.send_command(command) {
            debug!(%command, %err, "command not sent");
        }
    }

    fn start(self: &Arc<Self>, plan: &CookPlan, mode: CookMode) -> Result<(), SessionError> {
        if self.interlock.is_open() {
            return Err(SessionError::DoorOpen);
        }
        if self.interlock.is_wdt_timed_out() {
            return Err(SessionError::WatchdogTripped);
        }

        let mut state = self.state.lock();
        if state.cook.is_some() {
            return Err(SessionError::AlreadyCooking);
        }
        if plan.is_empty() {
            return Err(SessionError::NothingToRun);
        }

        self.cancel_fan_off();
        state.monitor.reset();
        state.next_cook_id += 1;
        let id = state.next_cook_id;

        let live = Arc::new(AtomicBool::new(true));
        let output = self.zone_output(Arc::clone(&live));
        let manager = SequenceManager::from_plan(plan, &output, self.config.runner_poll);
        let weak = Arc::downgrade(self);
        let dispatch = self.dispatch.clone();
        manager.set_on_all_complete(move || {
            dispatch.post(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.end_cook(Some(id), StopReason::Finished);
                }
            });
        });

        if let Err(err) = manager.start_all() {
            live.store(false, Ordering::SeqCst);
            manager.stop_all();
            drop(state);
            self.all_zones_off();
            return Err(err.into());
        }

        let total = plan.total_duration();
        let tick_timer = self.after(self.config.tick_interval, move |inner| inner.tick(id));
        state.cook = Some(Cook {
            id,
            mode,
            manager,
            countdown: Countdown::start(total, Instant::now()),
            live,
            pause: None,
            tick_timer,
        });
        drop(state);

        info!(?mode, ?total, zones = plan.zones.len(), "cook cycle started");
        self.set_running(true);
        self.emit(SupervisorEvent::Started { mode, total });
        self.emit(SupervisorEvent::PowerIndicator(indicator_text(mode, 1.0)));
        Ok(())
    }

    /// Output callback shared by every runner of one cook.
    fn zone_output(&self, live: Arc<AtomicBool>) -> ZoneOutput {
        let transport = Arc::clone(&self.transport);
        let fan_off = Arc::clone(&self.fan_off);
        Arc::new(move |zone, power, _| {
            let power = if live.load(Ordering::SeqCst) { power } else { 0 };
            if power > 0
                && let Some(pending) = fan_off.lock().take()
            {
                pending.cancel();
                debug!("pending fan-off cancelled");
            }
            info!(%zone, power, "zone power");
            if let Err(err) = transport.send_command(HostCommand::set_zone(zone, power)) {
                warn!(%zone, power, %err, "zone command not sent");
            }
        })
    }

    fn tick(self: &Arc<Self>, id: u64) {
        let now = Instant::now();
        let (remaining, progress) = {
            let mut state = self.state.lock();
            let Some(cook) = state.cook.as_mut().filter(|cook| cook.id == id) else {
                return;
            };
            let remaining = cook.countdown.remaining(now);
            if !remaining.is_zero() {
                cook.tick_timer = self.after(self.config.tick_interval, move |inner| inner.tick(id));
            }
            (remaining, cook.countdown.progress(now))
        };

        self.emit(SupervisorEvent::Progress {
            remaining,
            progress,
        });
        if remaining.is_zero() {
            self.end_cook(Some(id), StopReason::Finished);
        }
    }

    fn pause_cook(&self, reason: PauseReason) -> bool {
        let mut state = self.state.lock();
        let Some(cook) = state.cook.as_mut() else {
            return false;
        };
        if cook.pause.is_some() {
            return true;
        }
        cook.pause = Some(reason);
        cook.manager.pause_all(true);
        cook.countdown.pause(Instant::now());
        drop(state);

        info!(?reason, "cook paused");
        self.emit(SupervisorEvent::Paused(reason));
        true
    }

    fn resume_cook(&self) -> Result<(), SessionError> {
        if self.interlock.is_open() {
            return Err(SessionError::DoorOpen);
        }
        let mut state = self.state.lock();
        let Some(cook) = state.cook.as_mut() else {
            return Err(SessionError::NotCooking);
        };
        if cook.pause.take().is_none() {
            return Ok(());
        }
        cook.countdown.resume(Instant::now());
        cook.manager.resume_all();
        drop(state);

        info!("cook resumed");
        self.emit(SupervisorEvent::Resumed);
        Ok(())
    }

    /// Ends the cook identified by `id`, or whichever cook is active when
    /// `id` is `None`. Returns `false` when there was nothing to end.
    fn end_cook(self: &Arc<Self>, id: Option<u64>, reason: StopReason) -> bool {
        let Some(cook) = self
            .state
            .lock()
            .cook
            .take_if(|cook| id.is_none_or(|id| cook.id == id))
        else {
            return false;
        };

        cook.tick_timer.cancel();
        cook.live.store(false, Ordering::SeqCst);
        cook.manager.stop_all();
        info!(?reason, mode = ?cook.mode, "cook cycle ended");
        self.all_zones_off();
        self.emit(SupervisorEvent::Ended(reason));
        true
    }

    /// Broadcasts zone power zero, clears the running flag and schedules the
    /// fan to switch off.
    fn all_zones_off(self: &Arc<Self>) {
        self.send(HostCommand::all_zones_off());
        self.set_running(false);

        let delay = self.config.fan_off_delay;
        let mut fan_off = self.fan_off.lock();
        if let Some(pending) = fan_off.take() {
            pending.cancel();
        }
        if delay.is_zero() {
            drop(fan_off);
            self.send(HostCommand::SetFan(false));
            return;
        }
        *fan_off = Some(self.after(delay, |inner| {
            inner.fan_off.lock().take();
            info!("fan off");
            inner.send(HostCommand::SetFan(false));
        }));
    }

    fn cancel_fan_off(&self) {
        if let Some(pending) = self.fan_off.lock().take() {
            pending.cancel();
        }
    }

    fn set_running(&self, running: bool) {
        let session = {
            let mut state = self.state.lock();
            if state.running == running {
                return;
            }
            state.running = running;
            state.session += 1;
            state.session
        };
        self.emit(SupervisorEvent::RunningChanged { running, session });
    }

    fn door_changed(&self, open: bool) {
        if open && self.pause_cook(PauseReason::Door) {
            warn!("door opened during cook");
        }
    }

    fn poll_telemetry(self: &Arc<Self>) {
        let now = Instant::now();
        let interval = self.config.poll_interval;
        {
            let mut state = self.state.lock();
            if state.detached {
                return;
            }
            if let Some(last) = state.last_poll.replace(now) {
                let gap = now.saturating_duration_since(last);
                if is_overrun(gap, interval) {
                    warn!(?gap, ?interval, "telemetry poll overran");
                }
            }
            state.poll_timer = Some(self.after(interval, Self::poll_telemetry));
        }

        self.send(HostCommand::ReadThermistors);
        for sensor in 1..=IR_SENSOR_COUNT {
            self.send(HostCommand::ReadIrTemperature(sensor));
        }
    }

    /// (Re)schedules the watchdog check for the current deadline.
    fn arm_watchdog(self: &Arc<Self>, state: &mut State) {
        if let Some(timer) = state.watchdog_timer.take() {
            timer.cancel();
        }
        let delay = state.watchdog.remaining(Instant::now());
        state.watchdog_timer = Some(self.after(delay, Self::check_watchdog));
    }

    fn check_watchdog(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.detached {
            return;
        }
        match state.watchdog.poll(Instant::now()) {
            WatchdogStatus::Healthy => self.arm_watchdog(&mut state),
            WatchdogStatus::Tripped => {}
            WatchdogStatus::Expired => {
                state.watchdog_timer = None;
                drop(state);
                self.watchdog_expired();
            }
        }
    }

    fn watchdog_expired(self: &Arc<Self>) {
        error!("lost communication with the controller");
        self.interlock.set_wdt_timed_out(true);
        self.end_cook(None, StopReason::Watchdog);
        if self.config.interactive_errors {
            self.emit(SupervisorEvent::Error(
                "Lost communication with the controller".into(),
            ));
        }
    }

    fn handle_line(self: &Arc<Self>, line: &str) {
        self.emit(SupervisorEvent::LastLine(line.to_owned()));
        if self.interlock.parse_controller_line(line) {
            return;
        }
        let Ok(telemetry) = parse_telemetry(line) else {
            debug!(line, "ignoring unrecognized line");
            return;
        };

        let event = match telemetry {
            Telemetry::Thermistors { r1, r2 } => {
                self.thermistors(r1, r2);
                return;
            }
            Telemetry::IrTemperature { sensor, value } => {
                if self.state.lock().cook.is_some() {
                    info!(sensor, value, "ir temperature");
                }
                SupervisorEvent::IrTemperature { sensor, value }
            }
            Telemetry::Door { open } => {
                self.interlock.set_open(open);
                return;
            }
            Telemetry::Versions { firmware, hardware } => SupervisorEvent::Versions {
                firmware: firmware.to_owned(),
                hardware: hardware.to_owned(),
            },
            Telemetry::Fan { on } => SupervisorEvent::Fan(on),
            Telemetry::DoorLock(lock) => SupervisorEvent::DoorLock(lock),
            Telemetry::SupplyVoltages(volts) => {
                SupervisorEvent::SupplyVoltages(volts.iter().copied().collect())
            }
            Telemetry::FanCurrent(amps) => SupervisorEvent::FanCurrent(amps),
        };
        self.emit(event);
    }

    fn thermistors(self: &Arc<Self>, r1: i32, r2: i32) {
        self.interlock.set_wdt_timed_out(false);
        let mut events = vec![SupervisorEvent::Thermistors { r1, r2 }];
        {
            let mut state = self.state.lock();
            if self.config.periodic_telemetry {
                if let Some(gap) = state.watchdog.kick(Instant::now())
                    && is_overrun(gap, self.config.poll_interval)
                {
                    warn!(?gap, "late telemetry");
                }
                self.arm_watchdog(&mut state);
            }

            let State {
                cook,
                monitor,
                running,
                ..
            } = &mut *state;
            if let Some(cook) = cook.as_ref()
                && *running
            {
                match monitor.observe(r1, r2) {
                    AlarmTransition::Initialized => events.push(SupervisorEvent::PowerIndicator(
                        indicator_text(cook.mode, cook.manager.power_scale()),
                    )),
                    AlarmTransition::Unchanged => {}
                    transition @ (AlarmTransition::Entered | AlarmTransition::Cleared) => {
                        let in_alarm = transition == AlarmTransition::Entered;
                        let scale = monitor.config().scale_for(in_alarm);
                        if in_alarm {
                            warn!(r1, r2, scale, "over-temperature, throttling");
                        } else {
                            info!(r1, r2, "over-temperature cleared");
                        }
                        cook.manager.set_power_scale(scale);
                        events.push(SupervisorEvent::OverTemp { in_alarm, scale });
                        events.push(SupervisorEvent::PowerIndicator(indicator_text(
                            cook.mode, scale,
                        )));
                    }
                }
            }
        }
        for event in events {
            self.emit(event);
        }
    }

    fn detach(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.detached = true;
            for timer in [state.poll_timer.take(), state.watchdog_timer.take()]
                .into_iter()
                .flatten()
            {
                timer.cancel();
            }
        }
        self.end_cook(None, StopReason::User);
    }
}
