//! Headless operator shell.
//!
//! Parses operator lines with [`oven_core::repl`] and executes them against
//! the loaded program, the program store and the cook [`Supervisor`]. The
//! shell must run on the thread that drives the dispatcher.

use std::fmt::Write as _;

use oven_core::program::format_total_time;
use oven_core::protocol::HostCommand;
use oven_core::repl::{ReplCommand, parse_command, usage_lines};
use oven_core::SequenceCollection;

use crate::Appliance;
use crate::error::ShellError;
use crate::store::ProgramStore;
use crate::supervisor::{
    CookMode, PauseReason, SessionStatus, StopReason, Supervisor, SupervisorEvent,
};

/// Result of a successfully executed line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    Quit,
}

pub struct Shell {
    appliance: Appliance,
    store: ProgramStore,
    supervisor: Supervisor,
    loaded: Option<u32>,
}

impl Shell {
    #[must_use]
    pub fn new(appliance: Appliance, store: ProgramStore, supervisor: Supervisor) -> Self {
        Self {
            appliance,
            store,
            supervisor,
            loaded: None,
        }
    }

    #[must_use]
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn execute_line(&mut self, line: &str) -> Result<Reply, ShellError> {
        let command = parse_command(line).map_err(|err| ShellError::Parse(err.to_string()))?;
        self.execute(command)
    }

    pub fn execute(&mut self, command: ReplCommand<'_>) -> Result<Reply, ShellError> {
        let text = match command {
            ReplCommand::Load { index } => {
                let summary = self.store.load(index, &mut self.appliance.program.lock())?;
                self.loaded = Some(index);
                format!(
                    "loaded program {index}: {} ({})",
                    summary.description, summary.total_time
                )
            }
            ReplCommand::Save { index, description } => {
                let summary =
                    self.store
                        .save(index, &self.appliance.program.lock(), description)?;
                self.loaded = Some(index);
                format!(
                    "saved program {index}: {} ({})",
                    summary.description, summary.total_time
                )
            }
            ReplCommand::Show => render_program(self.loaded, &self.appliance.program.lock()),
            ReplCommand::List => {
                let mut text = String::new();
                for summary in self.store.list()? {
                    let _ = writeln!(
                        text,
                        "{:>2}  {:>6}  {}",
                        summary.index, summary.total_time, summary.description
                    );
                }
                text
            }
            ReplCommand::Set { zone, phase, step } => {
                self.appliance
                    .program
                    .lock()
                    .set_step(zone, phase, step)
                    .map_err(ShellError::Program)?;
                format!(
                    "{zone} phase {}: {}% for {}s",
                    phase + 1,
                    step.power,
                    step.duration
                )
            }
            ReplCommand::Run => {
                let program = self.appliance.program.lock().clone();
                self.supervisor.start_program(&program)?;
                format!(
                    "cooking, {} total",
                    format_total_time(program.plan().total_duration())
                )
            }
            ReplCommand::Manual { duration, power } => {
                self.supervisor.start_manual(power, duration)?;
                format!("cooking at {power}% for {}", format_total_time(duration))
            }
            ReplCommand::Pause => {
                self.supervisor.pause()?;
                "paused".into()
            }
            ReplCommand::Resume => {
                self.supervisor.resume()?;
                "resumed".into()
            }
            ReplCommand::Stop => {
                self.supervisor.stop()?;
                "stopped".into()
            }
            ReplCommand::Status => self.render_status(&self.supervisor.status()),
            ReplCommand::Scale(scale) => {
                self.supervisor.set_power_scale(scale)?;
                format!("power scale {scale:.2}")
            }
            ReplCommand::Door => {
                self.appliance
                    .transport
                    .send_command(HostCommand::ReadDoor)?;
                format!("door {}", open_closed(self.appliance.interlock.is_open()))
            }
            ReplCommand::Fan(on) => {
                self.appliance
                    .transport
                    .send_command(HostCommand::SetFan(on))?;
                format!("fan {}", on_off(on))
            }
            ReplCommand::Lock(on) => {
                self.appliance
                    .transport
                    .send_command(HostCommand::SetLock(on))?;
                format!("door lock {}", on_off(on))
            }
            ReplCommand::Version => {
                self.appliance
                    .transport
                    .send_command(HostCommand::ReadVersion)?;
                "version requested".into()
            }
            ReplCommand::Help => usage_lines().collect::<Vec<_>>().join("\n"),
            ReplCommand::Quit => {
                if self.supervisor.is_cooking() {
                    self.supervisor.stop()?;
                }
                return Ok(Reply::Quit);
            }
        };
        Ok(Reply::Text(text))
    }

    fn render_status(&self, status: &SessionStatus) -> String {
        let mut text = String::new();
        let activity = match status.mode {
            None => "idle".to_owned(),
            Some(CookMode::Program) => "cooking program".to_owned(),
            Some(CookMode::Manual { power }) => format!("cooking manual at {power}%"),
        };
        let _ = writeln!(text, "state:     {activity}");
        if let Some(reason) = status.paused {
            let _ = writeln!(text, "paused:    {reason:?}");
        }
        if status.is_cooking() {
            let _ = writeln!(text, "remaining: {}", format_total_time(status.remaining));
            let _ = writeln!(text, "scale:     {:.0}%", status.power_scale * 100.0);
        }
        let alarm = match status.in_alarm {
            None => "-",
            Some(true) => "ALARM",
            Some(false) => "ok",
        };
        let _ = writeln!(text, "over-temp: {alarm}");
        let _ = writeln!(
            text,
            "door:      {}",
            open_closed(self.appliance.interlock.is_open())
        );
        let link = if self.appliance.interlock.is_wdt_timed_out() {
            "lost"
        } else {
            "ok"
        };
        let port = self
            .appliance
            .transport
            .port_name()
            .unwrap_or_else(|| "closed".into());
        let _ = writeln!(text, "link:      {link} ({port})");
        let _ = write!(
            text,
            "running:   {} (session {})",
            status.running, status.session
        );
        for (zone, phase) in &status.zones {
            let _ = write!(text, "\n  {zone}: {phase:?}");
        }
        text
    }
}

fn render_program(loaded: Option<u32>, program: &SequenceCollection) -> String {
    let mut text = String::new();
    let _ = match loaded {
        Some(index) => writeln!(text, "program {index}"),
        None => writeln!(text, "program (unsaved)"),
    };
    for sequence in program.zone_sequences() {
        let _ = write!(text, "{:<6}", sequence.name.as_str());
        for step in &sequence.steps {
            let _ = write!(text, "  {:>3}% {:>7.1}s", step.power, step.duration);
        }
        text.push('\n');
    }
    let _ = write!(
        text,
        "total {}",
        format_total_time(program.total_duration())
    );
    text
}

fn open_closed(open: bool) -> &'static str {
    if open { "open" } else { "closed" }
}

fn on_off(on: bool) -> &'static str {
    if on { "on" } else { "off" }
}

/// One-line operator message for a supervisor event, or `None` for events
/// too frequent or too low-level to print.
#[must_use]
pub fn describe_event(event: &SupervisorEvent) -> Option<String> {
    let text = match event {
        SupervisorEvent::Started { mode, total } => {
            format!("cook started ({mode:?}, {})", format_total_time(*total))
        }
        SupervisorEvent::PowerIndicator(text) => text.clone(),
        SupervisorEvent::OverTemp { in_alarm: true, scale } => {
            format!("over-temperature: power scaled to {:.0}%", scale * 100.0)
        }
        SupervisorEvent::OverTemp { in_alarm: false, .. } => "over-temperature cleared".into(),
        SupervisorEvent::Paused(PauseReason::Door) => "door opened: cook paused".into(),
        SupervisorEvent::Paused(PauseReason::User) => "cook paused".into(),
        SupervisorEvent::Resumed => "cook resumed".into(),
        SupervisorEvent::Ended(StopReason::Finished) => "cook finished".into(),
        SupervisorEvent::Ended(StopReason::User) => "cook stopped".into(),
        SupervisorEvent::Ended(StopReason::Watchdog) => {
            "cook aborted: lost communication with the controller".into()
        }
        SupervisorEvent::Versions { firmware, hardware } => {
            format!("firmware {firmware}, hardware {hardware}")
        }
        SupervisorEvent::Fan(on) => format!("fan {}", on_off(*on)),
        SupervisorEvent::DoorLock(lock) => format!("door lock {lock:?}"),
        SupervisorEvent::SupplyVoltages(volts) => format!("supply voltages {volts:?}"),
        SupervisorEvent::FanCurrent(amps) => format!("fan current {amps:.2} A"),
        SupervisorEvent::Error(message) => format!("error: {message}"),
        SupervisorEvent::Progress { .. }
        | SupervisorEvent::RunningChanged { .. }
        | SupervisorEvent::Thermistors { .. }
        | SupervisorEvent::IrTemperature { .. }
        | SupervisorEvent::LastLine(_) => return None,
    };
    Some(text)
}
