//! Simulated appliance controller.
//!
//! [`SimulatedOven`] sits on the device end of an in-memory link and answers
//! host commands the way the real controller board does: zone power is
//! latched per zone, queries are answered with `KEY=value` lines and door
//! changes are reported unsolicited. Test hooks let a caller heat the
//! thermistors, open the door or make the board go silent.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use oven_controller::transport::DeviceEnd;
use oven_core::protocol::{
    HostCommand, IR_SENSOR_COUNT, LockState, ZoneTarget, parse_host_command,
};
use oven_core::{ZONE_COUNT, ZoneId};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use winnow::ascii::{Caseless, dec_int, space0, space1};
use winnow::combinator::{alt, delimited, preceded, separated_pair};
use winnow::prelude::*;
use winnow::token::literal;

/// Thermistor reading of a cold oven. Lower readings are hotter.
pub const COLD_READING: i32 = 2500;

const RECV_POLL: Duration = Duration::from_millis(20);

/// Observable board state.
#[derive(Clone, Debug, PartialEq)]
pub struct BoardState {
    pub door_open: bool,
    pub thermistors: (i32, i32),
    /// Ignore thermistor queries, as a hung board would.
    pub silent: bool,
    pub fan_on: bool,
    pub lock: LockState,
    pub zones: [u8; ZONE_COUNT],
    pub ir_temperatures: [f32; IR_SENSOR_COUNT as usize],
    pub firmware: String,
    pub hardware: String,
    pub supply_voltages: Vec<f32>,
    pub fan_current: f32,
    /// Every command received, in order.
    pub received: Vec<HostCommand>,
}

impl Default for BoardState {
    fn default() -> Self {
        Self {
            door_open: false,
            thermistors: (COLD_READING, COLD_READING),
            silent: false,
            fan_on: false,
            lock: LockState::Unlocked,
            zones: [0; ZONE_COUNT],
            ir_temperatures: [21.5; IR_SENSOR_COUNT as usize],
            firmware: "2.1.0".into(),
            hardware: "REV-C".into(),
            supply_voltages: vec![12.0, 12.0, 5.0, 3.3, 24.0, 24.0, 5.0, 3.3],
            fan_current: 0.0,
            received: Vec::new(),
        }
    }
}

impl BoardState {
    /// Applies `command` and returns the reply line, if any.
    fn apply(&mut self, command: HostCommand) -> Option<String> {
        self.received.push(command);
        match command {
            HostCommand::SetZone { target, power } => {
                match target {
                    ZoneTarget::All => self.zones = [power; ZONE_COUNT],
                    ZoneTarget::Zone(zone) => self.zones[zone.index()] = power,
                }
                None
            }
            HostCommand::ReadThermistors if self.silent => None,
            HostCommand::ReadThermistors => {
                Some(format!("R={},{}", self.thermistors.0, self.thermistors.1))
            }
            HostCommand::ReadVersion => Some(format!("I={},{}", self.firmware, self.hardware)),
            HostCommand::ReadIrTemperature(sensor) => {
                let value = self
                    .ir_temperatures
                    .get(usize::from(sensor).checked_sub(1)?)?;
                Some(format!("T{sensor}={value:.1}"))
            }
            HostCommand::ReadDoor => Some(door_line(self.door_open)),
            HostCommand::ReadLock => Some(format!("L={}", self.lock.code())),
            HostCommand::SetLock(locked) => {
                self.lock = if locked {
                    LockState::Locked
                } else {
                    LockState::Unlocked
                };
                None
            }
            HostCommand::ReadFan => Some(format!("F={}", u8::from(self.fan_on))),
            HostCommand::SetFan(on) => {
                self.fan_on = on;
                self.fan_current = if on { 0.42 } else { 0.0 };
                None
            }
            HostCommand::ReadSupplyVoltages => {
                let values: Vec<String> =
                    self.supply_voltages.iter().map(|v| format!("{v:.2}")).collect();
                Some(format!("V={}", values.join(",")))
            }
            HostCommand::ReadFanCurrent => Some(format!("P={:.2}", self.fan_current)),
        }
    }
}

fn door_line(open: bool) -> String {
    format!("D={}", u8::from(open))
}

/// Controller board simulated on its own thread.
pub struct SimulatedOven {
    state: Arc<Mutex<BoardState>>,
    device: Arc<DeviceEnd>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SimulatedOven {
    /// Starts answering commands arriving on `device`.
    pub fn spawn(device: DeviceEnd) -> io::Result<Self> {
        Self::with_state(device, BoardState::default())
    }

    pub fn with_state(device: DeviceEnd, state: BoardState) -> io::Result<Self> {
        let state = Arc::new(Mutex::new(state));
        let device = Arc::new(device);
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let state = Arc::clone(&state);
            let device = Arc::clone(&device);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("sim-board".into())
                .spawn(move || serve(&device, &state, &stop))?
        };
        Ok(Self {
            state,
            device,
            stop,
            worker: Some(worker),
        })
    }

    /// Opens or closes the door and reports the change to the host.
    pub fn set_door(&self, open: bool) {
        self.state.lock().door_open = open;
        self.device.send_line(&door_line(open));
    }

    pub fn set_thermistors(&self, r1: i32, r2: i32) {
        self.state.lock().thermistors = (r1, r2);
    }

    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Injects a raw line as if the board had sent it.
    pub fn send_line(&self, line: &str) -> bool {
        self.device.send_line(line)
    }

    #[must_use]
    pub fn zone_power(&self, zone: ZoneId) -> u8 {
        self.state.lock().zones[zone.index()]
    }

    #[must_use]
    pub fn zone_powers(&self) -> [u8; ZONE_COUNT] {
        self.state.lock().zones
    }

    #[must_use]
    pub fn snapshot(&self) -> BoardState {
        self.state.lock().clone()
    }

    /// Applies an operator `sim ...` command and describes the result.
    #[must_use]
    pub fn execute(&self, command: SimCommand) -> String {
        match command {
            SimCommand::Door(open) => {
                self.set_door(open);
                format!("door {}", if open { "opened" } else { "closed" })
            }
            SimCommand::Thermistors(r1, r2) => {
                self.set_thermistors(r1, r2);
                format!("thermistors R={r1},{r2}")
            }
            SimCommand::Silent(silent) => {
                self.set_silent(silent);
                if silent {
                    "board no longer answers thermistor queries".into()
                } else {
                    "board answering again".into()
                }
            }
            SimCommand::Show => {
                let state = self.snapshot();
                let zones: Vec<String> = state.zones.iter().map(u8::to_string).collect();
                format!(
                    "zones [{}] fan {} lock {:?} door {} R={},{}",
                    zones.join(" "),
                    if state.fan_on { "on" } else { "off" },
                    state.lock,
                    if state.door_open { "open" } else { "closed" },
                    state.thermistors.0,
                    state.thermistors.1,
                )
            }
        }
    }

    /// Stops the board thread.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!("board thread panicked");
        }
    }
}

impl Drop for SimulatedOven {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve(device: &DeviceEnd, state: &Mutex<BoardState>, stop: &AtomicBool) {
    let mut pending = Vec::new();
    while !stop.load(Ordering::Acquire) {
        let Some((_, bytes)) = device.recv_raw(RECV_POLL) else {
            continue;
        };
        pending.extend_from_slice(&bytes);
        while let Some(end) = pending.iter().position(|b| *b == b'\r' || *b == b'\n') {
            let frame: Vec<u8> = pending.drain(..=end).collect();
            let line = String::from_utf8_lossy(&frame[..end]);
            if line.trim().is_empty() {
                continue;
            }
            let command = match parse_host_command(&line) {
                Ok(command) => command,
                Err(err) => {
                    warn!(line = %line, %err, "board ignored command");
                    continue;
                }
            };
            trace!(%command, "board rx");
            let reply = state.lock().apply(command);
            if let Some(reply) = reply {
                debug!(reply, "board tx");
                device.send_line(&reply);
            }
        }
    }
}

/// Operator commands that drive the simulated board.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SimCommand {
    Door(bool),
    Thermistors(i32, i32),
    Silent(bool),
    Show,
}

pub const SIM_USAGE: &str = "sim door open|closed | sim temp R1 R2 | sim silent on|off | sim show";

impl SimCommand {
    /// Parses the arguments following `sim`.
    pub fn parse(args: &str) -> Result<Self, String> {
        sim_command
            .parse(args)
            .map_err(|_| format!("usage: {SIM_USAGE}"))
    }
}

fn sim_command(input: &mut &str) -> ModalResult<SimCommand> {
    delimited(
        space0,
        alt((
            preceded((literal(Caseless("door")), space1), door_state).map(SimCommand::Door),
            preceded((literal(Caseless("temp")), space1), readings)
                .map(|(r1, r2)| SimCommand::Thermistors(r1, r2)),
            preceded((literal(Caseless("silent")), space1), on_off).map(SimCommand::Silent),
            literal(Caseless("show")).value(SimCommand::Show),
        )),
        space0,
    )
    .parse_next(input)
}

fn door_state(input: &mut &str) -> ModalResult<bool> {
    alt((
        literal(Caseless("open")).value(true),
        literal(Caseless("closed")).value(false),
        literal(Caseless("close")).value(false),
    ))
    .parse_next(input)
}

fn readings(input: &mut &str) -> ModalResult<(i32, i32)> {
    separated_pair(dec_int::<_, i32, _>, space1, dec_int::<_, i32, _>).parse_next(input)
}

fn on_off(input: &mut &str) -> ModalResult<bool> {
    alt((
        literal(Caseless("on")).value(true),
        literal(Caseless("off")).value(false),
    ))
    .parse_next(input)
}
