//! Line protocol spoken with the appliance controller.
//!
//! Host commands are short ASCII lines (`Z03=075`, `R`, `T2`, ...) terminated
//! by a carriage return on the wire. Replies arrive one per line as
//! `KEY=value` pairs. Both directions are parsed with `winnow` so the
//! emulator and the host share a single grammar.

use core::fmt::{self, Write as _};

use heapless::{String, Vec};
use winnow::ascii::{Caseless, dec_int, dec_uint, float, space0};
use winnow::combinator::{alt, delimited, fail, opt, preceded, separated_pair};
use winnow::prelude::*;
use winnow::token::{any, literal, one_of, rest, take_till, take_while};

use crate::program::{MAX_POWER, ZoneId};

/// Number of IR temperature sensors addressable with `Tn`.
pub const IR_SENSOR_COUNT: u8 = 4;
/// Number of diagnostic voltages reported by `V=`.
pub const SUPPLY_RAIL_COUNT: usize = 8;
/// Longest encoded host command (`Z00=000`).
pub const MAX_COMMAND_LEN: usize = 8;

/// Zone addressed by a `Znn=ppp` command.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ZoneTarget {
    /// `Z00`: every zone at once.
    All,
    Zone(ZoneId),
}

impl ZoneTarget {
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            ZoneTarget::All => 0,
            ZoneTarget::Zone(zone) => zone.number(),
        }
    }

    fn from_number(number: u8) -> Option<Self> {
        if number == 0 {
            Some(ZoneTarget::All)
        } else {
            ZoneId::new(number).map(ZoneTarget::Zone)
        }
    }
}

/// Commands sent from the host to the controller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HostCommand {
    SetZone { target: ZoneTarget, power: u8 },
    ReadThermistors,
    ReadVersion,
    ReadIrTemperature(u8),
    ReadDoor,
    ReadLock,
    SetLock(bool),
    ReadFan,
    SetFan(bool),
    ReadSupplyVoltages,
    ReadFanCurrent,
}

impl HostCommand {
    /// Power command for one zone, clamped to the controller's range.
    #[must_use]
    pub fn set_zone(zone: ZoneId, power: u8) -> Self {
        HostCommand::SetZone {
            target: ZoneTarget::Zone(zone),
            power: power.min(MAX_POWER),
        }
    }

    /// Broadcast that de-energizes every zone.
    #[must_use]
    pub const fn all_zones_off() -> Self {
        HostCommand::SetZone {
            target: ZoneTarget::All,
            power: 0,
        }
    }

    /// Wire form without the line terminator.
    #[must_use]
    pub fn encode(&self) -> String<MAX_COMMAND_LEN> {
        let mut line = String::new();
        // Every variant fits MAX_COMMAND_LEN.
        let _ = write!(line, "{self}");
        line
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostCommand::SetZone { target, power } => {
                write!(f, "Z{:02}={:03}", target.number(), power)
            }
            HostCommand::ReadThermistors => f.write_str("R"),
            HostCommand::ReadVersion => f.write_str("I"),
            HostCommand::ReadIrTemperature(sensor) => write!(f, "T{sensor}"),
            HostCommand::ReadDoor => f.write_str("D"),
            HostCommand::ReadLock => f.write_str("L"),
            HostCommand::SetLock(locked) => write!(f, "L={}", u8::from(*locked)),
            HostCommand::ReadFan => f.write_str("F"),
            HostCommand::SetFan(on) => write!(f, "F={}", u8::from(*on)),
            HostCommand::ReadSupplyVoltages => f.write_str("V"),
            HostCommand::ReadFanCurrent => f.write_str("P"),
        }
    }
}

/// Door lock state reported by `L=`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockState {
    Unlocked,
    Locked,
    Error,
}

impl LockState {
    #[must_use]
    pub const fn code(self) -> char {
        match self {
            LockState::Unlocked => '0',
            LockState::Locked => '1',
            LockState::Error => '3',
        }
    }
}

/// Reply lines received from the controller.
#[derive(Clone, Debug, PartialEq)]
pub enum Telemetry<'a> {
    Door { open: bool },
    Thermistors { r1: i32, r2: i32 },
    IrTemperature { sensor: u8, value: f32 },
    Versions { firmware: &'a str, hardware: &'a str },
    Fan { on: bool },
    DoorLock(LockState),
    SupplyVoltages(Vec<f32, SUPPLY_RAIL_COUNT>),
    FanCurrent(f32),
}

/// Errors raised when a line does not match the protocol grammar.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProtocolError {
    Empty,
    Unrecognized,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Empty => f.write_str("empty line"),
            ProtocolError::Unrecognized => f.write_str("unrecognized line"),
        }
    }
}

/// Parses a host command as received by the controller.
pub fn parse_host_command(line: &str) -> Result<HostCommand, ProtocolError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ProtocolError::Empty);
    }
    host_command
        .parse(line)
        .map_err(|_| ProtocolError::Unrecognized)
}

/// Parses one reply line from the controller.
///
/// Lines that match no reply form, including the `T0` status echo, yield
/// [`ProtocolError::Unrecognized`] and are expected to be dropped.
pub fn parse_telemetry(line: &str) -> Result<Telemetry<'_>, ProtocolError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ProtocolError::Empty);
    }
    telemetry.parse(line).map_err(|_| ProtocolError::Unrecognized)
}

/// Recognizes a door-state line in either encoding and returns `true` when
/// it reports the door open.
///
/// Accepts `D=1`/`D=0` and `DOOR=<value>` where `OPEN`, `O`, `1` and `TRUE`
/// mean open, case-insensitively. Only the prefix has to match; trailing
/// text after the state character of a `D=` line is ignored.
#[must_use]
pub fn parse_door_line(line: &str) -> Option<bool> {
    let mut input = line.trim();
    door_state.parse_next(&mut input).ok()
}

fn door_keyword_is_open(value: &str) -> bool {
    ["OPEN", "O", "1", "TRUE"]
        .iter()
        .any(|keyword| value.trim().eq_ignore_ascii_case(keyword))
}

fn door_state(input: &mut &str) -> ModalResult<bool> {
    alt((
        preceded(literal(Caseless("DOOR=")), rest).map(door_keyword_is_open),
        preceded(literal(Caseless("D=")), any).map(|state: char| state == '1'),
    ))
    .parse_next(input)
}

fn switch(input: &mut &str) -> ModalResult<bool> {
    one_of(['0', '1']).map(|state: char| state == '1').parse_next(input)
}

fn ir_sensor(input: &mut &str) -> ModalResult<u8> {
    dec_uint::<_, u8, _>
        .verify(|sensor: &u8| (1..=IR_SENSOR_COUNT).contains(sensor))
        .parse_next(input)
}

fn set_zone(input: &mut &str) -> ModalResult<HostCommand> {
    let zone = take_while(2, |c: char| c.is_ascii_digit())
        .parse_to::<u8>()
        .verify_map(ZoneTarget::from_number);
    let power = take_while(3, |c: char| c.is_ascii_digit())
        .parse_to::<u8>()
        .verify(|power: &u8| *power <= MAX_POWER);
    preceded('Z', separated_pair(zone, '=', power))
        .map(|(target, power)| HostCommand::SetZone { target, power })
        .parse_next(input)
}

fn host_command(input: &mut &str) -> ModalResult<HostCommand> {
    alt((
        set_zone,
        preceded('T', ir_sensor).map(HostCommand::ReadIrTemperature),
        preceded("L=", switch).map(HostCommand::SetLock),
        preceded("F=", switch).map(HostCommand::SetFan),
        'R'.value(HostCommand::ReadThermistors),
        'I'.value(HostCommand::ReadVersion),
        'D'.value(HostCommand::ReadDoor),
        'L'.value(HostCommand::ReadLock),
        'F'.value(HostCommand::ReadFan),
        'V'.value(HostCommand::ReadSupplyVoltages),
        'P'.value(HostCommand::ReadFanCurrent),
    ))
    .parse_next(input)
}

fn padded_int(input: &mut &str) -> ModalResult<i32> {
    delimited(space0, dec_int, space0).parse_next(input)
}

fn padded_float(input: &mut &str) -> ModalResult<f32> {
    delimited(space0, float, space0).parse_next(input)
}

fn thermistors<'a>(input: &mut &'a str) -> ModalResult<Telemetry<'a>> {
    preceded("R=", separated_pair(padded_int, ',', padded_int))
        .map(|(r1, r2)| Telemetry::Thermistors { r1, r2 })
        .parse_next(input)
}

fn ir_temperature<'a>(input: &mut &'a str) -> ModalResult<Telemetry<'a>> {
    preceded('T', separated_pair(ir_sensor, '=', padded_float))
        .map(|(sensor, value)| Telemetry::IrTemperature { sensor, value })
        .parse_next(input)
}

fn versions<'a>(input: &mut &'a str) -> ModalResult<Telemetry<'a>> {
    preceded(
        "I=",
        separated_pair(take_till(0.., |c: char| c == ','), ',', rest),
    )
    .map(|(firmware, hardware): (&'a str, &'a str)| Telemetry::Versions {
        firmware: firmware.trim(),
        hardware: hardware.trim(),
    })
    .parse_next(input)
}

fn door_lock<'a>(input: &mut &'a str) -> ModalResult<Telemetry<'a>> {
    preceded("L=", one_of(['0', '1', '3']))
        .map(|code: char| {
            Telemetry::DoorLock(match code {
                '1' => LockState::Locked,
                '3' => LockState::Error,
                _ => LockState::Unlocked,
            })
        })
        .parse_next(input)
}

fn supply_voltages<'a>(input: &mut &'a str) -> ModalResult<Telemetry<'a>> {
    "V=".parse_next(input)?;
    let mut values = Vec::new();
    loop {
        let value = padded_float.parse_next(input)?;
        if values.push(value).is_err() {
            return fail.parse_next(input);
        }
        if opt(',').parse_next(input)?.is_none() {
            break;
        }
    }
    Ok(Telemetry::SupplyVoltages(values))
}

fn telemetry<'a>(input: &mut &'a str) -> ModalResult<Telemetry<'a>> {
    alt((
        thermistors,
        ir_temperature,
        versions,
        door_lock,
        supply_voltages,
        preceded("F=", switch).map(|on| Telemetry::Fan { on }),
        preceded("P=", padded_float).map(Telemetry::FanCurrent),
        door_state.map(|open| Telemetry::Door { open }),
    ))
    .parse_next(input)
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    fn zone(number: u8) -> ZoneId {
        ZoneId::new(number).expect("zone in range")
    }

    #[test]
    fn zone_commands_are_zero_padded() {
        assert_eq!(HostCommand::set_zone(zone(3), 75).encode().as_str(), "Z03=075");
        assert_eq!(HostCommand::set_zone(zone(8), 100).encode().as_str(), "Z08=100");
        assert_eq!(HostCommand::set_zone(zone(1), 250).encode().as_str(), "Z01=100");
        assert_eq!(HostCommand::all_zones_off().encode().as_str(), "Z00=000");
    }

    #[test]
    fn query_commands_encode_as_single_letters() {
        assert_eq!(HostCommand::ReadThermistors.encode().as_str(), "R");
        assert_eq!(HostCommand::ReadIrTemperature(4).encode().as_str(), "T4");
        assert_eq!(HostCommand::SetFan(false).encode().as_str(), "F=0");
        assert_eq!(HostCommand::SetLock(true).encode().as_str(), "L=1");
    }

    #[test]
    fn host_commands_parse_back() {
        assert_eq!(
            parse_host_command("Z05=042"),
            Ok(HostCommand::set_zone(zone(5), 42))
        );
        assert_eq!(
            parse_host_command("Z00=000\r"),
            Ok(HostCommand::all_zones_off())
        );
        assert_eq!(parse_host_command("L"), Ok(HostCommand::ReadLock));
        assert_eq!(parse_host_command("L=1"), Ok(HostCommand::SetLock(true)));
        assert_eq!(parse_host_command("T3"), Ok(HostCommand::ReadIrTemperature(3)));
        assert_eq!(parse_host_command("P"), Ok(HostCommand::ReadFanCurrent));
    }

    #[test]
    fn host_command_rejects_out_of_range_values() {
        assert_eq!(parse_host_command("Z09=010"), Err(ProtocolError::Unrecognized));
        assert_eq!(parse_host_command("Z01=101"), Err(ProtocolError::Unrecognized));
        assert_eq!(parse_host_command("Z1=10"), Err(ProtocolError::Unrecognized));
        assert_eq!(parse_host_command("T5"), Err(ProtocolError::Unrecognized));
        assert_eq!(parse_host_command("F=2"), Err(ProtocolError::Unrecognized));
        assert_eq!(parse_host_command("  "), Err(ProtocolError::Empty));
    }

    #[test]
    fn thermistor_replies_parse_signed_values() {
        assert_eq!(
            parse_telemetry("R=1523,-7"),
            Ok(Telemetry::Thermistors { r1: 1523, r2: -7 })
        );
        assert_eq!(
            parse_telemetry("R= 2000 , 1999 "),
            Ok(Telemetry::Thermistors { r1: 2000, r2: 1999 })
        );
        assert_eq!(parse_telemetry("R=12a,4"), Err(ProtocolError::Unrecognized));
        assert_eq!(parse_telemetry("R=12"), Err(ProtocolError::Unrecognized));
    }

    #[test]
    fn ir_replies_ignore_sensor_zero() {
        assert_eq!(
            parse_telemetry("T2=185.5"),
            Ok(Telemetry::IrTemperature {
                sensor: 2,
                value: 185.5
            })
        );
        assert_eq!(parse_telemetry("T0=1"), Err(ProtocolError::Unrecognized));
    }

    #[test]
    fn diagnostics_replies_are_decoded() {
        assert_eq!(
            parse_telemetry("I=1.4.2,B7"),
            Ok(Telemetry::Versions {
                firmware: "1.4.2",
                hardware: "B7"
            })
        );
        assert_eq!(parse_telemetry("F=1"), Ok(Telemetry::Fan { on: true }));
        assert_eq!(
            parse_telemetry("L=3"),
            Ok(Telemetry::DoorLock(LockState::Error))
        );
        assert_eq!(parse_telemetry("P=3.25"), Ok(Telemetry::FanCurrent(3.25)));

        let Ok(Telemetry::SupplyVoltages(values)) =
            parse_telemetry("V=12.1,12.0,5.01,3.29,24,24,5,3.3")
        else {
            panic!("expected supply voltages");
        };
        assert_eq!(values.len(), SUPPLY_RAIL_COUNT);
        assert_eq!(values[2], 5.01);
        assert_eq!(
            parse_telemetry("V=1,2,3,4,5,6,7,8,9"),
            Err(ProtocolError::Unrecognized)
        );
    }

    #[test]
    fn door_lines_accept_both_encodings() {
        assert_eq!(parse_door_line("D=1"), Some(true));
        assert_eq!(parse_door_line("D=0"), Some(false));
        assert_eq!(parse_door_line("d=1"), Some(true));
        assert_eq!(parse_door_line("DOOR=OPEN"), Some(true));
        assert_eq!(parse_door_line("door=o"), Some(true));
        assert_eq!(parse_door_line("Door=True"), Some(true));
        assert_eq!(parse_door_line("DOOR=CLOSED"), Some(false));
        assert_eq!(parse_door_line("D="), None);
        assert_eq!(parse_door_line("R=1,2"), None);

        assert_eq!(parse_telemetry("D=1"), Ok(Telemetry::Door { open: true }));
        assert_eq!(parse_telemetry("D=10"), Err(ProtocolError::Unrecognized));
    }
}
