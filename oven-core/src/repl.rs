//! Operator command grammar.
//!
//! One command per line: a case-insensitive keyword followed by
//! whitespace-separated arguments. The grammar is shared by the controller
//! shell and the emulator front-end; execution lives with the host.

use core::fmt;
use core::time::Duration;

use winnow::ascii::{Caseless, dec_uint, float, space1};
use winnow::combinator::{alt, opt, preceded};
use winnow::prelude::*;
use winnow::token::{literal, rest};

use crate::program::{MAX_POWER, PHASE_COUNT, Step, ZoneId};

/// Parsed operator command.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ReplCommand<'a> {
    Load { index: u32 },
    Save { index: u32, description: Option<&'a str> },
    Show,
    List,
    /// `set ZONE PHASE POWER SECONDS`, phase numbered from 1.
    Set { zone: ZoneId, phase: usize, step: Step },
    Run,
    Manual { duration: Duration, power: u8 },
    Pause,
    Resume,
    Stop,
    Status,
    Scale(f32),
    Door,
    Fan(bool),
    Lock(bool),
    Version,
    Help,
    Quit,
}

/// Why a line could not be parsed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReplError<'a> {
    Empty,
    UnknownCommand(&'a str),
    /// Keyword recognized but arguments malformed; carries the usage line.
    Usage(&'static str),
}

impl fmt::Display for ReplError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplError::Empty => f.write_str("empty command"),
            ReplError::UnknownCommand(keyword) => {
                write!(f, "unknown command `{keyword}`, try `help`")
            }
            ReplError::Usage(usage) => write!(f, "usage: {usage}"),
        }
    }
}

type ArgParser = for<'a> fn(&mut &'a str) -> ModalResult<ReplCommand<'a>>;

#[derive(Clone, Copy)]
enum Arguments {
    /// The keyword alone is the whole command.
    Bare(ReplCommand<'static>),
    Parsed(ArgParser),
}

/// A keyword, its usage line and how its arguments are read.
#[derive(Clone, Copy)]
pub struct CommandEntry {
    pub keyword: &'static str,
    pub usage: &'static str,
    arguments: Arguments,
}

impl fmt::Debug for CommandEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandEntry")
            .field("keyword", &self.keyword)
            .finish_non_exhaustive()
    }
}

const fn bare(keyword: &'static str, command: ReplCommand<'static>) -> CommandEntry {
    CommandEntry {
        keyword,
        usage: keyword,
        arguments: Arguments::Bare(command),
    }
}

const fn with_args(keyword: &'static str, usage: &'static str, parse: ArgParser) -> CommandEntry {
    CommandEntry {
        keyword,
        usage,
        arguments: Arguments::Parsed(parse),
    }
}

/// Every command, in help order.
pub const COMMANDS: [CommandEntry; 18] = [
    with_args("load", "load N", load),
    with_args("save", "save N [description]", save),
    bare("show", ReplCommand::Show),
    bare("list", ReplCommand::List),
    with_args("set", "set ZONE PHASE POWER SECONDS", set),
    bare("run", ReplCommand::Run),
    with_args("manual", "manual SECONDS POWER", manual),
    bare("pause", ReplCommand::Pause),
    bare("resume", ReplCommand::Resume),
    bare("stop", ReplCommand::Stop),
    bare("status", ReplCommand::Status),
    with_args("scale", "scale FACTOR", scale),
    bare("door", ReplCommand::Door),
    with_args("fan", "fan on|off", fan),
    with_args("lock", "lock on|off", lock),
    bare("version", ReplCommand::Version),
    bare("help", ReplCommand::Help),
    bare("quit", ReplCommand::Quit),
];

/// Parses one operator line.
pub fn parse_command(line: &str) -> Result<ReplCommand<'_>, ReplError<'_>> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ReplError::Empty);
    }
    let (keyword, args) = line
        .split_once(char::is_whitespace)
        .map_or((line, ""), |(keyword, args)| (keyword, args.trim_start()));
    let lookup = if keyword.eq_ignore_ascii_case("exit") {
        "quit"
    } else {
        keyword
    };
    let entry = COMMANDS
        .iter()
        .find(|entry| entry.keyword.eq_ignore_ascii_case(lookup))
        .ok_or(ReplError::UnknownCommand(keyword))?;
    match entry.arguments {
        Arguments::Bare(command) if args.is_empty() => Ok(command),
        Arguments::Bare(_) => Err(ReplError::Usage(entry.usage)),
        Arguments::Parsed(mut parser) => parser
            .parse(args)
            .map_err(|_| ReplError::Usage(entry.usage)),
    }
}

/// Usage lines for `help`.
pub fn usage_lines() -> impl Iterator<Item = &'static str> {
    COMMANDS.iter().map(|entry| entry.usage)
}

fn program_index(input: &mut &str) -> ModalResult<u32> {
    dec_uint.parse_next(input)
}

fn zone(input: &mut &str) -> ModalResult<ZoneId> {
    dec_uint::<_, u8, _>.verify_map(ZoneId::new).parse_next(input)
}

fn phase(input: &mut &str) -> ModalResult<usize> {
    dec_uint::<_, u8, _>
        .verify(|phase: &u8| (1..=PHASE_COUNT).contains(&usize::from(*phase)))
        .map(|phase| usize::from(phase) - 1)
        .parse_next(input)
}

fn power(input: &mut &str) -> ModalResult<u8> {
    dec_uint::<_, u8, _>
        .verify(|power: &u8| *power <= MAX_POWER)
        .parse_next(input)
}

fn seconds(input: &mut &str) -> ModalResult<f32> {
    float
        .verify(|secs: &f32| secs.is_finite() && *secs >= 0.0)
        .parse_next(input)
}

fn scale_factor(input: &mut &str) -> ModalResult<f32> {
    float
        .verify(|scale: &f32| (0.0..=1.0).contains(scale))
        .parse_next(input)
}

fn switch(input: &mut &str) -> ModalResult<bool> {
    alt((
        alt((literal(Caseless("on")), literal("1"))).value(true),
        alt((literal(Caseless("off")), literal("0"))).value(false),
    ))
    .parse_next(input)
}

fn load<'a>(input: &mut &'a str) -> ModalResult<ReplCommand<'a>> {
    program_index
        .map(|index| ReplCommand::Load { index })
        .parse_next(input)
}

fn save<'a>(input: &mut &'a str) -> ModalResult<ReplCommand<'a>> {
    (program_index, opt(preceded(space1, rest)))
        .map(|(index, description)| ReplCommand::Save {
            index,
            description: description
                .map(str::trim)
                .filter(|description| !description.is_empty()),
        })
        .parse_next(input)
}

fn set<'a>(input: &mut &'a str) -> ModalResult<ReplCommand<'a>> {
    (
        zone,
        preceded(space1, phase),
        preceded(space1, power),
        preceded(space1, seconds),
    )
        .map(|(zone, phase, power, secs)| ReplCommand::Set {
            zone,
            phase,
            step: Step::new(power, secs),
        })
        .parse_next(input)
}

fn manual<'a>(input: &mut &'a str) -> ModalResult<ReplCommand<'a>> {
    (
        seconds.verify_map(|secs| Duration::try_from_secs_f32(secs).ok()),
        preceded(space1, power),
    )
        .map(|(duration, power)| ReplCommand::Manual { duration, power })
        .parse_next(input)
}

fn scale<'a>(input: &mut &'a str) -> ModalResult<ReplCommand<'a>> {
    scale_factor.map(ReplCommand::Scale).parse_next(input)
}

fn fan<'a>(input: &mut &'a str) -> ModalResult<ReplCommand<'a>> {
    switch.map(ReplCommand::Fan).parse_next(input)
}

fn lock<'a>(input: &mut &'a str) -> ModalResult<ReplCommand<'a>> {
    switch.map(ReplCommand::Lock).parse_next(input)
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    fn parse_ok(line: &str) -> ReplCommand<'_> {
        parse_command(line).expect("command parses")
    }

    #[test]
    fn keywords_are_case_insensitive() {
        assert_eq!(parse_ok("RUN"), ReplCommand::Run);
        assert_eq!(parse_ok("  Status  "), ReplCommand::Status);
        assert_eq!(parse_ok("exit"), ReplCommand::Quit);
    }

    #[test]
    fn parses_program_slots() {
        assert_eq!(parse_ok("load 12"), ReplCommand::Load { index: 12 });
        assert_eq!(
            parse_ok("save 3 Sunday   roast "),
            ReplCommand::Save {
                index: 3,
                description: Some("Sunday   roast"),
            }
        );
        assert_eq!(
            parse_ok("save 3"),
            ReplCommand::Save {
                index: 3,
                description: None,
            }
        );
    }

    #[test]
    fn set_uses_one_based_phases() {
        assert_eq!(
            parse_ok("set 8 4 75 12.5"),
            ReplCommand::Set {
                zone: ZoneId::new(8).expect("zone"),
                phase: 3,
                step: Step::new(75, 12.5),
            }
        );
        assert_eq!(
            parse_command("set 9 1 50 10"),
            Err(ReplError::Usage("set ZONE PHASE POWER SECONDS"))
        );
        assert!(parse_command("set 1 0 50 10").is_err());
        assert!(parse_command("set 1 5 50 10").is_err());
        assert!(parse_command("set 1 1 101 10").is_err());
    }

    #[test]
    fn parses_manual_and_scale() {
        assert_eq!(
            parse_ok("manual 90 60"),
            ReplCommand::Manual {
                duration: Duration::from_secs(90),
                power: 60,
            }
        );
        assert_eq!(parse_ok("scale 0.5"), ReplCommand::Scale(0.5));
        assert_eq!(parse_command("scale 1.5"), Err(ReplError::Usage("scale FACTOR")));
    }

    #[test]
    fn parses_switches() {
        assert_eq!(parse_ok("fan ON"), ReplCommand::Fan(true));
        assert_eq!(parse_ok("fan 0"), ReplCommand::Fan(false));
        assert_eq!(parse_ok("lock on"), ReplCommand::Lock(true));
        assert_eq!(parse_command("lock maybe"), Err(ReplError::Usage("lock on|off")));
    }

    #[test]
    fn trailing_arguments_are_rejected() {
        assert_eq!(parse_command("run now"), Err(ReplError::Usage("run")));
        assert_eq!(parse_command("load 1 2"), Err(ReplError::Usage("load N")));
    }

    #[test]
    fn unknown_and_empty_lines() {
        assert_eq!(parse_command("   "), Err(ReplError::Empty));
        assert_eq!(
            parse_command("bake 10"),
            Err(ReplError::UnknownCommand("bake"))
        );
    }

    #[test]
    fn every_command_has_usage() {
        assert_eq!(usage_lines().count(), COMMANDS.len());
        assert!(usage_lines().all(|usage| !usage.is_empty()));
    }
}
