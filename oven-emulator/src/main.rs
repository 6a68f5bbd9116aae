use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{Receiver, TryRecvError};
use oven_controller::Appliance;
use oven_controller::config::{SerialConfig, Settings};
use oven_controller::dispatch::Dispatcher;
use oven_controller::logging;
use oven_controller::shell::{Reply, Shell, describe_event};
use oven_controller::store::ProgramStore;
use oven_controller::supervisor::{Supervisor, SupervisorConfig};
use oven_controller::transport::MemoryPort;
use oven_emulator::{SIM_USAGE, SimCommand, SimulatedOven};

/// Runs the controller shell against a simulated oven board.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Directory holding the numbered program files.
    #[arg(long, default_value = "programs")]
    programs: PathBuf,
    /// Settings file.
    #[arg(long, default_value = "settings.alt")]
    settings: PathBuf,
    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "warn")]
    log: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log);

    let (port, device) = MemoryPort::pair("sim0");
    let oven = SimulatedOven::spawn(device).context("failed to start the simulated board")?;

    let mut dispatcher = Dispatcher::new();
    let appliance = Appliance::new(
        dispatcher.handle(),
        SerialConfig::default(),
        port,
        Settings::load_or_default(&args.settings),
    );
    appliance
        .transport
        .start()
        .context("failed to open the simulated link")?;

    let supervisor = Supervisor::attach(
        &appliance,
        SupervisorConfig::from_settings(&appliance.settings),
        Arc::new(|event| {
            if let Some(text) = describe_event(event) {
                println!("{text}");
            }
        }),
    );
    let mut shell = Shell::new(appliance, ProgramStore::new(args.programs), supervisor);

    let lines = spawn_stdin_reader().context("failed to start the input reader")?;
    println!("Oven emulator ready. Type `help` for commands, `sim` to drive the board.");
    prompt()?;

    loop {
        dispatcher.run_once(Duration::from_millis(20));
        let line = match lines.try_recv() {
            Ok(line) => line,
            Err(TryRecvError::Empty) => continue,
            Err(TryRecvError::Disconnected) => break,
        };
        let trimmed = line.trim();
        if let Some(args) = sim_args(trimmed) {
            match SimCommand::parse(args) {
                Ok(command) => println!("{}", oven.execute(command)),
                Err(usage) => println!("{usage}"),
            }
        } else if !trimmed.is_empty() {
            match shell.execute_line(trimmed) {
                Ok(Reply::Text(text)) => println!("{text}"),
                Ok(Reply::Quit) => break,
                Err(err) => println!("error: {err}"),
            }
        }
        prompt()?;
    }

    if shell.supervisor().is_cooking() {
        let _ = shell.execute_line("stop");
    }
    dispatcher.run_until_idle();
    println!("Session closed.");
    Ok(())
}

fn sim_args(line: &str) -> Option<&str> {
    let (keyword, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    if keyword.eq_ignore_ascii_case("sim") {
        Some(rest.trim())
    } else {
        None
    }
}

fn prompt() -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    write!(stdout, "> ")?;
    stdout.flush()
}

fn spawn_stdin_reader() -> io::Result<Receiver<String>> {
    let (tx, rx) = crossbeam_channel::unbounded();
    thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })?;
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_prefix_is_case_insensitive() {
        assert_eq!(sim_args("SIM door open"), Some("door open"));
        assert_eq!(sim_args("sim"), Some(""));
        assert_eq!(sim_args("simulate"), None);
        assert_eq!(SimCommand::parse(""), Err(format!("usage: {SIM_USAGE}")));
    }
}
