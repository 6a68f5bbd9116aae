use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::TryRecvError;
use oven_controller::Appliance;
use oven_controller::config::{SerialConfig, Settings};
use oven_controller::dispatch::Dispatcher;
use oven_controller::logging;
use oven_controller::shell::{Reply, Shell, describe_event};
use oven_controller::store::ProgramStore;
use oven_controller::supervisor::{Supervisor, SupervisorConfig};
use oven_controller::transport::SystemPorts;
use tracing::info;

/// Drives the oven controller over its serial link.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Substring of the serial port name or USB description to use.
    #[arg(long)]
    port: Option<String>,
    /// Directory holding the numbered program files.
    #[arg(long, default_value = "programs")]
    programs: PathBuf,
    /// Settings file.
    #[arg(long, default_value = "settings.alt")]
    settings: PathBuf,
    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log: String,
    /// Minimum spacing between serial writes, in milliseconds.
    #[arg(long, default_value_t = 0)]
    min_send_interval_ms: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log);

    let settings = Settings::load_or_default(&args.settings);
    let serial = SerialConfig {
        port_hint: args.port,
        min_send_interval: Duration::from_millis(args.min_send_interval_ms),
        ..SerialConfig::default()
    };

    let mut dispatcher = Dispatcher::new();
    let appliance = Appliance::new(dispatcher.handle(), serial, SystemPorts, settings);
    appliance
        .transport
        .start()
        .context("failed to open the controller port")?;
    info!(port = ?appliance.transport.port_name(), "controller connected");

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
    println!("Oven controller ready. Type `help` for commands or `quit` to exit.");
    prompt()?;

    loop {
        dispatcher.run_once(Duration::from_millis(20));
        match lines.try_recv() {
            Ok(line) => {
                if line.trim().is_empty() {
                    prompt()?;
                    continue;
                }
                match shell.execute_line(&line) {
                    Ok(Reply::Text(text)) => println!("{text}"),
                    Ok(Reply::Quit) => break,
                    Err(err) => println!("error: {err}"),
                }
                prompt()?;
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                if shell.supervisor().is_cooking() {
                    let _ = shell.execute_line("stop");
                }
                break;
            }
        }
    }

    // Flush the zone-off and fan commands queued by a final stop.
    dispatcher.run_until_idle();
    println!("Session closed.");
    Ok(())
}

fn prompt() -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    write!(stdout, "> ")?;
    stdout.flush()
}

fn spawn_stdin_reader() -> io::Result<crossbeam_channel::Receiver<String>> {
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
