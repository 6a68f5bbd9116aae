//! Error types for the host runtime.

use std::io;
use std::path::PathBuf;

/// Failures of the serial line service.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no serial port found{}", hint_suffix(.hint.as_deref()))]
    NoPortFound { hint: Option<String> },

    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: io::Error,
    },

    #[error("serial port is not open")]
    NotOpen,

    #[error("serial write failed: {0}")]
    Write(#[source] io::Error),

    #[error("failed to spawn serial reader: {0}")]
    Spawn(#[source] io::Error),
}

fn hint_suffix(hint: Option<&str>) -> String {
    hint.map(|hint| format!(" matching `{hint}`"))
        .unwrap_or_default()
}

/// Failures while reading or writing program files.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("program index {0} is outside 1..={max}", max = crate::store::PROGRAM_COUNT)]
    InvalidIndex(u32),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed program file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures raised while wiring up or starting a cook cycle.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("sequence manager was already started")]
    AlreadyStarted,

    #[error("failed to spawn runner thread for {zone}: {source}")]
    Spawn {
        zone: oven_core::ZoneId,
        #[source]
        source: io::Error,
    },
}

/// Reasons a cook session could not be started or controlled.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("door is open")]
    DoorOpen,

    #[error("lost communication with the controller")]
    WatchdogTripped,

    #[error("a cook is already in progress")]
    AlreadyCooking,

    #[error("no cook is in progress")]
    NotCooking,

    #[error("program has nothing to run")]
    NothingToRun,

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failures of an operator shell command.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("{0}")]
    Parse(String),

    #[error("{0}")]
    Program(oven_core::ProgramError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
