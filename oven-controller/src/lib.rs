//! Host runtime for the multi-zone oven.
//!
//! Runs the cooking engine against the appliance controller: a serial line
//! [`transport`], the door and watchdog [`interlock`]s, one [`runner`] thread
//! per zone coordinated by the [`manager`], and the [`supervisor`] that ties
//! telemetry, over-temperature throttling and the link watchdog to a cook
//! session. Observers and timers execute on a single [`dispatch`] context.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod interlock;
pub mod logging;
pub mod manager;
pub mod runner;
pub mod shell;
pub mod store;
pub mod supervisor;
pub mod transport;

use std::sync::Arc;

use oven_core::SequenceCollection;
use parking_lot::Mutex;

use crate::config::{SerialConfig, Settings};
use crate::dispatch::DispatchHandle;
use crate::interlock::InterlockModel;
use crate::transport::{PortOpener, Transport};

/// Process-wide services, built once at startup and passed to whatever needs
/// them.
#[derive(Clone)]
pub struct Appliance {
    pub dispatch: DispatchHandle,
    pub transport: Arc<Transport>,
    pub interlock: Arc<InterlockModel>,
    /// The program currently loaded for editing and cooking.
    pub program: Arc<Mutex<SequenceCollection>>,
    pub settings: Settings,
}

impl Appliance {
    pub fn new(
        dispatch: DispatchHandle,
        serial: SerialConfig,
        opener: impl PortOpener + 'static,
        settings: Settings,
    ) -> Self {
        Self {
            transport: Arc::new(Transport::new(serial, opener, dispatch.clone())),
            interlock: Arc::new(InterlockModel::new(&dispatch)),
            program: Arc::new(Mutex::new(SequenceCollection::zeroed())),
            settings,
            dispatch,
        }
    }
}
