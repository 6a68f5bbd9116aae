//! Serial line service.
//!
//! [`Transport`] owns the link to the appliance controller. A dedicated
//! reader thread frames incoming bytes into lines and hands each line to the
//! registered listeners through the dispatcher; writes go through [`Transport::send`],
//! which serializes callers and enforces a minimum spacing between lines.

mod memory;
mod serial;

use std::io::{self, ErrorKind, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use oven_core::protocol::HostCommand;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::SerialConfig;
use crate::dispatch::DispatchHandle;
use crate::error::TransportError;

pub use memory::{DeviceEnd, MemoryPort};
pub use serial::{SystemPorts, pick_port};

/// Callback invoked with every received line.
pub type LineListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Pause after a transient read error before retrying.
const READ_BACKOFF: Duration = Duration::from_millis(50);
/// Upper bound on waiting for the reader thread during [`Transport::stop`].
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Incoming lines longer than this are discarded.
const MAX_LINE_LEN: usize = 1024;

/// An opened link split into independently owned halves.
pub struct SerialLink {
    pub name: String,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

/// Opens the link described by a [`SerialConfig`].
pub trait PortOpener: Send + Sync {
    fn open(&self, config: &SerialConfig) -> Result<SerialLink, TransportError>;
}

impl<F> PortOpener for F
where
    F: Fn(&SerialConfig) -> Result<SerialLink, TransportError> + Send + Sync,
{
    fn open(&self, config: &SerialConfig) -> Result<SerialLink, TransportError> {
        self(config)
    }
}

#[derive(Default)]
struct IoState {
    writer: Option<Box<dyn Write + Send>>,
    port_name: Option<String>,
    last_send: Option<Instant>,
    /// Bumped on every successful open; a reader only tears down its own link.
    generation: u64,
}

#[derive(Default)]
struct Lifecycle {
    reader: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

/// Thread-safe line transport to the appliance controller.
pub struct Transport {
    config: SerialConfig,
    opener: Box<dyn PortOpener>,
    dispatch: DispatchHandle,
    io: Arc<Mutex<IoState>>,
    lifecycle: Mutex<Lifecycle>,
    listeners: Arc<RwLock<Vec<LineListener>>>,
}

impl Transport {
    pub fn new(
        config: SerialConfig,
        opener: impl PortOpener + 'static,
        dispatch: DispatchHandle,
    ) -> Self {
        Self {
            config,
            opener: Box::new(opener),
            dispatch,
            io: Arc::new(Mutex::new(IoState::default())),
            lifecycle: Mutex::new(Lifecycle::default()),
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    /// Opens the port and spawns the reader thread. No-op when already open.
    pub fn start(&self) -> Result<(), TransportError> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle
            .reader
            .as_ref()
            .is_some_and(|reader| !reader.is_finished())
        {
            return Ok(());
        }
        if let Some(stale) = lifecycle.reader.take()
            && stale.join().is_err()
        {
            error!("serial reader thread panicked");
        }

        let link = self.opener.open(&self.config)?;
        let generation = {
            let mut io = self.io.lock();
            io.generation += 1;
            io.writer = Some(link.writer);
            io.port_name = Some(link.name.clone());
            io.last_send = None;
            io.generation
        };

        let stop = Arc::new(AtomicBool::new(false));
        let worker = ReaderWorker {
            reader: link.reader,
            stop: Arc::clone(&stop),
            listeners: Arc::clone(&self.listeners),
            dispatch: self.dispatch.clone(),
            io: Arc::clone(&self.io),
            generation,
        };

        let spawned = thread::Builder::new()
            .name("serial-reader".into())
            .spawn(move || worker.run());
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                let mut io = self.io.lock();
                io.writer = None;
                io.port_name = None;
                return Err(TransportError::Spawn(err));
            }
        };

        lifecycle.reader = Some(handle);
        lifecycle.stop = stop;
        info!(port = %link.name, baud = self.config.baud_rate, "serial port opened");
        Ok(())
    }

    /// Stops the reader thread and closes the port. Idempotent.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.stop.store(true, Ordering::SeqCst);
        if let Some(reader) = lifecycle.reader.take() {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !reader.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if reader.is_finished() {
                if reader.join().is_err() {
                    error!("serial reader thread panicked");
                }
            } else {
                warn!("serial reader did not exit in time, detaching");
            }
        }
        drop(lifecycle);

        let mut io = self.io.lock();
        if let Some(port) = io.port_name.take() {
            info!(%port, "serial port closed");
        }
        io.writer = None;
    }

    /// Closes and reopens the port.
    pub fn restart(&self) -> Result<(), TransportError> {
        self.stop();
        self.start()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.io.lock().writer.is_some()
    }

    #[must_use]
    pub fn port_name(&self) -> Option<String> {
        self.io.lock().port_name.clone()
    }

    /// Writes `line` followed by the configured terminator.
    ///
    /// Blocks as needed so consecutive writes are at least
    /// `min_send_interval` apart.
    pub fn send(&self, line: &str) -> Result<(), TransportError> {
        let mut io = self.io.lock();
        if io.writer.is_none() {
            return Err(TransportError::NotOpen);
        }

        let interval = self.config.min_send_interval;
        if let Some(last) = io.last_send
            && !interval.is_zero()
        {
            let since = last.elapsed();
            if since < interval {
                thread::sleep(interval - since);
            }
        }

        let Some(writer) = io.writer.as_mut() else {
            return Err(TransportError::NotOpen);
        };
        let mut frame = Vec::with_capacity(line.len() + self.config.line_ending.len());
        frame.extend_from_slice(line.as_bytes());
        frame.extend_from_slice(self.config.line_ending.as_bytes());
        writer
            .write_all(&frame)
            .and_then(|()| writer.flush())
            .map_err(TransportError::Write)?;

        io.last_send = Some(Instant::now());
        debug!(line, "serial tx");
        Ok(())
    }

    pub fn send_command(&self, command: HostCommand) -> Result<(), TransportError> {
        self.send(&command.encode())
    }

    /// Registers a line listener. Adding the same listener twice is a no-op.
    pub fn add_listener(&self, listener: LineListener) {
        let mut listeners = self.listeners.write();
        if !listeners.iter().any(|known| Arc::ptr_eq(known, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove_listener(&self, listener: &LineListener) {
        self.listeners
            .write()
            .retain(|known| !Arc::ptr_eq(known, listener));
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ReaderWorker {
    reader: Box<dyn Read + Send>,
    stop: Arc<AtomicBool>,
    listeners: Arc<RwLock<Vec<LineListener>>>,
    dispatch: DispatchHandle,
    io: Arc<Mutex<IoState>>,
    generation: u64,
}

impl ReaderWorker {
    fn run(mut self) {
        let mut buffer = Vec::with_capacity(64);
        let mut byte = [0_u8; 1];

        while !self.stop.load(Ordering::SeqCst) {
            match self.reader.read(&mut byte) {
                Ok(0) => thread::sleep(READ_BACKOFF),
                Ok(_) => match byte[0] {
                    b'\r' | b'\n' => {
                        if let Some(line) = decode_line(&buffer) {
                            self.deliver(line);
                        }
                        buffer.clear();
                    }
                    other => {
                        if buffer.len() >= MAX_LINE_LEN {
                            warn!(len = buffer.len(), "discarding oversized serial line");
                            buffer.clear();
                        }
                        buffer.push(other);
                    }
                },
                Err(err) if is_idle(&err) => {}
                Err(err) if is_disconnect(&err) => {
                    let mut io = self.io.lock();
                    if io.generation == self.generation {
                        warn!(%err, "serial port disappeared");
                        io.writer = None;
                        io.port_name = None;
                    } else {
                        debug!(%err, "superseded serial reader exiting");
                    }
                    return;
                }
                Err(err) => {
                    debug!(%err, "serial read error, retrying");
                    thread::sleep(READ_BACKOFF);
                }
            }
        }
    }

    fn deliver(&self, line: String) {
        debug!(%line, "serial rx");
        let listeners = Arc::clone(&self.listeners);
        self.dispatch.post(move || {
            let snapshot = listeners.read().clone();
            for listener in snapshot {
                if panic::catch_unwind(AssertUnwindSafe(|| listener(&line))).is_err() {
                    error!(%line, "line listener panicked");
                }
            }
        });
    }
}

fn is_idle(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::NotFound
            | ErrorKind::ConnectionAborted
            | ErrorKind::UnexpectedEof
    )
}

/// Decodes a framed line, dropping invalid UTF-8 and surrounding whitespace.
fn decode_line(bytes: &[u8]) -> Option<String> {
    let mut text = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        text.push_str(chunk.valid());
    }
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;

    fn memory_transport(config: SerialConfig) -> (Dispatcher, Transport, DeviceEnd) {
        let dispatcher = Dispatcher::new();
        let (port, device) = MemoryPort::pair("mem0");
        let transport = Transport::new(config, port, dispatcher.handle());
        (dispatcher, transport, device)
    }

    fn recording_listener() -> (LineListener, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let listener: LineListener = Arc::new(move |line: &str| sink.lock().push(line.to_owned()));
        (listener, lines)
    }

    #[test]
    fn decode_line_drops_invalid_bytes_and_whitespace() {
        assert_eq!(decode_line(b"  R=1,2 "), Some("R=1,2".into()));
        assert_eq!(decode_line(b"D=\xff1"), Some("D=1".into()));
        assert_eq!(decode_line(b" \t"), None);
    }

    #[test]
    fn send_before_start_is_rejected() {
        let (_dispatcher, transport, _device) = memory_transport(SerialConfig::default());
        assert!(matches!(transport.send("R"), Err(TransportError::NotOpen)));
    }

    #[test]
    fn start_fails_without_a_port() {
        let dispatcher = Dispatcher::new();
        let transport = Transport::new(
            SerialConfig::default(),
            |_: &SerialConfig| -> Result<SerialLink, TransportError> {
                Err(TransportError::NoPortFound { hint: None })
            },
            dispatcher.handle(),
        );
        assert!(matches!(
            transport.start(),
            Err(TransportError::NoPortFound { .. })
        ));
        assert!(!transport.is_open());
    }

    #[test]
    fn sent_lines_are_carriage_return_terminated() {
        let (_dispatcher, transport, device) = memory_transport(SerialConfig::default());
        transport.start().expect("start");
        transport
            .send_command(HostCommand::ReadThermistors)
            .expect("send");
        let (_, raw) = device
            .recv_raw(Duration::from_secs(1))
            .expect("bytes on the wire");
        assert_eq!(raw, b"R\r");
        transport.stop();
    }

    #[test]
    fn received_lines_are_framed_and_dispatched() {
        let (mut dispatcher, transport, device) = memory_transport(SerialConfig::default());
        let (listener, lines) = recording_listener();
        transport.add_listener(Arc::clone(&listener));
        transport.add_listener(listener);
        assert_eq!(transport.listener_count(), 1);
        transport.start().expect("start");

        device.send_raw(b"R=1600,1700\r\n\r\nT1=");
        device.send_raw(b"180.5\nD=0\r");

        assert!(dispatcher.run_until(Duration::from_secs(2), || lines.lock().len() == 3));
        assert_eq!(
            *lines.lock(),
            vec!["R=1600,1700".to_owned(), "T1=180.5".into(), "D=0".into()]
        );
        transport.stop();
    }

    #[test]
    fn listeners_only_run_on_the_dispatcher() {
        let (mut dispatcher, transport, device) = memory_transport(SerialConfig::default());
        let (listener, lines) = recording_listener();
        transport.add_listener(listener);
        transport.start().expect("start");

        device.send_line("D=1");
        thread::sleep(Duration::from_millis(200));
        assert!(lines.lock().is_empty(), "listener ran off the dispatcher");

        assert_eq!(dispatcher.run_until_idle(), 1);
        assert_eq!(*lines.lock(), vec!["D=1".to_owned()]);
        transport.stop();
    }

    #[test]
    fn removed_listener_stops_receiving() {
        let (mut dispatcher, transport, device) = memory_transport(SerialConfig::default());
        let (listener, lines) = recording_listener();
        transport.add_listener(Arc::clone(&listener));
        transport.start().expect("start");
        transport.remove_listener(&listener);
        assert_eq!(transport.listener_count(), 0);

        device.send_line("D=1");
        dispatcher.run_for(Duration::from_millis(300));
        assert!(lines.lock().is_empty());
        transport.stop();
    }

    #[test]
    fn consecutive_sends_respect_minimum_interval() {
        let config = SerialConfig {
            min_send_interval: Duration::from_millis(50),
            ..SerialConfig::default()
        };
        let (_dispatcher, transport, device) = memory_transport(config);
        transport.start().expect("start");

        transport.send("Z01=050").expect("first send");
        transport.send("Z02=050").expect("second send");

        let (first, _) = device.recv_raw(Duration::from_secs(1)).expect("first");
        let (second, _) = device.recv_raw(Duration::from_secs(1)).expect("second");
        assert!(
            second.duration_since(first) >= Duration::from_millis(50),
            "writes were {:?} apart",
            second.duration_since(first)
        );
        transport.stop();
    }

    #[test]
    fn stop_is_idempotent_and_restart_reopens() {
        let (_dispatcher, transport, _device) = memory_transport(SerialConfig::default());
        transport.stop();
        transport.start().expect("start");
        transport.start().expect("second start is a no-op");
        assert_eq!(transport.port_name().as_deref(), Some("mem0"));
        transport.stop();
        transport.stop();
        assert!(!transport.is_open());
        transport.restart().expect("restart");
        assert!(transport.is_open());
        transport.stop();
    }

    struct GatedReader {
        gate: crossbeam_channel::Receiver<()>,
    }

    impl Read for GatedReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            let _ = self.gate.recv();
            Err(io::Error::new(ErrorKind::BrokenPipe, "unplugged"))
        }
    }

    fn gated_link(name: &str, gate: crossbeam_channel::Receiver<()>) -> SerialLink {
        SerialLink {
            name: name.to_owned(),
            reader: Box::new(GatedReader { gate }),
            writer: Box::new(io::sink()),
        }
    }

    #[test]
    fn stale_reader_does_not_close_a_newer_link() {
        let dispatcher = Dispatcher::new();
        let (unplug_old, old_gate) = crossbeam_channel::bounded::<()>(0);
        let (unplug_new, new_gate) = crossbeam_channel::bounded::<()>(0);
        let links = Mutex::new(std::collections::VecDeque::from([
            gated_link("old", old_gate),
            gated_link("new", new_gate),
        ]));
        let transport = Transport::new(
            SerialConfig::default(),
            move |_: &SerialConfig| {
                links
                    .lock()
                    .pop_front()
                    .ok_or(TransportError::NoPortFound { hint: None })
            },
            dispatcher.handle(),
        );

        transport.start().expect("first open");
        // The first reader is stuck in read, so stop detaches it.
        transport.stop();
        transport.start().expect("second open");

        drop(unplug_old);
        thread::sleep(Duration::from_millis(200));
        assert!(transport.is_open());
        assert_eq!(transport.port_name().as_deref(), Some("new"));
        transport.send("R").expect("send on the newer link");

        drop(unplug_new);
        let deadline = Instant::now() + Duration::from_secs(2);
        while transport.is_open() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!transport.is_open());
    }

    #[test]
    fn disconnected_device_closes_the_port() {
        let (_dispatcher, transport, device) = memory_transport(SerialConfig::default());
        transport.start().expect("start");
        drop(device);

        let deadline = Instant::now() + Duration::from_secs(2);
        while transport.is_open() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!transport.is_open());
        assert!(matches!(transport.send("R"), Err(TransportError::NotOpen)));
    }
}
