//! In-process link used by the emulator and by tests.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::{PortOpener, SerialLink};
use crate::config::SerialConfig;
use crate::error::TransportError;

type Frame = (Instant, Vec<u8>);

/// Host side of an in-memory link. Opening it yields halves that talk to the
/// paired [`DeviceEnd`].
pub struct MemoryPort {
    name: String,
    to_device: Sender<Frame>,
    from_device: Receiver<Vec<u8>>,
}

/// Device side of an in-memory link. Dropping it looks like the port being
/// unplugged.
pub struct DeviceEnd {
    to_host: Sender<Vec<u8>>,
    from_host: Receiver<Frame>,
}

impl MemoryPort {
    /// Creates a connected host/device pair.
    #[must_use]
    pub fn pair(name: &str) -> (Self, DeviceEnd) {
        let (to_device, from_host) = crossbeam_channel::unbounded();
        let (to_host, from_device) = crossbeam_channel::unbounded();
        (
            Self {
                name: name.to_owned(),
                to_device,
                from_device,
            },
            DeviceEnd { to_host, from_host },
        )
    }
}

impl PortOpener for MemoryPort {
    fn open(&self, config: &SerialConfig) -> Result<SerialLink, TransportError> {
        Ok(SerialLink {
            name: self.name.clone(),
            reader: Box::new(MemoryReader {
                source: self.from_device.clone(),
                pending: VecDeque::new(),
                timeout: config.read_timeout,
            }),
            writer: Box::new(MemoryWriter {
                sink: self.to_device.clone(),
            }),
        })
    }
}

impl DeviceEnd {
    /// Queues raw bytes for the host reader.
    pub fn send_raw(&self, bytes: &[u8]) -> bool {
        self.to_host.send(bytes.to_vec()).is_ok()
    }

    /// Queues `line` followed by CR LF.
    pub fn send_line(&self, line: &str) -> bool {
        let mut bytes = line.as_bytes().to_vec();
        bytes.extend_from_slice(b"\r\n");
        self.to_host.send(bytes).is_ok()
    }

    /// Waits for the next host write, returning the instant it was made.
    #[must_use]
    pub fn recv_raw(&self, timeout: Duration) -> Option<(Instant, Vec<u8>)> {
        self.from_host.recv_timeout(timeout).ok()
    }

    /// Returns a host write if one is already queued.
    #[must_use]
    pub fn try_recv_raw(&self) -> Option<(Instant, Vec<u8>)> {
        self.from_host.try_recv().ok()
    }
}

struct MemoryReader {
    source: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
    timeout: Duration,
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending.is_empty() {
            match self.source.recv_timeout(self.timeout) {
                Ok(chunk) => self.pending.extend(chunk),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(ErrorKind::TimedOut, "no data"));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(ErrorKind::BrokenPipe, "device detached"));
                }
            }
        }
        let mut count = 0;
        while count < buf.len() {
            let Some(byte) = self.pending.pop_front() else {
                break;
            };
            buf[count] = byte;
            count += 1;
        }
        Ok(count)
    }
}

struct MemoryWriter {
    sink: Sender<Frame>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink
            .send((Instant::now(), buf.to_vec()))
            .map_err(|_| io::Error::new(ErrorKind::BrokenPipe, "device detached"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
