//! Hardware serial ports via the `serialport` crate.

use std::time::Duration;

use serialport::{SerialPortInfo, SerialPortType};
use tracing::{debug, warn};

use super::{PortOpener, SerialLink};
use crate::config::SerialConfig;
use crate::error::TransportError;

/// Opens real serial ports, auto-discovering one when no hint is configured.
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemPorts;

impl PortOpener for SystemPorts {
    fn open(&self, config: &SerialConfig) -> Result<SerialLink, TransportError> {
        let ports = serialport::available_ports().unwrap_or_else(|err| {
            warn!(%err, "failed to enumerate serial ports");
            Vec::new()
        });
        let name = pick_port(&ports, config.port_hint.as_deref()).ok_or_else(|| {
            TransportError::NoPortFound {
                hint: config.port_hint.clone(),
            }
        })?;

        let open_error = |source: serialport::Error| TransportError::Open {
            port: name.clone(),
            source: source.into(),
        };
        let mut port = serialport::new(&name, config.baud_rate)
            .data_bits(config.data_bits)
            .parity(config.parity)
            .stop_bits(config.stop_bits)
            .timeout(config.read_timeout)
            .open()
            .map_err(open_error)?;

        if let Err(err) = port.write_data_terminal_ready(true) {
            debug!(%err, "could not assert DTR");
        }
        if let Err(err) = port.write_request_to_send(true) {
            debug!(%err, "could not assert RTS");
        }

        let mut writer = port.try_clone().map_err(open_error)?;
        if let Some(timeout) = writer_timeout(config)
            && let Err(err) = writer.set_timeout(timeout)
        {
            debug!(%err, "could not set the write timeout");
        }
        Ok(SerialLink {
            name,
            reader: Box::new(port),
            writer: Box::new(writer),
        })
    }
}

/// Timeout for the cloned writer handle. Unix handles each carry their own
/// timeout; elsewhere clones share the read timeout, so it is left alone.
fn writer_timeout(config: &SerialConfig) -> Option<Duration> {
    cfg!(unix).then_some(config.write_timeout)
}

/// Picks a port: the first one whose name or USB description contains
/// `hint` (case-insensitive), or the first enumerated port without a hint.
#[must_use]
pub fn pick_port(ports: &[SerialPortInfo], hint: Option<&str>) -> Option<String> {
    let Some(hint) = hint.filter(|hint| !hint.trim().is_empty()) else {
        return ports.first().map(|port| port.port_name.clone());
    };
    let needle = hint.to_ascii_lowercase();
    ports
        .iter()
        .find(|port| {
            port.port_name.to_ascii_lowercase().contains(&needle)
                || describe(port).to_ascii_lowercase().contains(&needle)
        })
        .map(|port| port.port_name.clone())
}

fn describe(port: &SerialPortInfo) -> String {
    match &port.port_type {
        SerialPortType::UsbPort(info) => [info.manufacturer.as_deref(), info.product.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" "),
        SerialPortType::BluetoothPort => "Bluetooth".into(),
        SerialPortType::PciPort => "PCI".into(),
        SerialPortType::Unknown => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;

    fn usb(name: &str, product: &str) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.into(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid: 0x2341,
                pid: 0x0043,
                serial_number: None,
                manufacturer: Some("Acme".into()),
                product: Some(product.into()),
            }),
        }
    }

    fn plain(name: &str) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.into(),
            port_type: SerialPortType::Unknown,
        }
    }

    #[test]
    fn write_timeout_applies_to_the_writer_handle_on_unix() {
        let config = SerialConfig {
            write_timeout: Duration::from_millis(750),
            ..SerialConfig::default()
        };
        if cfg!(unix) {
            assert_eq!(writer_timeout(&config), Some(Duration::from_millis(750)));
        } else {
            assert_eq!(writer_timeout(&config), None);
        }
    }

    #[test]
    fn first_port_without_hint() {
        let ports = [plain("/dev/ttyS0"), usb("/dev/ttyACM0", "Oven Board")];
        assert_eq!(pick_port(&ports, None).as_deref(), Some("/dev/ttyS0"));
        assert_eq!(pick_port(&ports, Some("  ")).as_deref(), Some("/dev/ttyS0"));
        assert_eq!(pick_port(&[], None), None);
    }

    #[test]
    fn hint_matches_name_or_description() {
        let ports = [plain("/dev/ttyS0"), usb("/dev/ttyACM0", "Oven Board")];
        assert_eq!(pick_port(&ports, Some("ACM")).as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(pick_port(&ports, Some("oven")).as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(pick_port(&ports, Some("usb9")), None);
    }
}
