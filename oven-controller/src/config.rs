//! Runtime configuration: serial link parameters and the persisted settings
//! consumed by the cook supervisor.

use std::fs;
use std::path::Path;
use std::time::Duration;

use oven_core::overtemp::OverTempConfig;
use oven_core::watchdog::WatchdogConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Serial link parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerialConfig {
    /// Substring matched against the port name or its USB description.
    pub port_hint: Option<String>,
    pub baud_rate: u32,
    pub data_bits: serialport::DataBits,
    pub parity: serialport::Parity,
    pub stop_bits: serialport::StopBits,
    pub read_timeout: Duration,
    /// Applied to the writer handle where the platform keeps timeouts per
    /// handle (unix). Other platforms write with `read_timeout`.
    pub write_timeout: Duration,
    /// Minimum spacing between consecutive writes.
    pub min_send_interval: Duration,
    pub line_ending: &'static str,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_hint: None,
            baud_rate: 115_200,
            data_bits: serialport::DataBits::Eight,
            parity: serialport::Parity::None,
            stop_bits: serialport::StopBits::One,
            read_timeout: Duration::from_millis(100),
            write_timeout: Duration::from_millis(500),
            min_send_interval: Duration::ZERO,
            line_ending: "\r",
        }
    }
}

/// Settings read from the JSON settings file.
///
/// Unknown keys are preserved on write by [`Settings::merge_into`]; missing
/// keys take their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub alarm_level: i32,
    pub alarm_hysteresis: i32,
    pub over_temp_power: f32,
    /// Delay before the fan is switched off once every zone is off.
    pub fan_off_delay_secs: u64,
    pub poll_interval_ms: u64,
    pub wdt_timeout_ms: u64,
    pub wdt_startup_delay_ms: u64,
    /// Poll thermistors periodically and watch for their replies.
    pub periodic_telemetry: bool,
    /// Surface watchdog expiry as a user-facing error.
    pub interactive_errors: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            alarm_level: OverTempConfig::DEFAULT_ALARM_LEVEL,
            alarm_hysteresis: OverTempConfig::DEFAULT_HYSTERESIS,
            over_temp_power: OverTempConfig::DEFAULT_THROTTLE,
            fan_off_delay_secs: 61,
            poll_interval_ms: 1000,
            wdt_timeout_ms: 5000,
            wdt_startup_delay_ms: 2000,
            periodic_telemetry: true,
            interactive_errors: false,
        }
    }
}

impl Settings {
    /// Loads settings, substituting defaults when the file is missing or
    /// unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                warn!(path = %path.display(), %err, "settings unavailable, using defaults");
                return Self::default();
            }
        };
        match serde_json::from_str(&text) {
            Ok(settings) => settings,
            Err(err) => {
                warn!(path = %path.display(), %err, "settings file is corrupt, using defaults");
                Self::default()
            }
        }
    }

    /// Writes these settings into `path`, keeping any keys owned by other
    /// tools.
    pub fn merge_into(&self, path: &Path) -> std::io::Result<()> {
        let mut document = fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok())
            .filter(serde_json::Value::is_object)
            .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));

        let serde_json::Value::Object(ours) = serde_json::to_value(self)? else {
            return Ok(());
        };
        if let Some(existing) = document.as_object_mut() {
            existing.extend(ours);
        }
        fs::write(path, serde_json::to_string_pretty(&document)?)
    }

    #[must_use]
    pub fn over_temp(&self) -> OverTempConfig {
        OverTempConfig::new(
            self.alarm_level,
            self.alarm_hysteresis,
            self.over_temp_power.clamp(0.0, 1.0),
        )
    }

    #[must_use]
    pub fn watchdog(&self) -> WatchdogConfig {
        WatchdogConfig::new(
            Duration::from_millis(self.wdt_timeout_ms),
            Duration::from_millis(self.wdt_startup_delay_ms),
        )
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn fan_off_delay(&self) -> Duration {
        Duration::from_secs(self.fan_off_delay_secs)
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Settings::load_or_default(&dir.path().join("settings.alt"));
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.over_temp(), OverTempConfig::default());
    }

    #[test]
    fn corrupt_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.alt");
        fs::write(&path, "{ not json").expect("write");
        assert_eq!(Settings::load_or_default(&path), Settings::default());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.alt");
        fs::write(&path, r#"{"alarm_level": 1200, "over_temp_power": 0.5}"#).expect("write");

        let settings = Settings::load_or_default(&path);
        assert_eq!(settings.alarm_level, 1200);
        assert_eq!(settings.over_temp_power, 0.5);
        assert_eq!(settings.alarm_hysteresis, 400);
        assert_eq!(settings.watchdog(), WatchdogConfig::default());
    }

    #[test]
    fn merge_keeps_foreign_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.alt");
        fs::write(&path, r#"{"use_sound": true, "alarm_level": 1}"#).expect("write");

        let settings = Settings {
            alarm_level: 1700,
            ..Settings::default()
        };
        settings.merge_into(&path).expect("merge");

        let text = fs::read_to_string(&path).expect("read");
        let value: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["use_sound"], true);
        assert_eq!(value["alarm_level"], 1700);
        assert_eq!(Settings::load_or_default(&path), settings);
    }
}
