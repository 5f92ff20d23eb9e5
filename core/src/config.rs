//! Configuration file loading.
//!
//! Values come from three layers, later ones winning:
//! 1. `mitemp.toml` (every field has a default, the file itself is optional)
//! 2. `MITEMP_*` environment variables
//! 3. command line flags, applied by the binary

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::ble::{adapter_index, BackendKind};
use crate::bgapi::BgapiSettings;
use crate::bluez::BluezSettings;
use crate::gatttool::{GatttoolSettings, DEFAULT_PROGRAM};
use crate::models::{AddressType, DeviceAddress};
use crate::poller::PollerSettings;

pub const CONFIG_PATH_ENV: &str = "MITEMP_CONFIG_PATH";
pub const DEFAULT_CONFIG_FILE: &str = "mitemp.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bluetooth: BluetoothConfig,
    pub poller: PollerConfig,
    pub mqtt: MqttConfig,
    /// Sensors polled when none are given on the command line.
    pub sensors: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    pub backend: BackendKind,
    /// `gatttool` executable, looked up in `PATH` unless it is a path.
    pub gatttool: String,
    pub adapter: String,
    pub address_type: AddressType,
    pub timeout_secs: u64,
    pub retries: u32,
    pub backoff_secs: u64,
    pub connect_timeout_secs: u64,
    pub scan_timeout_secs: u64,
    /// Serial device of a BGAPI dongle; autodetected when unset.
    pub serial_port: Option<PathBuf>,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Gatttool,
            gatttool: DEFAULT_PROGRAM.to_string(),
            adapter: "hci0".to_string(),
            address_type: AddressType::Public,
            timeout_secs: 20,
            retries: 3,
            backoff_secs: 10,
            connect_timeout_secs: 20,
            scan_timeout_secs: 10,
            serial_port: None,
        }
    }
}

impl BluetoothConfig {
    pub fn gatttool_settings(&self) -> GatttoolSettings {
        GatttoolSettings {
            program: self.gatttool.clone(),
            adapter: self.adapter.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            retries: self.retries,
            initial_backoff: Duration::from_secs(self.backoff_secs),
            ..GatttoolSettings::default()
        }
    }

    pub fn bluez_settings(&self) -> BluezSettings {
        BluezSettings {
            adapter: self.adapter.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }

    pub fn bgapi_settings(&self) -> BgapiSettings {
        BgapiSettings {
            serial_port: self.serial_port.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            ..BgapiSettings::default()
        }
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub cache_timeout_secs: u64,
    pub retry_after_failure_secs: u64,
    pub notification_timeout_secs: u64,
    pub device_info_timeout_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        let defaults = PollerSettings::default();
        Self {
            cache_timeout_secs: defaults.cache_timeout.as_secs(),
            retry_after_failure_secs: defaults.retry_after_failure.as_secs(),
            notification_timeout_secs: defaults.notification_timeout.as_secs(),
            device_info_timeout_secs: defaults.device_info_timeout.as_secs(),
        }
    }
}

impl PollerConfig {
    pub fn settings(&self) -> PollerSettings {
        PollerSettings {
            cache_timeout: Duration::from_secs(self.cache_timeout_secs),
            retry_after_failure: Duration::from_secs(self.retry_after_failure_secs),
            notification_timeout: Duration::from_secs(self.notification_timeout_secs),
            device_info_timeout: Duration::from_secs(self.device_info_timeout_secs),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub topic_root: String,
    pub client_id_prefix: String,
    pub keep_alive_secs: u16,
    /// MAC the gateway identifier is derived from; read from the host's
    /// network interfaces when unset.
    pub gateway_mac: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            topic_root: "OpenCH".to_string(),
            client_id_prefix: "mitemp-mqtt-".to_string(),
            keep_alive_secs: 60,
            gateway_mac: None,
        }
    }
}

impl Config {
    /// Parse a TOML file without applying overrides.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Apply `MITEMP_*` overrides looked up through `lookup`.
    ///
    /// - `MITEMP_BACKEND` -> `bluetooth.backend`
    /// - `MITEMP_ADAPTER` -> `bluetooth.adapter`
    /// - `MITEMP_MQTT_HOST` -> `mqtt.host`
    /// - `MITEMP_MQTT_PORT` -> `mqtt.port`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<()> {
        if let Some(value) = lookup("MITEMP_BACKEND") {
            self.bluetooth.backend = value
                .parse()
                .map_err(|_| {
                    ConfigError::Invalid(format!("MITEMP_BACKEND: unknown backend '{}'", value))
                })?;
        }
        if let Some(value) = lookup("MITEMP_ADAPTER") {
            self.bluetooth.adapter = value;
        }
        if let Some(value) = lookup("MITEMP_MQTT_HOST") {
            self.mqtt.host = value;
        }
        if let Some(value) = lookup("MITEMP_MQTT_PORT") {
            self.mqtt.port = value
                .parse()
                .map_err(|_| {
                    ConfigError::Invalid(format!("MITEMP_MQTT_PORT: '{}' is not a port", value))
                })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let mut problems = Vec::new();

        if let Err(e) = adapter_index(&self.bluetooth.adapter) {
            problems.push(e.to_string());
        }
        let timeouts = [
            ("bluetooth.timeout_secs", self.bluetooth.timeout_secs),
            ("bluetooth.connect_timeout_secs", self.bluetooth.connect_timeout_secs),
            ("bluetooth.scan_timeout_secs", self.bluetooth.scan_timeout_secs),
            ("poller.notification_timeout_secs", self.poller.notification_timeout_secs),
        ];
        for (field, value) in timeouts {
            if value == 0 {
                problems.push(format!("{} must be greater than zero", field));
            }
        }
        if self.bluetooth.gatttool.trim().is_empty() {
            problems.push("bluetooth.gatttool must not be empty".to_string());
        }
        if self.mqtt.port == 0 {
            problems.push("mqtt.port must not be 0".to_string());
        }
        for sensor in &self.sensors {
            if sensor.parse::<DeviceAddress>().is_err() {
                problems.push(format!("sensors: '{}' is not a MAC address", sensor));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems.join("; ")))
        }
    }
}

/// The file named by `path`, `MITEMP_CONFIG_PATH` or `./mitemp.toml`, in
/// that order. `None` when only the implicit default is missing.
pub fn find_config_file(path: Option<&Path>) -> ConfigResult<Option<PathBuf>> {
    let explicit = path
        .map(Path::to_path_buf)
        .or_else(|| env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(ConfigError::Io {
                path,
                source: std::io::ErrorKind::NotFound.into(),
            });
        }
        return Ok(Some(path));
    }
    let default = PathBuf::from(DEFAULT_CONFIG_FILE);
    Ok(default.exists().then_some(default))
}

/// Load the configuration with environment overrides applied and validated.
pub fn load_config(path: Option<&Path>) -> ConfigResult<Config> {
    let mut config = match find_config_file(path)? {
        Some(file) => {
            debug!(path = %file.display(), "loading configuration");
            Config::from_file(&file)?
        }
        None => Config::default(),
    };
    config.apply_overrides(|key| env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bluetooth.backend, BackendKind::Gatttool);
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.poller.settings(), PollerSettings::default());
        let gatttool = config.bluetooth.gatttool_settings();
        assert_eq!(gatttool.retries, 3);
        assert_eq!(gatttool.program, "gatttool");
        assert_eq!(gatttool.initial_backoff, Duration::from_secs(10));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file() {
        let file = write_config(
            r#"
sensors = ["58:2D:34:10:29:1C"]

[bluetooth]
backend = "pygatt"
gatttool = "/opt/bluez/bin/gatttool"
serial_port = "/dev/ttyACM3"

[mqtt]
host = "broker.local"
"#,
        );
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.bluetooth.backend, BackendKind::Bgapi);
        assert_eq!(config.bluetooth.adapter, "hci0");
        assert_eq!(config.bluetooth.gatttool_settings().program, "/opt/bluez/bin/gatttool");
        assert_eq!(
            config.bluetooth.bgapi_settings().serial_port,
            Some(PathBuf::from("/dev/ttyACM3"))
        );
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.topic_root, "OpenCH");
        assert_eq!(config.sensors.len(), 1);
    }

    #[test]
    fn test_bad_toml() {
        let file = write_config("[bluetooth\nbackend = 1");
        assert!(matches!(Config::from_file(file.path()), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = load_config(Some(Path::new("/nonexistent/mitemp.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("MITEMP_BACKEND", "bluepy"),
            ("MITEMP_ADAPTER", "hci1"),
            ("MITEMP_MQTT_HOST", "10.0.0.2"),
            ("MITEMP_MQTT_PORT", "8883"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.bluetooth.backend, BackendKind::Bluez);
        assert_eq!(config.bluetooth.bluez_settings().adapter, "hci1");
        assert_eq!(config.mqtt.host, "10.0.0.2");
        assert_eq!(config.mqtt.port, 8883);

        let err = Config::default()
            .apply_overrides(|key| (key == "MITEMP_MQTT_PORT").then(|| "mqtt".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("MITEMP_MQTT_PORT"));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.bluetooth.adapter = "usb0".to_string();
        config.poller.notification_timeout_secs = 0;
        config.sensors.push("not-a-mac".to_string());
        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("usb0"), "{message}");
        assert!(message.contains("poller.notification_timeout_secs"), "{message}");
        assert!(message.contains("not-a-mac"), "{message}");
    }
}
