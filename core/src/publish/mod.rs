//! Republishing sensor data.
//!
//! Topics are `<root>/<gateway>/TeHu/<device>/Evt/<event>` where both ids
//! are EUI-64 identifiers derived from MAC addresses.

pub mod mqtt;

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::models::{DeviceAddress, Parameter};

pub use mqtt::{BrokerSettings, MqttPublisher};

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),

    #[error("broker refused the connection: {0}")]
    Rejected(String),

    #[error("no answer from broker within {0:?}")]
    Timeout(Duration),

    #[error("broker connection failed: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("broker connection is gone: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("cannot encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Destination for encoded messages.
pub trait Publisher {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), PublishError>;
}

/// Writes `<topic> <payload>` lines instead of talking to a broker.
pub struct ConsolePublisher<W: Write> {
    out: W,
}

impl<W: Write> ConsolePublisher<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Publisher for ConsolePublisher<W> {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        writeln!(self.out, "{} {}", topic, String::from_utf8_lossy(payload))?;
        Ok(())
    }
}

/// EUI-64 form of a MAC address: `fffe` inserted in the middle and the
/// universal/local bit flipped, lowercase hex without separators.
pub fn mac_to_eui64(address: &DeviceAddress) -> String {
    let o = address.octets;
    let eui = [o[0] ^ 0x02, o[1], o[2], 0xff, 0xfe, o[3], o[4], o[5]];
    eui.iter().map(|b| format!("{:02x}", b)).collect()
}

/// First non-loopback interface MAC listed under `net_root`
/// (normally `/sys/class/net`).
pub fn host_mac(net_root: &Path) -> Option<DeviceAddress> {
    let mut interfaces: Vec<_> = fs::read_dir(net_root)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name() != "lo")
        .map(|entry| entry.path())
        .collect();
    interfaces.sort();
    interfaces.into_iter().find_map(|path| {
        let address: DeviceAddress = fs::read_to_string(path.join("address")).ok()?.parse().ok()?;
        (address.octets != [0; 6]).then_some(address)
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topics {
    pub device_info: String,
    pub health: String,
    pub status: String,
}

impl Topics {
    pub fn new(root: &str, gateway: &DeviceAddress, device: &DeviceAddress) -> Self {
        let base = format!("{}/{}/TeHu/{}/Evt", root, mac_to_eui64(gateway), mac_to_eui64(device));
        Self {
            device_info: format!("{}/DeviceInfo", base),
            health: format!("{}/Health", base),
            status: format!("{}/Status", base),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceInfoMessage {
    pub name: String,
    pub firmware_version: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Measurement {
    pub name: &'static str,
    pub value: serde_json::Value,
    pub units: &'static str,
}

impl Measurement {
    pub fn new(parameter: Parameter, value: impl Into<serde_json::Value>) -> Self {
        Self {
            name: parameter.name(),
            value: value.into(),
            units: parameter.units(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MeasurementsMessage {
    pub measurements: Vec<Measurement>,
}

impl MeasurementsMessage {
    pub fn battery(level: u8) -> Self {
        Self {
            measurements: vec![Measurement::new(Parameter::Battery, level)],
        }
    }

    pub fn climate(temperature: f64, humidity: f64) -> Self {
        Self {
            measurements: vec![
                Measurement::new(Parameter::Temperature, temperature),
                Measurement::new(Parameter::Humidity, humidity),
            ],
        }
    }
}

/// Serialize `message` as JSON and hand it to `publisher`.
pub fn publish_json<T: Serialize>(
    publisher: &mut dyn Publisher,
    topic: &str,
    message: &T,
) -> Result<(), PublishError> {
    let payload = serde_json::to_vec(message)?;
    publisher.publish(topic, &payload)
}
