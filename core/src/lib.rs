pub mod bgapi;
pub mod ble;
pub mod ble_mock;
pub mod bluez;
pub mod config;
pub mod connection;
pub mod error;
pub mod gatttool;
pub mod logging;
pub mod models;
pub mod payload;
pub mod poller;
pub mod publish;

pub use ble::{Backend, BackendKind, LISTEN_ENABLE};
pub use config::{load_config, Config, ConfigError};
pub use connection::{ConnectionManager, ScopedSession};
pub use error::{BackendError, ErrorKind};
pub use models::{AddressType, DeviceAddress, DiscoveredDevice, Handle, Parameter, SensorReading};
pub use payload::decode_reading;
pub use poller::{PollError, PollerSettings, SensorPoller};
