//! Polling of a Mi temperature/humidity sensor with an in-memory cache.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ble::Backend;
use crate::connection::ConnectionManager;
use crate::error::BackendError;
use crate::gatttool::bytes_to_hex;
use crate::models::{DeviceAddress, Handle, Parameter, SensorReading};
use crate::payload::{decode_battery, decode_reading, decode_text};

pub const HANDLE_NAME: Handle = Handle(0x03);
pub const HANDLE_FIRMWARE: Handle = Handle(0x24);
pub const HANDLE_BATTERY: Handle = Handle(0x18);
/// Client configuration of the sensor data characteristic.
pub const HANDLE_SENSOR_DATA: Handle = Handle(0x10);

#[derive(Error, Debug)]
pub enum PollError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("could not read data from {address}")]
    NoData {
        address: DeviceAddress,
        #[source]
        cause: Option<BackendError>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct PollerSettings {
    /// How long a reading is served from the cache.
    pub cache_timeout: Duration,
    /// Delay before the next attempt after a failed poll.
    pub retry_after_failure: Duration,
    pub notification_timeout: Duration,
    /// How long name-independent device info (firmware, battery) is kept.
    pub device_info_timeout: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            cache_timeout: Duration::from_secs(600),
            retry_after_failure: Duration::from_secs(300),
            notification_timeout: Duration::from_secs(10),
            device_info_timeout: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Clone, Debug)]
struct DeviceInfo {
    firmware: String,
    battery: u8,
    read_at: Instant,
}

pub struct SensorPoller {
    address: DeviceAddress,
    backend: Box<dyn Backend>,
    manager: &'static ConnectionManager,
    settings: PollerSettings,
    reading: Option<SensorReading>,
    next_poll: Option<Instant>,
    last_failure: Option<BackendError>,
    device_info: Option<DeviceInfo>,
}

impl SensorPoller {
    /// Poller sharing the process wide [`ConnectionManager`].
    pub fn new(
        address: DeviceAddress,
        backend: Box<dyn Backend>,
        settings: PollerSettings,
    ) -> Self {
        Self::with_manager(address, backend, settings, ConnectionManager::global())
    }

    pub fn with_manager(
        address: DeviceAddress,
        backend: Box<dyn Backend>,
        settings: PollerSettings,
        manager: &'static ConnectionManager,
    ) -> Self {
        Self {
            address,
            backend,
            manager,
            settings,
            reading: None,
            next_poll: None,
            last_failure: None,
            device_info: None,
        }
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn parameter_value(&mut self, parameter: Parameter) -> Result<f64, PollError> {
        self.parameter_value_with(parameter, true)
    }

    /// Current value of `parameter`, polling the sensor when the cached
    /// reading is missing, stale or `read_cached` is false.
    pub fn parameter_value_with(
        &mut self,
        parameter: Parameter,
        read_cached: bool,
    ) -> Result<f64, PollError> {
        let field: fn(&SensorReading) -> f64 = match parameter {
            Parameter::Battery => return self.battery_level().map(f64::from),
            Parameter::Temperature => |r| r.temperature,
            Parameter::Humidity => |r| r.humidity,
        };

        let due = self.next_poll.map_or(true, |at| Instant::now() >= at);
        if !read_cached || due {
            self.fill_cache()?;
        }

        let reading = self.reading.ok_or_else(|| PollError::NoData {
            address: self.address,
            cause: self.last_failure.take(),
        })?;
        Ok(field(&reading))
    }

    /// Advertised device name.
    pub fn name(&mut self) -> Result<String, PollError> {
        let mut session = self.manager.acquire(self.backend.as_mut(), &self.address)?;
        let raw = session.read_handle(HANDLE_NAME)?;
        let name = decode_text(&raw);
        if name.is_empty() {
            return Err(BackendError::Decode(format!("empty name from {}", self.address)).into());
        }
        Ok(name)
    }

    pub fn firmware_version(&mut self) -> Result<String, PollError> {
        Ok(self.device_info()?.firmware.clone())
    }

    /// Battery charge in percent.
    pub fn battery_level(&mut self) -> Result<u8, PollError> {
        Ok(self.device_info()?.battery)
    }

    /// Forget every cached value.
    pub fn clear_cache(&mut self) {
        self.reading = None;
        self.next_poll = None;
        self.last_failure = None;
        self.device_info = None;
    }

    fn device_info(&mut self) -> Result<&DeviceInfo, PollError> {
        let fresh = self
            .device_info
            .as_ref()
            .is_some_and(|info| info.read_at.elapsed() < self.settings.device_info_timeout);
        if !fresh {
            let mut session = self.manager.acquire(self.backend.as_mut(), &self.address)?;
            let firmware = decode_text(&session.read_handle(HANDLE_FIRMWARE)?);
            let battery = decode_battery(&session.read_handle(HANDLE_BATTERY)?)?;
            session.release();
            debug!(address = %self.address, %firmware, battery, "device info refreshed");
            self.device_info = Some(DeviceInfo {
                firmware,
                battery,
                read_at: Instant::now(),
            });
        }
        self.device_info
            .as_ref()
            .ok_or_else(|| PollError::NoData {
                address: self.address,
                cause: None,
            })
    }

    fn fill_cache(&mut self) -> Result<(), PollError> {
        self.device_info()?;

        let timeout = self.settings.notification_timeout;
        let address = self.address;
        let mut latest = None;
        let polled = self
            .manager
            .acquire(self.backend.as_mut(), &address)
            .and_then(|mut session| {
                session.wait_for_notification(
                    HANDLE_SENSOR_DATA,
                    &mut |handle, data| {
                        debug!(%address, %handle, raw = %bytes_to_hex(&data), "notification");
                        match decode_reading(&data) {
                            Ok(reading) => latest = Some(reading),
                            Err(e) => debug!(%address, error = %e, "ignoring frame"),
                        }
                    },
                    timeout,
                )
            });

        match (polled, latest) {
            (Ok(_), Some(reading)) => {
                info!(%address, reading.temperature, reading.humidity, "sensor polled");
                self.reading = Some(reading);
                self.last_failure = None;
                self.next_poll = Some(Instant::now() + self.settings.cache_timeout);
            }
            (polled, _) => {
                let failure = polled.err();
                match &failure {
                    Some(e) => warn!(%address, error = %e, "polling failed"),
                    None => warn!(%address, "no usable notification received"),
                }
                self.last_failure = failure;
                self.next_poll = Some(Instant::now() + self.settings.retry_after_failure);
            }
        }
        Ok(())
    }
}
