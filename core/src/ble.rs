use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bgapi::BgapiBackend;
use crate::bluez::BluezBackend;
use crate::config::BluetoothConfig;
use crate::error::BackendError;
use crate::gatttool::GatttoolBackend;
use crate::models::{DeviceAddress, DiscoveredDevice, Handle};

/// Value written to a client characteristic configuration descriptor to
/// enable notifications.
pub const LISTEN_ENABLE: [u8; 2] = [0x01, 0x00];

/// Callback receiving `(handle, payload)` for every notification frame.
pub type NotificationHandler<'a> = dyn FnMut(Handle, Vec<u8>) + 'a;

/// Capabilities every bluetooth transport provides.
///
/// Implementations must not let their own error types escape: every failure
/// is reported as a [`BackendError`].
pub trait Backend: Send {
    fn kind(&self) -> BackendKind;

    fn connect(&mut self, address: &DeviceAddress) -> Result<(), BackendError>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;

    fn read_handle(&mut self, handle: Handle) -> Result<Vec<u8>, BackendError>;
    fn write_handle(&mut self, handle: Handle, value: &[u8]) -> Result<(), BackendError>;

    /// Enable notifications on `handle` and hand every received frame to
    /// `on_notify` before returning. Frames are reported under `handle`,
    /// whatever value handle the transport saw them on.
    fn wait_for_notification(
        &mut self,
        handle: Handle,
        on_notify: &mut NotificationHandler<'_>,
        timeout: Duration,
    ) -> Result<bool, BackendError>;

    fn scan_for_devices(
        &mut self,
        timeout: Duration,
    ) -> Result<Vec<DiscoveredDevice>, BackendError>;
}

/// The transports this crate knows how to drive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// `gatttool` command line client from BlueZ
    #[default]
    Gatttool,
    /// BlueZ daemon over D-Bus
    #[serde(alias = "bluepy")]
    #[value(alias = "bluepy")]
    Bluez,
    /// BlueGiga BLED112 USB dongle
    #[serde(alias = "pygatt")]
    #[value(alias = "pygatt")]
    Bgapi,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] =
        [BackendKind::Gatttool, BackendKind::Bluez, BackendKind::Bgapi];

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Gatttool => "gatttool",
            BackendKind::Bluez => "bluez",
            BackendKind::Bgapi => "bgapi",
        }
    }

    /// Whether the transport's dependency, as configured, is present on
    /// this host.
    pub fn check_available(&self, config: &BluetoothConfig) -> bool {
        match self {
            BackendKind::Gatttool => {
                GatttoolBackend::program_available(&config.gatttool_settings())
            }
            BackendKind::Bluez => BluezBackend::check_available(),
            BackendKind::Bgapi => BgapiBackend::dongle_available(&config.bgapi_settings()),
        }
    }

    /// All transports available with `config`.
    pub fn available(config: &BluetoothConfig) -> Vec<BackendKind> {
        BackendKind::ALL
            .into_iter()
            .filter(|kind| kind.check_available(config))
            .collect()
    }

    /// Construct the transport described by `config`.
    ///
    /// A missing dependency is not reported here; the first operation on
    /// the returned backend fails with `AdapterUnavailable` instead.
    pub fn build(&self, config: &BluetoothConfig) -> Box<dyn Backend> {
        match self {
            BackendKind::Gatttool => Box::new(GatttoolBackend::new(config.gatttool_settings())),
            BackendKind::Bluez => Box::new(BluezBackend::new(config.bluez_settings())),
            BackendKind::Bgapi => Box::new(BgapiBackend::new(config.bgapi_settings())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gatttool" => Ok(BackendKind::Gatttool),
            "bluez" | "bluepy" => Ok(BackendKind::Bluez),
            "bgapi" | "pygatt" => Ok(BackendKind::Bgapi),
            _ => Err(BackendError::ProtocolError(format!("unknown backend: {}", s))),
        }
    }
}

/// Interface index of an adapter name such as `hci0`.
pub fn adapter_index(adapter: &str) -> Result<u16, BackendError> {
    adapter
        .strip_prefix("hci")
        .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(|| {
            BackendError::ProtocolError(format!(
                "invalid pattern '{}' for bluetooth adapter, expected something like 'hci0'",
                adapter
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgapi::{BgapiSettings, DongleLink};
    use crate::error::ErrorKind;
    use crate::gatttool::{CommandOutput, CommandRunner, GatttoolSettings, Invocation};
    use std::collections::VecDeque;

    #[test]
    fn test_backend_kind_names() {
        assert_eq!("gatttool".parse::<BackendKind>().unwrap(), BackendKind::Gatttool);
        assert_eq!("bluepy".parse::<BackendKind>().unwrap(), BackendKind::Bluez);
        assert_eq!("PyGatt".parse::<BackendKind>().unwrap(), BackendKind::Bgapi);
        assert_eq!(BackendKind::Bgapi.to_string(), "bgapi");
        assert_eq!(
            "hcitool".parse::<BackendKind>().unwrap_err().kind(),
            ErrorKind::ProtocolError
        );
    }

    #[test]
    fn test_adapter_index() {
        assert_eq!(adapter_index("hci0").unwrap(), 0);
        assert_eq!(adapter_index("hci12").unwrap(), 12);
        for bad in ["", "hci", "usb0", "hci-1", "hci0a"] {
            assert_eq!(adapter_index(bad).unwrap_err().kind(), ErrorKind::ProtocolError);
        }
    }

    #[cfg(not(feature = "bluez"))]
    #[test]
    fn test_bluez_unavailable_without_feature() {
        let config = BluetoothConfig::default();
        assert!(!BackendKind::Bluez.check_available(&config));
        assert!(!BackendKind::available(&config).contains(&BackendKind::Bluez));
    }

    #[test]
    fn test_availability_follows_config() {
        let mut config = BluetoothConfig::default();
        config.gatttool = "sh".to_string();
        assert!(BackendKind::Gatttool.check_available(&config));
        config.gatttool = "/nonexistent/gatttool".to_string();
        assert!(!BackendKind::Gatttool.check_available(&config));
        assert!(!BackendKind::available(&config).contains(&BackendKind::Gatttool));

        config.serial_port = Some("/dev/definitely-not-a-dongle".into());
        assert!(!BackendKind::Bgapi.check_available(&config));
    }

    struct CannedRunner(Option<String>);

    impl CommandRunner for CannedRunner {
        fn run(&mut self, _: &Invocation, _: Duration) -> std::io::Result<CommandOutput> {
            Ok(CommandOutput {
                stdout: self.0.take().unwrap_or_default(),
                timed_out: true,
                ..Default::default()
            })
        }
    }

    /// Hands out its frames in order, whatever was sent.
    struct CannedLink(VecDeque<Vec<u8>>);

    impl DongleLink for CannedLink {
        fn send(&mut self, _: &[u8]) -> Result<(), BackendError> {
            Ok(())
        }

        fn receive(&mut self, _: Duration) -> Result<Option<Vec<u8>>, BackendError> {
            Ok(self.0.pop_front())
        }
    }

    #[test]
    fn test_notifications_carry_subscribed_handle_on_every_transport() {
        let gatttool = GatttoolBackend::with_runner(
            GatttoolSettings::default(),
            CannedRunner(Some(
                "Characteristic value was written successfully\n\
                 Notification handle = 0x000e value: 54 3d 32 35 2e 36 20 48 3d 32 33 2e 36 00\n"
                    .to_string(),
            )),
        );
        let bgapi = BgapiBackend::with_link(
            BgapiSettings::default(),
            CannedLink(VecDeque::from(vec![
                // connect response and connection_status
                vec![0x00, 0x03, 0x06, 0x03, 0x00, 0x00, 0x00],
                vec![
                    0x80, 0x10, 0x03, 0x00, 0x00, 0x05, 0x1c, 0x29, 0x10, 0x34, 0x2d, 0x58,
                    0x00, 0x3c, 0x00, 0x64, 0x00, 0x00, 0x00, 0xff,
                ],
                // write response and procedure_completed
                vec![0x00, 0x03, 0x04, 0x05, 0x00, 0x00, 0x00],
                vec![0x80, 0x05, 0x04, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00],
                // attribute value on 0x000e
                vec![0x80, 0x09, 0x04, 0x05, 0x00, 0x0e, 0x00, 0x01, 0x04, b'T', b'=', b'2', b'5'],
            ])),
        );
        let mock = crate::ble_mock::MockBackend::with_sample_data();

        let sensor: DeviceAddress = "58:2D:34:10:29:1C".parse().unwrap();
        let backends: Vec<Box<dyn Backend>> =
            vec![Box::new(gatttool), Box::new(bgapi), Box::new(mock)];
        for mut backend in backends {
            let kind = backend.kind();
            backend.connect(&sensor).unwrap();
            let mut handles = Vec::new();
            let got = backend
                .wait_for_notification(
                    Handle(0x10),
                    &mut |h, _| handles.push(h),
                    Duration::from_secs(1),
                )
                .unwrap();
            assert!(got, "{kind}");
            assert!(!handles.is_empty(), "{kind}");
            assert!(handles.iter().all(|h| *h == Handle(0x10)), "{kind}: {handles:?}");
        }
    }
}
