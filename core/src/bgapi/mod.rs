//! Backend for BlueGiga BLED112 USB dongles speaking BGAPI.
//!
//! The dongle runs its own BLE stack, so it works without BlueZ. Commands
//! are answered by a response with the same class and id; everything else
//! the dongle reports arrives as events, which may interleave with
//! responses and are queued until an operation asks for them.

pub mod link;
pub mod packet;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::ble::{Backend, BackendKind, NotificationHandler, LISTEN_ENABLE};
use crate::error::BackendError;
use crate::models::{DeviceAddress, DiscoveredDevice, Handle};

pub use link::{detect_dongle, DongleLink, TtyLink};
use packet::{advertised_name, decode_packet, result_name, Command, Event, Packet, Response};

#[derive(Clone, Debug, PartialEq)]
pub struct BgapiSettings {
    /// Serial device of the dongle; autodetected through sysfs when unset.
    pub serial_port: Option<PathBuf>,
    pub sysfs_root: PathBuf,
    pub connect_timeout: Duration,
    /// Limit for a single command round trip and ATT procedure.
    pub response_timeout: Duration,
    // connection parameters, in the dongle's units
    pub interval_min: u16,
    pub interval_max: u16,
    pub supervision_timeout: u16,
    pub latency: u16,
}

impl Default for BgapiSettings {
    fn default() -> Self {
        Self {
            serial_port: None,
            sysfs_root: PathBuf::from("/sys"),
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(5),
            interval_min: 60,
            interval_max: 76,
            supervision_timeout: 100,
            latency: 0,
        }
    }
}

pub struct BgapiBackend {
    settings: BgapiSettings,
    link: Option<Box<dyn DongleLink>>,
    pending: VecDeque<Event>,
    connection: Option<(DeviceAddress, u8)>,
}

impl BgapiBackend {
    /// The serial port is opened on first use.
    pub fn new(settings: BgapiSettings) -> Self {
        Self {
            settings,
            link: None,
            pending: VecDeque::new(),
            connection: None,
        }
    }

    pub fn with_link(settings: BgapiSettings, link: impl DongleLink + 'static) -> Self {
        Self {
            link: Some(Box::new(link)),
            ..Self::new(settings)
        }
    }

    /// Whether a BLED112 is plugged in.
    pub fn check_available() -> bool {
        Self::dongle_available(&BgapiSettings::default())
    }

    /// Whether the configured serial port exists, or a dongle can be found
    /// under the configured sysfs root.
    pub fn dongle_available(settings: &BgapiSettings) -> bool {
        match &settings.serial_port {
            Some(path) => path.exists(),
            None => detect_dongle(&settings.sysfs_root).is_some(),
        }
    }

    fn link(&mut self) -> Result<&mut dyn DongleLink, BackendError> {
        if self.link.is_none() {
            let path = match &self.settings.serial_port {
                Some(path) => path.clone(),
                None => detect_dongle(&self.settings.sysfs_root).ok_or_else(|| {
                    BackendError::AdapterUnavailable("no BGAPI dongle found".to_string())
                })?,
            };
            self.link = Some(Box::new(TtyLink::open(&path)?));
        }
        match self.link.as_deref_mut() {
            Some(link) => Ok(link),
            None => Err(BackendError::AdapterUnavailable("no BGAPI dongle found".to_string())),
        }
    }

    fn connection(&self) -> Result<u8, BackendError> {
        self.connection
            .map(|(_, handle)| handle)
            .ok_or(BackendError::NotConnected)
    }

    /// Send `command` and wait for its response, queueing events that
    /// arrive in between. A non-zero result is an error.
    fn command(&mut self, command: Command) -> Result<Response, BackendError> {
        let expected = command.class_id();
        let timeout = self.settings.response_timeout;
        let link = self.link()?;
        link.send(&command.encode())?;

        let deadline = Instant::now() + timeout;
        let mut queued = Vec::new();
        let response = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(frame) = link.receive(remaining)? else {
                break None;
            };
            match decode_packet(&frame) {
                Ok(Packet::Response(response)) if (response.class, response.id) == expected => {
                    break Some(response)
                }
                Ok(Packet::Response(other)) => debug!(?other, "dropping unexpected response"),
                Ok(Packet::Event(event)) => queued.push(event),
                Err(e) => warn!(error = %e, "dropping frame"),
            }
        };
        self.pending.extend(queued);

        let response = response.ok_or_else(|| BackendError::timeout(command.name(), 1))?;
        if response.result != 0 {
            return Err(BackendError::ProtocolError(format!(
                "{} failed with 0x{:04x} ({})",
                command.name(),
                response.result,
                result_name(response.result)
            )));
        }
        Ok(response)
    }

    /// Next event, queued or fresh, before `deadline`.
    fn next_event(&mut self, deadline: Instant) -> Result<Option<Event>, BackendError> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }
        let link = self.link()?;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(frame) = link.receive(remaining)? else {
                return Ok(None);
            };
            match decode_packet(&frame) {
                Ok(Packet::Event(event)) => return Ok(Some(event)),
                Ok(Packet::Response(other)) => debug!(?other, "dropping unexpected response"),
                Err(e) => warn!(error = %e, "dropping frame"),
            }
            if remaining.is_zero() {
                return Ok(None);
            }
        }
    }

    /// Watch events for the current connection until `accept` yields.
    fn await_event<T>(
        &mut self,
        operation: &str,
        timeout: Duration,
        mut accept: impl FnMut(&Event) -> Option<Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        let connection = self.connection()?;
        let deadline = Instant::now() + timeout;
        while let Some(event) = self.next_event(deadline)? {
            if let Event::Disconnected {
                connection: lost,
                reason,
            } = event
            {
                if lost == connection {
                    self.connection = None;
                    return Err(BackendError::failure(format!(
                        "link lost during {}: 0x{:04x} ({})",
                        operation,
                        reason,
                        result_name(reason)
                    )));
                }
            }
            if let Some(outcome) = accept(&event) {
                return outcome;
            }
        }
        Err(BackendError::timeout(operation, 1))
    }

    fn procedure_result(operation: &str, handle: Handle, result: u16) -> Result<(), BackendError> {
        if result == 0 {
            Ok(())
        } else {
            Err(BackendError::ProtocolError(format!(
                "{} on {} failed with 0x{:04x} ({})",
                operation,
                handle,
                result,
                result_name(result)
            )))
        }
    }
}

impl Backend for BgapiBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Bgapi
    }

    fn connect(&mut self, address: &DeviceAddress) -> Result<(), BackendError> {
        if let Some((current, _)) = self.connection {
            if current == *address {
                return Ok(());
            }
            self.disconnect();
        }

        let response = self.command(Command::ConnectDirect {
            address: *address,
            interval_min: self.settings.interval_min,
            interval_max: self.settings.interval_max,
            timeout: self.settings.supervision_timeout,
            latency: self.settings.latency,
        })?;
        let connection = response.connection.unwrap_or_default();

        let deadline = Instant::now() + self.settings.connect_timeout;
        while let Some(event) = self.next_event(deadline)? {
            if let Event::ConnectionStatus {
                connection: handle,
                flags,
                ..
            } = event
            {
                if handle == connection && flags & packet::FLAG_CONNECTED != 0 {
                    debug!(%address, connection, "connected through dongle");
                    self.connection = Some((*address, connection));
                    return Ok(());
                }
            }
        }

        // abort the pending connection attempt
        if let Err(e) = self.command(Command::EndProcedure) {
            debug!(error = %e, "could not cancel connection attempt");
        }
        Err(BackendError::timeout(format!("connecting to {}", address), 1))
    }

    fn disconnect(&mut self) {
        let Some((address, connection)) = self.connection.take() else {
            return;
        };
        if let Err(e) = self.command(Command::Disconnect { connection }) {
            debug!(%address, error = %e, "disconnect failed");
            return;
        }
        let deadline = Instant::now() + self.settings.response_timeout;
        while let Ok(Some(event)) = self.next_event(deadline) {
            if matches!(event, Event::Disconnected { connection: c, .. } if c == connection) {
                break;
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn read_handle(&mut self, handle: Handle) -> Result<Vec<u8>, BackendError> {
        let connection = self.connection()?;
        self.command(Command::ReadByHandle {
            connection,
            handle: handle.0,
        })?;
        let timeout = self.settings.response_timeout;
        self.await_event("attclient_read_by_handle", timeout, |event| match event {
            Event::AttributeValue {
                connection: c,
                handle: h,
                data,
            } if *c == connection && *h == handle.0 => Some(Ok(data.clone())),
            Event::ProcedureCompleted {
                connection: c,
                result,
                ..
            } if *c == connection && *result != 0 => {
                Some(Self::procedure_result("read", handle, *result).map(|_| Vec::new()))
            }
            _ => None,
        })
    }

    fn write_handle(&mut self, handle: Handle, value: &[u8]) -> Result<(), BackendError> {
        let connection = self.connection()?;
        self.command(Command::AttributeWrite {
            connection,
            handle: handle.0,
            data: value.to_vec(),
        })?;
        let timeout = self.settings.response_timeout;
        self.await_event("attclient_attribute_write", timeout, |event| match event {
            Event::ProcedureCompleted {
                connection: c,
                result,
                ..
            } if *c == connection => Some(Self::procedure_result("write", handle, *result)),
            _ => None,
        })
    }

    fn wait_for_notification(
        &mut self,
        handle: Handle,
        on_notify: &mut NotificationHandler<'_>,
        timeout: Duration,
    ) -> Result<bool, BackendError> {
        self.write_handle(handle, &LISTEN_ENABLE)?;
        let connection = self.connection()?;

        let first = self.await_event("notification", timeout, |event| match event {
            Event::AttributeValue {
                connection: c,
                handle: h,
                data,
            } if *c == connection => Some(Ok((Handle(*h), data.clone()))),
            _ => None,
        });
        let (value_handle, data) = match first {
            Ok(frame) => frame,
            Err(BackendError::Timeout { .. }) => {
                warn!(%handle, ?timeout, "no notification received");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        trace!(%handle, %value_handle, "notification");
        on_notify(handle, data);

        // frames that arrived together with the first one
        let mut unrelated = Vec::new();
        while let Some(event) = self.next_event(Instant::now())? {
            match event {
                Event::AttributeValue {
                    connection: c,
                    data,
                    ..
                } if c == connection => on_notify(handle, data),
                other => unrelated.push(other),
            }
        }
        self.pending.extend(unrelated);
        Ok(true)
    }

    fn scan_for_devices(
        &mut self,
        timeout: Duration,
    ) -> Result<Vec<DiscoveredDevice>, BackendError> {
        self.command(Command::SetScanParameters {
            interval: 0x4b,
            window: 0x32,
            active: true,
        })?;
        self.command(Command::Discover {
            mode: packet::DISCOVER_OBSERVATION,
        })?;

        let mut devices: Vec<DiscoveredDevice> = Vec::new();
        let deadline = Instant::now() + timeout;
        while let Some(event) = self.next_event(deadline)? {
            let Event::ScanResponse { address, data, rssi } = event else {
                continue;
            };
            let name = advertised_name(&data);
            debug!(%address, rssi, ?name, "scan response");
            match devices.iter_mut().find(|d| d.address == address) {
                Some(known) => {
                    if known.name.is_none() {
                        known.name = name;
                    }
                }
                None => devices.push(DiscoveredDevice { address, name }),
            }
        }

        self.command(Command::EndProcedure)?;
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::{Arc, Mutex};

    /// Answers each command with the frames queued for it.
    struct ScriptedLink {
        replies: VecDeque<Vec<Vec<u8>>>,
        inbox: VecDeque<Vec<u8>>,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl DongleLink for ScriptedLink {
        fn send(&mut self, frame: &[u8]) -> Result<(), BackendError> {
            self.sent.lock().unwrap().push(frame.to_vec());
            if let Some(frames) = self.replies.pop_front() {
                self.inbox.extend(frames);
            }
            Ok(())
        }

        fn receive(&mut self, _timeout: Duration) -> Result<Option<Vec<u8>>, BackendError> {
            Ok(self.inbox.pop_front())
        }
    }

    fn backend(replies: Vec<Vec<Vec<u8>>>) -> (BgapiBackend, Arc<Mutex<Vec<Vec<u8>>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let link = ScriptedLink {
            replies: replies.into(),
            inbox: VecDeque::new(),
            sent: sent.clone(),
        };
        (BgapiBackend::with_link(BgapiSettings::default(), link), sent)
    }

    fn sensor() -> DeviceAddress {
        "58:2D:34:10:29:1C".parse().unwrap()
    }

    fn connect_replies() -> Vec<Vec<u8>> {
        vec![
            // gap_connect_direct response: success, connection 0
            vec![0x00, 0x03, 0x06, 0x03, 0x00, 0x00, 0x00],
            // connection_status: connected
            vec![
                0x80, 0x10, 0x03, 0x00, 0x00, 0x05, 0x1c, 0x29, 0x10, 0x34, 0x2d, 0x58, 0x00, 0x3c,
                0x00, 0x64, 0x00, 0x00, 0x00, 0xff,
            ],
        ]
    }

    fn write_replies() -> Vec<Vec<u8>> {
        vec![
            vec![0x00, 0x03, 0x04, 0x05, 0x00, 0x00, 0x00],
            // procedure_completed
            vec![0x80, 0x05, 0x04, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00],
        ]
    }

    fn value_event(handle: u8, data: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x80, (5 + data.len()) as u8, 0x04, 0x05, 0x00, handle, 0x00, 0x01];
        frame.push(data.len() as u8);
        frame.extend_from_slice(data);
        frame
    }

    #[test]
    fn test_requires_connection() {
        let (mut backend, sent) = backend(vec![]);
        assert_eq!(backend.read_handle(Handle(0x03)).unwrap_err().kind(), ErrorKind::NotConnected);
        assert_eq!(
            backend.write_handle(Handle(0x10), &LISTEN_ENABLE).unwrap_err().kind(),
            ErrorKind::NotConnected
        );
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_connect_read_disconnect() {
        let (mut backend, sent) = backend(vec![
            connect_replies(),
            vec![
                vec![0x00, 0x03, 0x04, 0x04, 0x00, 0x00, 0x00],
                value_event(0x03, b"MJ_HT_V1"),
            ],
            vec![
                vec![0x00, 0x03, 0x03, 0x00, 0x00, 0x00, 0x00],
                vec![0x80, 0x03, 0x03, 0x04, 0x00, 0x13, 0x02],
            ],
        ]);

        backend.connect(&sensor()).unwrap();
        assert!(backend.is_connected());
        // same address again is a no-op
        backend.connect(&sensor()).unwrap();

        assert_eq!(backend.read_handle(Handle(0x03)).unwrap(), b"MJ_HT_V1".to_vec());
        backend.disconnect();
        assert!(!backend.is_connected());

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert_eq!(&sent[0][..4], &[0x00, 0x0f, 0x06, 0x03]);
        assert_eq!(sent[1], vec![0x00, 0x03, 0x04, 0x04, 0x00, 0x03, 0x00]);
        assert_eq!(sent[2], vec![0x00, 0x01, 0x03, 0x00, 0x00]);
    }

    #[test]
    fn test_connect_rejected_by_dongle() {
        let (mut backend, _) = backend(vec![vec![vec![0x00, 0x03, 0x06, 0x03, 0x81, 0x01, 0x00]]]);
        let err = backend.connect(&sensor()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
        assert!(err.to_string().contains("device in wrong state"), "{err}");
        assert!(!backend.is_connected());
    }

    #[test]
    fn test_connect_without_status_times_out() {
        let (mut backend, sent) = backend(vec![
            vec![vec![0x00, 0x03, 0x06, 0x03, 0x00, 0x00, 0x00]],
            vec![vec![0x00, 0x02, 0x06, 0x04, 0x00, 0x00]],
        ]);
        let err = backend.connect(&sensor()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(sent.lock().unwrap()[1], Command::EndProcedure.encode());
    }

    #[test]
    fn test_read_failure_code() {
        let (mut backend, _) = backend(vec![
            connect_replies(),
            vec![
                vec![0x00, 0x03, 0x04, 0x04, 0x00, 0x00, 0x00],
                vec![0x80, 0x05, 0x04, 0x01, 0x00, 0x01, 0x04, 0x99, 0x00],
            ],
        ]);
        backend.connect(&sensor()).unwrap();
        let err = backend.read_handle(Handle(0x99)).unwrap_err();
        assert!(err.to_string().contains("invalid handle"), "{err}");
    }

    #[test]
    fn test_notifications_are_delivered() {
        let mut listen = write_replies();
        listen.push(value_event(0x0e, b"T=25.6 H=23.6\0"));
        listen.push(value_event(0x0e, b"T=25.7 H=23.5\0"));
        let (mut backend, sent) = backend(vec![connect_replies(), listen]);
        backend.connect(&sensor()).unwrap();

        let mut frames = Vec::new();
        let got = backend
            .wait_for_notification(
                Handle(0x10),
                &mut |h, data| frames.push((h, data)),
                Duration::from_secs(1),
            )
            .unwrap();
        assert!(got);
        assert_eq!(frames.len(), 2);
        // reported under the subscribed handle, not the value handle 0x0e
        assert_eq!(frames[0], (Handle(0x10), b"T=25.6 H=23.6\0".to_vec()));
        assert_eq!(frames[1], (Handle(0x10), b"T=25.7 H=23.5\0".to_vec()));
        assert_eq!(
            sent.lock().unwrap()[1],
            vec![0x00, 0x06, 0x04, 0x05, 0x00, 0x10, 0x00, 0x02, 0x01, 0x00]
        );
    }

    #[test]
    fn test_no_notification_returns_false() {
        let (mut backend, _) = backend(vec![connect_replies(), write_replies()]);
        backend.connect(&sensor()).unwrap();
        let mut frames = Vec::new();
        let got = backend
            .wait_for_notification(
                Handle(0x10),
                &mut |h, data| frames.push((h, data)),
                Duration::ZERO,
            )
            .unwrap();
        assert!(!got);
        assert!(frames.is_empty());
    }

    #[test]
    fn test_link_loss_drops_connection() {
        let (mut backend, _) = backend(vec![
            connect_replies(),
            vec![
                vec![0x00, 0x03, 0x04, 0x04, 0x00, 0x00, 0x00],
                vec![0x80, 0x03, 0x03, 0x04, 0x00, 0x08, 0x02],
            ],
        ]);
        backend.connect(&sensor()).unwrap();
        let err = backend.read_handle(Handle(0x03)).unwrap_err();
        assert!(err.to_string().contains("connection timeout"), "{err}");
        assert!(!backend.is_connected());
    }

    #[test]
    fn test_scan_collects_names() {
        let mut scan_response = vec![
            0x80, 0x18, 0x06, 0x00, 0xc4, 0x00, 0x2b, 0x1c, 0xdd, 0xa8, 0x65, 0x4c, 0x00, 0xff,
            0x0d,
            0x02, 0x01, 0x06, 0x09, 0x09,
        ];
        scan_response.extend_from_slice(b"MJ_HT_V1");
        let (mut backend, sent) = backend(vec![
            vec![vec![0x00, 0x02, 0x06, 0x07, 0x00, 0x00]],
            vec![vec![0x00, 0x02, 0x06, 0x02, 0x00, 0x00], scan_response.clone(), scan_response],
            vec![vec![0x00, 0x02, 0x06, 0x04, 0x00, 0x00]],
        ]);

        let devices = backend.scan_for_devices(Duration::from_millis(10)).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].address.to_string(), "4C:65:A8:DD:1C:2B");
        assert_eq!(devices[0].name.as_deref(), Some("MJ_HT_V1"));
        assert_eq!(sent.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_missing_dongle_is_unavailable() {
        let root = tempfile::tempdir().unwrap();
        let settings = BgapiSettings {
            sysfs_root: root.path().to_path_buf(),
            ..BgapiSettings::default()
        };
        let mut backend = BgapiBackend::new(settings);
        assert_eq!(
            backend.scan_for_devices(Duration::from_millis(10)).unwrap_err().kind(),
            ErrorKind::AdapterUnavailable
        );
    }
}
