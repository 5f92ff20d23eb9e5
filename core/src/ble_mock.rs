use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::ble::{Backend, BackendKind, NotificationHandler, LISTEN_ENABLE};
use crate::error::BackendError;
use crate::models::{DeviceAddress, DiscoveredDevice, Handle};

/// Operation recorded by [`MockBackend`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockCall {
    Connect(DeviceAddress),
    Disconnect,
    Read(Handle),
    Write(Handle, Vec<u8>),
    Listen(Handle),
    Scan,
}

/// Shared record of the calls made against a [`MockBackend`].
#[derive(Clone, Debug, Default)]
pub struct MockJournal(Arc<Mutex<Vec<MockCall>>>);

impl MockJournal {
    fn lock(&self) -> MutexGuard<'_, Vec<MockCall>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, call: MockCall) {
        self.lock().push(call);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.lock().iter().filter(|c| pred(c)).count()
    }
}

/// In-memory backend serving scripted handle values and notifications.
#[derive(Debug, Default)]
pub struct MockBackend {
    pub devices: Vec<DiscoveredDevice>,
    pub handles: HashMap<Handle, Vec<u8>>,
    /// Frames delivered by successive `wait_for_notification` calls.
    pub notifications: VecDeque<Vec<Vec<u8>>>,
    pub fail_connect: bool,
    connected: Option<DeviceAddress>,
    journal: MockJournal,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sensor answering like a Mi temperature/humidity sensor.
    pub fn with_sample_data() -> Self {
        let mut mock = Self::new();
        mock.devices.push(DiscoveredDevice {
            address: DeviceAddress::new([0x58, 0x2D, 0x34, 0x10, 0x29, 0x1C], Default::default()),
            name: Some("MJ_HT_V1".to_string()),
        });
        mock.handles.insert(Handle(0x03), b"MJ_HT_V1".to_vec());
        mock.handles.insert(Handle(0x24), b"00.00.66".to_vec());
        mock.handles.insert(Handle(0x18), vec![93]);
        mock.handles.insert(Handle(0x10), LISTEN_ENABLE.to_vec());
        mock.notifications.push_back(vec![vec![
            0x54, 0x3d, 0x32, 0x35, 0x2e, 0x36, 0x20, 0x48, 0x3d, 0x32, 0x33, 0x2e, 0x36, 0x00,
        ]]);
        mock
    }

    pub fn journal(&self) -> MockJournal {
        self.journal.clone()
    }

    fn require_connection(&self) -> Result<(), BackendError> {
        if self.connected.is_none() {
            return Err(BackendError::NotConnected);
        }
        Ok(())
    }
}

impl Backend for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Gatttool
    }

    fn connect(&mut self, address: &DeviceAddress) -> Result<(), BackendError> {
        self.journal.push(MockCall::Connect(*address));
        if self.fail_connect {
            return Err(BackendError::failure(format!("cannot reach {}", address)));
        }
        self.connected = Some(*address);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.journal.push(MockCall::Disconnect);
        self.connected = None;
    }

    fn is_connected(&self) -> bool {
        self.connected.is_some()
    }

    fn read_handle(&mut self, handle: Handle) -> Result<Vec<u8>, BackendError> {
        self.require_connection()?;
        self.journal.push(MockCall::Read(handle));
        self.handles
            .get(&handle)
            .cloned()
            .ok_or_else(|| BackendError::failure(format!("read failed for handle {}", handle)))
    }

    fn write_handle(&mut self, handle: Handle, value: &[u8]) -> Result<(), BackendError> {
        self.require_connection()?;
        self.journal.push(MockCall::Write(handle, value.to_vec()));
        self.handles.insert(handle, value.to_vec());
        Ok(())
    }

    fn wait_for_notification(
        &mut self,
        handle: Handle,
        on_notify: &mut NotificationHandler<'_>,
        _timeout: Duration,
    ) -> Result<bool, BackendError> {
        self.write_handle(handle, &LISTEN_ENABLE)?;
        self.journal.push(MockCall::Listen(handle));
        let frames = self.notifications.pop_front().unwrap_or_default();
        let received = !frames.is_empty();
        for frame in frames {
            on_notify(handle, frame);
        }
        Ok(received)
    }

    fn scan_for_devices(
        &mut self,
        _timeout: Duration,
    ) -> Result<Vec<DiscoveredDevice>, BackendError> {
        self.journal.push(MockCall::Scan);
        Ok(self.devices.clone())
    }
}
