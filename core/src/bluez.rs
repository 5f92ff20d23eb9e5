//! Backend talking to the BlueZ daemon over D-Bus.
//!
//! Only compiled in with the `bluez` feature. Without it the backend still
//! exists so that selection by name keeps working, but every operation fails
//! with [`BackendError::AdapterUnavailable`].

use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub struct BluezSettings {
    pub adapter: String,
    /// Limit for the link handshake and service resolution.
    pub connect_timeout: Duration,
}

impl Default for BluezSettings {
    fn default() -> Self {
        Self {
            adapter: "hci0".to_string(),
            connect_timeout: Duration::from_secs(20),
        }
    }
}

pub use imp::BluezBackend;

#[cfg(feature = "bluez")]
mod imp {
    use std::time::{Duration, Instant};

    use bluer::gatt::remote::{Characteristic, Descriptor};
    use bluer::{Adapter, AdapterEvent, Address, Device, Session};
    use futures::{pin_mut, StreamExt};
    use tokio::runtime::{Builder, Runtime};
    use tracing::{debug, warn};

    use super::BluezSettings;
    use crate::ble::{adapter_index, Backend, BackendKind, NotificationHandler, LISTEN_ENABLE};
    use crate::error::BackendError;
    use crate::models::{AddressType, DeviceAddress, DiscoveredDevice, Handle};

    struct Stack {
        runtime: Runtime,
        // keeps the D-Bus connection alive
        _session: Session,
        adapter: Adapter,
    }

    enum Attribute {
        Value(Characteristic),
        Descriptor(Characteristic, Descriptor),
    }

    impl Attribute {
        fn characteristic(&self) -> &Characteristic {
            match self {
                Attribute::Value(chr) | Attribute::Descriptor(chr, _) => chr,
            }
        }
    }

    pub struct BluezBackend {
        settings: BluezSettings,
        stack: Option<Stack>,
        device: Option<(DeviceAddress, Device)>,
    }

    impl BluezBackend {
        pub fn new(settings: BluezSettings) -> Self {
            Self {
                settings,
                stack: None,
                device: None,
            }
        }

        /// Whether bluetoothd answers and exposes a default adapter.
        pub fn check_available() -> bool {
            let Ok(runtime) = Builder::new_current_thread().enable_all().build() else {
                return false;
            };
            runtime.block_on(async {
                let reachable = async {
                    let session = Session::new().await?;
                    session.default_adapter().await.map(|_| ())
                };
                matches!(tokio::time::timeout(Duration::from_secs(2), reachable).await, Ok(Ok(())))
            })
        }

        fn stack(&mut self) -> Result<&Stack, BackendError> {
            if self.stack.is_none() {
                self.stack = Some(open_stack(&self.settings.adapter)?);
            }
            self.stack
                .as_ref()
                .ok_or_else(|| BackendError::AdapterUnavailable(self.settings.adapter.clone()))
        }

        fn linked(&self) -> Result<(&Stack, &Device), BackendError> {
            match (&self.stack, &self.device) {
                (Some(stack), Some((_, device))) => Ok((stack, device)),
                _ => Err(BackendError::NotConnected),
            }
        }

        fn attribute(&self, handle: Handle) -> Result<(&Stack, Attribute), BackendError> {
            let (stack, device) = self.linked()?;
            let found = stack
                .runtime
                .block_on(find_attribute(device, handle))
                .map_err(|e| BackendError::wrap(format!("listing attributes for {}", handle), e))?;
            match found {
                Some(attribute) => Ok((stack, attribute)),
                None => Err(BackendError::ProtocolError(format!(
                    "no attribute with handle {}",
                    handle
                ))),
            }
        }
    }

    fn open_stack(adapter_name: &str) -> Result<Stack, BackendError> {
        adapter_index(adapter_name)?;
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| BackendError::AdapterUnavailable(format!("tokio runtime: {}", e)))?;
        let (session, adapter) = runtime
            .block_on(async {
                let session = Session::new().await?;
                let adapter = session.adapter(adapter_name)?;
                adapter.set_powered(true).await?;
                Ok::<_, bluer::Error>((session, adapter))
            })
            .map_err(|e| BackendError::AdapterUnavailable(format!("{}: {}", adapter_name, e)))?;
        debug!(adapter = adapter_name, "bluez session opened");
        Ok(Stack {
            runtime,
            _session: session,
            adapter,
        })
    }

    /// BlueZ names characteristics after their declaration handle; the value
    /// attribute follows it directly.
    pub(super) fn characteristic_owns(declaration: u16, handle: u16) -> bool {
        handle == declaration || Some(handle) == declaration.checked_add(1)
    }

    pub(super) fn bluer_address_type(address_type: AddressType) -> bluer::AddressType {
        match address_type {
            AddressType::Public => bluer::AddressType::LePublic,
            AddressType::Random => bluer::AddressType::LeRandom,
        }
    }

    async fn find_attribute(device: &Device, handle: Handle) -> bluer::Result<Option<Attribute>> {
        for service in device.services().await? {
            for chr in service.characteristics().await? {
                if characteristic_owns(chr.id(), handle.0) {
                    return Ok(Some(Attribute::Value(chr)));
                }
                for desc in chr.descriptors().await? {
                    if desc.id() == handle.0 {
                        return Ok(Some(Attribute::Descriptor(chr, desc)));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn link(
        adapter: &Adapter,
        address: &DeviceAddress,
        timeout: Duration,
    ) -> bluer::Result<Device> {
        let addr = Address::new(address.octets);
        let device = if adapter.device_addresses().await?.contains(&addr) {
            let device = adapter.device(addr)?;
            if !device.is_connected().await? {
                device.connect().await?;
            }
            device
        } else {
            adapter
                .connect_device(addr, bluer_address_type(address.address_type))
                .await?
        };

        let deadline = Instant::now() + timeout;
        while !device.is_services_resolved().await? && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(device)
    }

    impl Backend for BluezBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Bluez
        }

        fn connect(&mut self, address: &DeviceAddress) -> Result<(), BackendError> {
            if let Some((current, _)) = &self.device {
                if current == address {
                    return Ok(());
                }
                self.disconnect();
            }
            let timeout = self.settings.connect_timeout;
            let stack = self.stack()?;
            let device = stack
                .runtime
                .block_on(async {
                    tokio::time::timeout(timeout, link(&stack.adapter, address, timeout)).await
                })
                .map_err(|_| BackendError::timeout(format!("connecting to {}", address), 1))?
                .map_err(|e| BackendError::wrap(format!("connecting to {}", address), e))?;
            debug!(%address, "connected over bluez");
            self.device = Some((*address, device));
            Ok(())
        }

        fn disconnect(&mut self) {
            let Some((address, device)) = self.device.take() else {
                return;
            };
            if let Some(stack) = &self.stack {
                if let Err(e) = stack.runtime.block_on(device.disconnect()) {
                    debug!(%address, error = %e, "disconnect failed");
                }
            }
        }

        fn is_connected(&self) -> bool {
            self.device.is_some()
        }

        fn read_handle(&mut self, handle: Handle) -> Result<Vec<u8>, BackendError> {
            let (stack, attribute) = self.attribute(handle)?;
            let value = stack.runtime.block_on(async {
                match &attribute {
                    Attribute::Value(chr) => chr.read().await,
                    Attribute::Descriptor(_, desc) => desc.read().await,
                }
            });
            value.map_err(|e| BackendError::wrap(format!("read error for handle {}", handle), e))
        }

        fn write_handle(&mut self, handle: Handle, value: &[u8]) -> Result<(), BackendError> {
            let (stack, attribute) = self.attribute(handle)?;
            let written = stack.runtime.block_on(async {
                match &attribute {
                    Attribute::Value(chr) => chr.write(value).await,
                    Attribute::Descriptor(_, desc) => desc.write(value).await,
                }
            });
            written.map_err(|e| BackendError::wrap(format!("error writing handle {}", handle), e))
        }

        fn wait_for_notification(
            &mut self,
            handle: Handle,
            on_notify: &mut NotificationHandler<'_>,
            timeout: Duration,
        ) -> Result<bool, BackendError> {
            let (stack, attribute) = self.attribute(handle)?;
            // bluetoothd owns the CCCD: subscribing writes LISTEN_ENABLE for us
            debug!(%handle, value = ?LISTEN_ENABLE, "subscribing");
            let frame = stack.runtime.block_on(async {
                let stream = attribute.characteristic().notify().await?;
                pin_mut!(stream);
                let next = tokio::time::timeout(timeout, stream.next()).await;
                Ok::<_, bluer::Error>(next.ok().flatten())
            });
            let context = format!("enabling notifications on {}", handle);
            let frame = frame.map_err(|e| BackendError::wrap(context, e))?;
            match frame {
                Some(frame) => {
                    on_notify(handle, frame);
                    Ok(true)
                }
                None => {
                    warn!(%handle, ?timeout, "no notification received");
                    Ok(false)
                }
            }
        }

        fn scan_for_devices(
            &mut self,
            timeout: Duration,
        ) -> Result<Vec<DiscoveredDevice>, BackendError> {
            let stack = self.stack()?;
            let scanned = stack.runtime.block_on(async {
                let events = stack.adapter.discover_devices().await?;
                pin_mut!(events);
                let mut found: Vec<Address> = Vec::new();
                let collect = async {
                    while let Some(event) = events.next().await {
                        if let AdapterEvent::DeviceAdded(addr) = event {
                            if !found.contains(&addr) {
                                found.push(addr);
                            }
                        }
                    }
                };
                let _ = tokio::time::timeout(timeout, collect).await;

                let mut devices = Vec::with_capacity(found.len());
                for addr in found {
                    let device = stack.adapter.device(addr)?;
                    let address_type = match device.address_type().await? {
                        bluer::AddressType::LeRandom => AddressType::Random,
                        _ => AddressType::Public,
                    };
                    devices.push(DiscoveredDevice {
                        address: DeviceAddress::new(addr.0, address_type),
                        name: device.name().await?,
                    });
                }
                Ok::<_, bluer::Error>(devices)
            });
            scanned.map_err(|e| BackendError::wrap("bluez discovery", e))
        }
    }

}

#[cfg(not(feature = "bluez"))]
mod imp {
    use std::time::Duration;

    use super::BluezSettings;
    use crate::ble::{Backend, BackendKind, NotificationHandler};
    use crate::error::BackendError;
    use crate::models::{DeviceAddress, DiscoveredDevice, Handle};

    pub struct BluezBackend {
        settings: BluezSettings,
    }

    impl BluezBackend {
        pub fn new(settings: BluezSettings) -> Self {
            Self { settings }
        }

        pub fn check_available() -> bool {
            false
        }

        fn unavailable(&self) -> BackendError {
            BackendError::AdapterUnavailable(format!(
                "{}: built without the `bluez` feature",
                self.settings.adapter
            ))
        }
    }

    impl Backend for BluezBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Bluez
        }

        fn connect(&mut self, _address: &DeviceAddress) -> Result<(), BackendError> {
            Err(self.unavailable())
        }

        fn disconnect(&mut self) {}

        fn is_connected(&self) -> bool {
            false
        }

        fn read_handle(&mut self, _handle: Handle) -> Result<Vec<u8>, BackendError> {
            Err(self.unavailable())
        }

        fn write_handle(&mut self, _handle: Handle, _value: &[u8]) -> Result<(), BackendError> {
            Err(self.unavailable())
        }

        fn wait_for_notification(
            &mut self,
            _handle: Handle,
            _on_notify: &mut NotificationHandler<'_>,
            _timeout: Duration,
        ) -> Result<bool, BackendError> {
            Err(self.unavailable())
        }

        fn scan_for_devices(
            &mut self,
            _timeout: Duration,
        ) -> Result<Vec<DiscoveredDevice>, BackendError> {
            Err(self.unavailable())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::error::ErrorKind;

        #[test]
        fn test_every_operation_is_unavailable() {
            let mut backend = BluezBackend::new(BluezSettings::default());
            let address = "58:2D:34:10:29:1C".parse().unwrap();
            assert_eq!(
                backend.connect(&address).unwrap_err().kind(),
                ErrorKind::AdapterUnavailable
            );
            assert_eq!(
                backend.read_handle(Handle(0x03)).unwrap_err().kind(),
                ErrorKind::AdapterUnavailable
            );
            assert_eq!(
                backend.scan_for_devices(Duration::from_secs(1)).unwrap_err().kind(),
                ErrorKind::AdapterUnavailable
            );
            backend.disconnect();
            assert!(!backend.is_connected());
        }
    }
}
