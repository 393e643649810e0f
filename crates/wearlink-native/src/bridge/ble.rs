//! btleplug-backed Bluetooth LE transport
//!
//! Wraps the first local adapter. Peripheral ids are the platform's
//! `PeripheralId` rendered as a string (BlueZ object path on Linux,
//! CoreBluetooth UUID on macOS, address on Windows).

use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

use wearlink_core::error::{ConnectError, ScanError};
use wearlink_core::types::{ChannelRef, DeviceId, ServiceCache};

use super::transport::{
    AdvertisedPeripheral, BleTransport, LinkError, NotificationStream, PeripheralLink,
    TransportEvent,
};

/// Capacity of the adapter event fan-out
const EVENT_CAPACITY: usize = 64;

fn scan_error(err: btleplug::Error) -> ScanError {
    match err {
        btleplug::Error::PermissionDenied => ScanError::PermissionDenied,
        btleplug::Error::NotSupported(_) => ScanError::Unsupported,
        other => ScanError::Transport(other.to_string()),
    }
}

fn connect_error(id: &DeviceId, err: btleplug::Error) -> ConnectError {
    match err {
        btleplug::Error::DeviceNotFound => ConnectError::DeviceNotFound(id.to_string()),
        btleplug::Error::TimedOut(elapsed) => {
            ConnectError::Timeout(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        }
        btleplug::Error::NotConnected => ConnectError::LinkLost,
        other => ConnectError::Transport(other.to_string()),
    }
}

fn link_error(err: btleplug::Error) -> LinkError {
    match err {
        btleplug::Error::NotConnected => LinkError::NotConnected,
        other => LinkError::Io(other.to_string()),
    }
}

/// Transport over the host's first Bluetooth adapter.
pub struct BtleplugTransport {
    adapter: Option<Adapter>,
    events: broadcast::Sender<TransportEvent>,
    forwarder: Option<JoinHandle<()>>,
}

impl BtleplugTransport {
    /// Open the Bluetooth stack.
    ///
    /// A host without an adapter still yields a transport; scanning on it
    /// fails with [`ScanError::Unsupported`].
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::PermissionDenied`] when the OS refuses access and
    /// [`ScanError::Unsupported`] when no Bluetooth stack is available.
    pub async fn new() -> Result<Self, ScanError> {
        let manager = Manager::new().await.map_err(|e| match e {
            btleplug::Error::PermissionDenied => ScanError::PermissionDenied,
            other => {
                tracing::warn!("Bluetooth stack unavailable: {}", other);
                ScanError::Unsupported
            }
        })?;
        let adapter = manager
            .adapters()
            .await
            .map_err(scan_error)?
            .into_iter()
            .next();

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let forwarder = match &adapter {
            Some(adapter) => Some(Self::spawn_forwarder(adapter, events.clone()).await?),
            None => {
                tracing::warn!("No Bluetooth adapter found");
                None
            }
        };

        Ok(Self {
            adapter,
            events,
            forwarder,
        })
    }

    /// Forward adapter disconnect events as [`TransportEvent`]s.
    async fn spawn_forwarder(
        adapter: &Adapter,
        events: broadcast::Sender<TransportEvent>,
    ) -> Result<JoinHandle<()>, ScanError> {
        let mut stream = adapter.events().await.map_err(scan_error)?;

        Ok(tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    let device_id = DeviceId::new(id.to_string());
                    tracing::debug!("Adapter reports {} disconnected", device_id);
                    // No receivers is fine
                    let _ = events.send(TransportEvent::Disconnected(device_id));
                }
            }
            tracing::debug!("Adapter event stream ended");
        }))
    }

    fn adapter(&self) -> Result<&Adapter, ScanError> {
        self.adapter.as_ref().ok_or(ScanError::Unsupported)
    }

    async fn find_peripheral(&self, id: &DeviceId) -> Result<Peripheral, ConnectError> {
        let adapter = self
            .adapter
            .as_ref()
            .ok_or_else(|| ConnectError::Transport("no Bluetooth adapter".into()))?;

        adapter
            .peripherals()
            .await
            .map_err(|e| connect_error(id, e))?
            .into_iter()
            .find(|p| p.id().to_string() == id.as_str())
            .ok_or_else(|| ConnectError::DeviceNotFound(id.to_string()))
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn start_scan(&self) -> Result<(), ScanError> {
        // Filtering happens in discovery: name-prefix matches carry no service
        self.adapter()?
            .start_scan(ScanFilter::default())
            .await
            .map_err(scan_error)
    }

    async fn stop_scan(&self) -> Result<(), ScanError> {
        self.adapter()?.stop_scan().await.map_err(scan_error)
    }

    async fn peripherals(&self) -> Result<Vec<AdvertisedPeripheral>, ScanError> {
        let peripherals = self.adapter()?.peripherals().await.map_err(scan_error)?;
        let mut found = Vec::with_capacity(peripherals.len());

        for peripheral in peripherals {
            let Some(properties) = peripheral.properties().await.map_err(scan_error)? else {
                continue;
            };
            found.push(AdvertisedPeripheral {
                id: DeviceId::new(peripheral.id().to_string()),
                name: properties.local_name,
                services: properties.services,
                rssi: properties.rssi,
            });
        }

        Ok(found)
    }

    async fn connect(&self, id: &DeviceId) -> Result<Arc<dyn PeripheralLink>, ConnectError> {
        let peripheral = self.find_peripheral(id).await?;

        tracing::info!("Connecting to BLE device: {}", id);
        peripheral.connect().await.map_err(|e| connect_error(id, e))?;

        Ok(Arc::new(BtleplugLink {
            id: id.clone(),
            peripheral,
        }))
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// An open btleplug peripheral.
struct BtleplugLink {
    id: DeviceId,
    peripheral: Peripheral,
}

impl BtleplugLink {
    fn characteristic(&self, channel: ChannelRef) -> Result<Characteristic, LinkError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == channel.characteristic && c.service_uuid == channel.service)
            .ok_or(LinkError::CharacteristicNotFound(channel.characteristic))
    }
}

#[async_trait]
impl PeripheralLink for BtleplugLink {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn discover_services(&self) -> Result<ServiceCache, LinkError> {
        self.peripheral.discover_services().await.map_err(link_error)?;

        let mut cache = ServiceCache::new();
        for service in self.peripheral.services() {
            for characteristic in &service.characteristics {
                cache.insert(service.uuid, characteristic.uuid);
            }
        }
        tracing::debug!("{}: discovered {} services", self.id, cache.len());
        Ok(cache)
    }

    async fn subscribe(&self, channel: ChannelRef) -> Result<NotificationStream, LinkError> {
        let characteristic = self.characteristic(channel)?;
        self.peripheral
            .subscribe(&characteristic)
            .await
            .map_err(link_error)?;

        // One stream per peripheral; keep only this characteristic
        let uuid = channel.characteristic;
        let stream = self.peripheral.notifications().await.map_err(link_error)?;
        Ok(Box::pin(stream.filter_map(move |n| {
            (n.uuid == uuid).then_some(n.value)
        })))
    }

    async fn unsubscribe(&self, channel: ChannelRef) -> Result<(), LinkError> {
        let characteristic = self.characteristic(channel)?;
        self.peripheral
            .unsubscribe(&characteristic)
            .await
            .map_err(link_error)
    }

    async fn read(&self, channel: ChannelRef) -> Result<Vec<u8>, LinkError> {
        let characteristic = self.characteristic(channel)?;
        self.peripheral.read(&characteristic).await.map_err(link_error)
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.peripheral.disconnect().await.map_err(link_error)
    }
}
