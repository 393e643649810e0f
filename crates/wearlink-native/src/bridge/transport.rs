//! Transport seam between the acquisition layer and a Bluetooth stack
//!
//! [`BleTransport`] covers adapter-level work (scanning, opening links,
//! link-loss events) and [`PeripheralLink`] covers one connected
//! peripheral (service discovery, notifications, reads). The btleplug
//! backend and the in-memory mock both implement these traits.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::Stream;
use uuid::Uuid;

use wearlink_core::error::{ConnectError, ScanError};
use wearlink_core::types::{ChannelRef, DeviceId, ServiceCache};

/// Raw characteristic values, in arrival order.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// A peripheral as seen in advertisements.
#[derive(Clone, Debug, PartialEq)]
pub struct AdvertisedPeripheral {
    /// Platform identifier
    pub id: DeviceId,
    /// Advertised local name
    pub name: Option<String>,
    /// Advertised service UUIDs
    pub services: Vec<Uuid>,
    /// Signal strength (dBm)
    pub rssi: Option<i16>,
}

/// Adapter-level events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// The platform reports the link to a peripheral is gone
    Disconnected(DeviceId),
}

/// Errors from I/O on an open link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// Link is down
    #[error("Peripheral not connected")]
    NotConnected,

    /// Characteristic not exposed by the peripheral
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    /// Platform failure
    #[error("Link I/O error: {0}")]
    Io(String),
}

/// Adapter-level Bluetooth operations.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Start collecting advertisements.
    async fn start_scan(&self) -> Result<(), ScanError>;

    /// Stop collecting advertisements.
    async fn stop_scan(&self) -> Result<(), ScanError>;

    /// Peripherals seen so far.
    async fn peripherals(&self) -> Result<Vec<AdvertisedPeripheral>, ScanError>;

    /// Open a link to a peripheral.
    async fn connect(&self, id: &DeviceId) -> Result<Arc<dyn PeripheralLink>, ConnectError>;

    /// Subscribe to adapter events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Operations on one connected peripheral.
#[async_trait]
pub trait PeripheralLink: Send + Sync {
    /// Peripheral identifier.
    fn id(&self) -> &DeviceId;

    /// Whether the platform still considers the link up.
    async fn is_connected(&self) -> bool;

    /// Discover services and characteristics.
    async fn discover_services(&self) -> Result<ServiceCache, LinkError>;

    /// Enable notifications on a characteristic.
    async fn subscribe(&self, channel: ChannelRef) -> Result<NotificationStream, LinkError>;

    /// Disable notifications on a characteristic.
    async fn unsubscribe(&self, channel: ChannelRef) -> Result<(), LinkError>;

    /// Read a characteristic value once.
    async fn read(&self, channel: ChannelRef) -> Result<Vec<u8>, LinkError>;

    /// Close the link.
    async fn disconnect(&self) -> Result<(), LinkError>;
}
