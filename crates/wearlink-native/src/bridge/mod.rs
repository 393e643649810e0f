//! Bluetooth bridge to wearable devices
//!
//! - [`transport`]: Transport traits the rest of the bridge is written against
//! - [`mock`]: In-memory transport for tests and demos
//! - [`ble`]: btleplug transport (requires `ble` feature)
//! - [`discovery`]: Scanning, filtering and classification
//! - [`connection`]: Per-device sessions
//! - [`resolver`]: `(vendor, metric)` → characteristic
//! - [`streams`]: Monitoring subscriptions and sample delivery

#[cfg(feature = "ble")]
pub mod ble;

pub mod connection;
pub mod discovery;
pub mod mock;
pub mod resolver;
pub mod streams;
mod synthetic;
pub mod transport;

// Re-export key types
pub use connection::ConnectionManager;
pub use discovery::{DeviceRegistry, Discovery};
pub use mock::{MockPeripheral, MockRadio, MockTransport};
pub use resolver::ChannelResolver;
pub use streams::{NotificationStreamManager, SampleCallback, StreamSettings, SubscriptionHandle};
pub use transport::{
    AdvertisedPeripheral, BleTransport, LinkError, NotificationStream, PeripheralLink,
    TransportEvent,
};

#[cfg(feature = "ble")]
pub use ble::BtleplugTransport;
