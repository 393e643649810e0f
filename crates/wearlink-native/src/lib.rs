//! Wearlink Native - host-side wearable acquisition
//!
//! Discovers Bluetooth LE wearables, keeps sessions to them and streams
//! decoded physiological samples to callbacks, substituting simulated
//! samples when a device cannot provide a metric.
//!
//! # Modules
//!
//! - [`bridge`]: Transports, discovery, sessions and notification streams
//! - [`acquisition`]: The [`Acquisition`] facade tying them together
//! - [`config`]: [`AcquisitionConfig`]
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wearlink_core::types::Metric;
//! use wearlink_native::bridge::MockTransport;
//! use wearlink_native::{Acquisition, AcquisitionConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let acquisition = Acquisition::new(Arc::new(MockTransport::new()), AcquisitionConfig::default())?;
//! let devices = acquisition.scan(Some("galaxy")).await?;
//! acquisition.connect(&devices[0].id).await?;
//! let handle = acquisition
//!     .start_monitoring(&devices[0].id, Metric::Ppg, |sample| println!("{sample:?}"))
//!     .await?;
//! acquisition.stop_monitoring(&handle).await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod acquisition;
pub mod bridge;
pub mod config;

// Re-export key types
pub use acquisition::Acquisition;
pub use bridge::{BleTransport, MockPeripheral, MockTransport, SubscriptionHandle};
pub use config::{AcquisitionConfig, ConfigError};

#[cfg(feature = "ble")]
pub use bridge::BtleplugTransport;
