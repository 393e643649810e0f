//! Wearlink Core - data model and pure building blocks
//!
//! This crate holds everything in the wearable acquisition layer that does
//! no I/O: the data model, the error taxonomy, vendor classification, the
//! vendor channel table, sample decoders and the synthetic signal generator.
//!
//! # Modules
//!
//! - [`types`]: Descriptors, sessions, channel references and samples
//! - [`error`]: Scan, connect, channel, decode and monitor errors
//! - [`classifier`]: Advertised name → vendor profile
//! - [`channel_map`]: `(vendor, metric)` → GATT channel table
//! - [`protocol`]: GATT UUIDs and per-metric payload decoders
//! - [`simulation`]: Physiologically plausible synthetic samples
//!
//! # Example
//!
//! ```rust
//! use wearlink_core::protocol::decode;
//! use wearlink_core::types::{Metric, Sample};
//!
//! let sample = decode(Metric::HeartRate, &[0x00, 72], 0).unwrap();
//! assert!(matches!(sample, Sample::HeartRate(s) if s.bpm == 72));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod channel_map;
pub mod classifier;
pub mod error;
pub mod protocol;
pub mod simulation;
pub mod types;

// Re-export commonly used types at crate root
pub use channel_map::{ChannelEntry, VendorChannelMap};
pub use classifier::{classify, classify_name};
pub use error::{ChannelError, ChannelMapError, ConnectError, DecodeError, MonitorError, ScanError};
pub use simulation::{derive_oxygen, SimulationConfig, Simulator};
pub use types::{
    BatterySample, ChannelRef, ConnectionState, DeviceDescriptor, DeviceId, EcgSample,
    HeartRateSample, Metric, PpgSample, Sample, ServiceCache, Session, VendorProfile,
};
