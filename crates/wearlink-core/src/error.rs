//! Error taxonomy for the acquisition layer
//!
//! Scan and connect errors are surfaced to callers for user-facing retry
//! prompts. Channel errors normally trigger the simulation fallback instead
//! of reaching the caller. Decode errors only ever cost a single sample.

use thiserror::Error;

use crate::types::{Metric, VendorProfile};

/// Errors from device discovery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    /// Host has no usable Bluetooth radio
    #[error("Bluetooth is not supported on this host")]
    Unsupported,

    /// User or OS refused radio access
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    /// Scan finished or was cancelled without a matching device
    #[error("No matching device found")]
    NoDeviceFound,

    /// Any other platform failure
    #[error("Scan failed: {0}")]
    Transport(String),
}

/// Errors from session establishment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// Id was never discovered or the platform no longer knows it
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Negotiation exceeded the configured ceiling
    #[error("Connection timed out after {0} ms")]
    Timeout(u64),

    /// Link dropped while negotiating
    #[error("Link lost while connecting")]
    LinkLost,

    /// Another connect for the same device is still negotiating
    #[error("Connection already in progress for {0}")]
    InProgress(String),

    /// Any other platform failure
    #[error("Connection failed: {0}")]
    Transport(String),
}

/// Errors from channel resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// Vendor table lists the channel but the device does not expose it
    #[error("{metric} channel for {vendor} is not advertised by the device")]
    NotAdvertised {
        /// Classified vendor
        vendor: VendorProfile,
        /// Requested metric
        metric: Metric,
    },

    /// Vendor table has no channel for this metric
    #[error("{metric} is not supported for {vendor} devices")]
    Unsupported {
        /// Classified vendor
        vendor: VendorProfile,
        /// Requested metric
        metric: Metric,
    },
}

/// Errors from sample decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Payload too short or carrying an impossible value
    #[error("Malformed {metric} payload ({len} bytes): {reason}")]
    Malformed {
        /// Metric being decoded
        metric: Metric,
        /// Payload length in bytes
        len: usize,
        /// What was wrong
        reason: &'static str,
    },
}

/// Errors from starting a monitoring subscription.
///
/// Only produced when simulation fallback is disabled; with the default
/// configuration these cases are served by the simulator instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    /// No channel could be resolved
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Device has no live session
    #[error("Device not connected: {0}")]
    NotConnected(String),

    /// Enabling notifications failed
    #[error("Failed to enable notifications: {0}")]
    Notify(String),
}

/// Errors from loading a vendor channel table.
#[derive(Debug, Error)]
pub enum ChannelMapError {
    /// File could not be read
    #[error("Failed to read channel map: {0}")]
    Io(#[from] std::io::Error),

    /// JSON did not match the table schema
    #[error("Invalid channel map: {0}")]
    Parse(#[from] serde_json::Error),

    /// Same vendor/metric pair listed twice
    #[error("Duplicate channel entry for {vendor}/{metric}")]
    Duplicate {
        /// Vendor of the duplicated entry
        vendor: VendorProfile,
        /// Metric of the duplicated entry
        metric: Metric,
    },
}
