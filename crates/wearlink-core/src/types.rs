//! Core data types for wearable biosensor acquisition
//!
//! Everything here is a plain value: descriptors produced by discovery,
//! session snapshots handed out by the connection manager and the decoded
//! physiological samples delivered to consumers.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Opaque peripheral identifier.
///
/// Stable across reconnects for the same physical device. The string form is
/// whatever the platform reports (MAC address, CoreBluetooth UUID, ...).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap a platform identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// Vendor / Metric
// ============================================================================

/// Vendor classification bucket.
///
/// Decides which characteristic layout the channel resolver will look for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorProfile {
    /// Samsung Galaxy / Gear watches
    Samsung,
    /// Apple Watch
    Apple,
    /// Named device from any other vendor
    Generic,
    /// Device did not advertise a name
    Unknown,
}

impl VendorProfile {
    /// All profiles, in classification priority order.
    pub const ALL: [Self; 4] = [Self::Samsung, Self::Apple, Self::Generic, Self::Unknown];

    /// Lower-case name used in logs and configuration files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Samsung => "samsung",
            Self::Apple => "apple",
            Self::Generic => "generic",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for VendorProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physiological quantity a consumer can monitor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Heart rate in beats per minute
    HeartRate,
    /// Single-lead ECG in microvolts
    Ecg,
    /// Photoplethysmogram amplitude
    Ppg,
    /// Battery level in percent
    Battery,
}

impl Metric {
    /// All metrics.
    pub const ALL: [Self; 4] = [Self::HeartRate, Self::Ecg, Self::Ppg, Self::Battery];

    /// Lower-case name used in logs and configuration files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HeartRate => "heart_rate",
            Self::Ecg => "ecg",
            Self::Ppg => "ppg",
            Self::Battery => "battery",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// A peripheral found during a scan.
///
/// Created by discovery and never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Platform identifier
    pub id: DeviceId,
    /// Name from the advertisement, if any
    pub advertised_name: Option<String>,
    /// Classified vendor
    pub vendor_profile: VendorProfile,
    /// Signal strength in dBm at discovery time
    pub rssi: Option<i16>,
    /// Service UUIDs listed in the advertisement
    pub services: Vec<Uuid>,
}

impl DeviceDescriptor {
    /// Human readable label: the advertised name, or the id.
    #[must_use]
    pub fn label(&self) -> &str {
        self.advertised_name.as_deref().unwrap_or(self.id.as_str())
    }
}

// ============================================================================
// Sessions
// ============================================================================

/// Link state of a session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No link
    Disconnected,
    /// Link negotiation in progress
    Connecting,
    /// Link up and services discovered
    Connected,
}

/// Services and characteristics a connected peripheral actually exposes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCache(BTreeMap<Uuid, Vec<Uuid>>);

impl ServiceCache {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a characteristic under its service.
    pub fn insert(&mut self, service: Uuid, characteristic: Uuid) {
        let chars = self.0.entry(service).or_default();
        if !chars.contains(&characteristic) {
            chars.push(characteristic);
        }
    }

    /// Whether the service exposes the characteristic.
    #[must_use]
    pub fn contains(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.0
            .get(&service)
            .is_some_and(|chars| chars.contains(&characteristic))
    }

    /// Whether the service is present at all.
    #[must_use]
    pub fn has_service(&self, service: Uuid) -> bool {
        self.0.contains_key(&service)
    }

    /// Iterate services with their characteristics.
    pub fn iter(&self) -> impl Iterator<Item = (&Uuid, &Vec<Uuid>)> {
        self.0.iter()
    }

    /// Number of services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no service was discovered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(Uuid, Uuid)> for ServiceCache {
    fn from_iter<I: IntoIterator<Item = (Uuid, Uuid)>>(iter: I) -> Self {
        let mut cache = Self::new();
        for (service, characteristic) in iter {
            cache.insert(service, characteristic);
        }
        cache
    }
}

/// Snapshot of a device session.
///
/// The connection manager owns the live session; callers only ever see
/// clones of it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Device this session belongs to
    pub device_id: DeviceId,
    /// Current link state
    pub connection_state: ConnectionState,
    /// Discovered services
    pub service_cache: ServiceCache,
}

impl Session {
    /// Fresh session in the `Connecting` state.
    #[must_use]
    pub fn connecting(device_id: DeviceId) -> Self {
        Self {
            device_id,
            connection_state: ConnectionState::Connecting,
            service_cache: ServiceCache::new(),
        }
    }

    /// Check if the session is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }
}

/// Service + characteristic pair a metric is read from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelRef {
    /// GATT service UUID
    pub service: Uuid,
    /// GATT characteristic UUID
    pub characteristic: Uuid,
}

impl ChannelRef {
    /// Create a channel reference.
    #[must_use]
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self { service, characteristic }
    }
}

// ============================================================================
// Samples
// ============================================================================

/// Heart rate measurement.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartRateSample {
    /// Beats per minute, as reported
    pub bpm: u16,
    /// Microseconds since the Unix epoch
    pub timestamp_us: u64,
}

/// ECG reading.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcgSample {
    /// Deviation from baseline (µV)
    pub microvolts: i16,
    /// Microseconds since the Unix epoch
    pub timestamp_us: u64,
}

/// PPG reading with optional derived vitals.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PpgSample {
    /// Normalized optical amplitude
    pub amplitude: f32,
    /// Heart rate computed by the device
    pub derived_heart_rate: Option<u16>,
    /// SpO2 percentage computed by the device
    pub derived_oxygen: Option<u8>,
    /// Microseconds since the Unix epoch
    pub timestamp_us: u64,
}

/// Battery level.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatterySample {
    /// Charge in percent (0-100)
    pub percent: u8,
    /// Microseconds since the Unix epoch
    pub timestamp_us: u64,
}

/// A decoded or synthesized physiological sample.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Sample {
    /// Heart rate
    HeartRate(HeartRateSample),
    /// ECG
    Ecg(EcgSample),
    /// PPG
    Ppg(PpgSample),
    /// Battery
    Battery(BatterySample),
}

impl Sample {
    /// Metric this sample belongs to.
    #[must_use]
    pub const fn metric(&self) -> Metric {
        match self {
            Self::HeartRate(_) => Metric::HeartRate,
            Self::Ecg(_) => Metric::Ecg,
            Self::Ppg(_) => Metric::Ppg,
            Self::Battery(_) => Metric::Battery,
        }
    }

    /// Sample timestamp in microseconds since the Unix epoch.
    #[must_use]
    pub const fn timestamp_us(&self) -> u64 {
        match self {
            Self::HeartRate(s) => s.timestamp_us,
            Self::Ecg(s) => s.timestamp_us,
            Self::Ppg(s) => s.timestamp_us,
            Self::Battery(s) => s.timestamp_us,
        }
    }
}

/// Current wall clock in microseconds since the Unix epoch.
#[must_use]
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
