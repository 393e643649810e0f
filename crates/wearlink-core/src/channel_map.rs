//! Vendor channel table
//!
//! Maps `(vendor, metric)` to the GATT service/characteristic carrying that
//! metric. The table is data: the built-in copy lives in
//! `data/vendor_channels.json` and deployments may load their own file to add
//! vendors without touching decode logic.
//!
//! ```json
//! { "entries": [
//!   { "vendor": "samsung", "metric": "ecg",
//!     "service": "0000fd00-0000-1000-8000-00805f9b34fb",
//!     "characteristic": "0000fd81-0000-1000-8000-00805f9b34fb" }
//! ] }
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ChannelMapError;
use crate::types::{ChannelRef, Metric, VendorProfile};

/// Built-in table shipped with the crate.
const BUILTIN_TABLE: &str = include_str!("../data/vendor_channels.json");

/// One row of the channel table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEntry {
    /// Vendor profile
    pub vendor: VendorProfile,
    /// Metric carried by the characteristic
    pub metric: Metric,
    /// GATT service UUID
    pub service: Uuid,
    /// GATT characteristic UUID
    pub characteristic: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChannelTable {
    entries: Vec<ChannelEntry>,
}

/// Read-only `(vendor, metric) → channel` lookup.
#[derive(Clone, Debug, Default)]
pub struct VendorChannelMap {
    channels: HashMap<(VendorProfile, Metric), ChannelRef>,
}

impl VendorChannelMap {
    /// Load the table shipped with the crate.
    ///
    /// # Panics
    ///
    /// Never in practice: the embedded table is validated by the unit tests.
    #[must_use]
    pub fn builtin() -> Self {
        Self::from_json(BUILTIN_TABLE).expect("embedded vendor channel table is valid")
    }

    /// Parse a table from JSON.
    pub fn from_json(json: &str) -> Result<Self, ChannelMapError> {
        let table: ChannelTable = serde_json::from_str(json)?;
        Self::from_entries(table.entries)
    }

    /// Read and parse a table from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ChannelMapError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Build a table from rows. Duplicate vendor/metric pairs are rejected.
    pub fn from_entries(
        entries: impl IntoIterator<Item = ChannelEntry>,
    ) -> Result<Self, ChannelMapError> {
        let mut channels = HashMap::new();
        for entry in entries {
            let key = (entry.vendor, entry.metric);
            let channel = ChannelRef::new(entry.service, entry.characteristic);
            if channels.insert(key, channel).is_some() {
                return Err(ChannelMapError::Duplicate {
                    vendor: entry.vendor,
                    metric: entry.metric,
                });
            }
        }
        Ok(Self { channels })
    }

    /// Channel for a vendor/metric pair, `None` when unsupported.
    #[must_use]
    pub fn lookup(&self, vendor: VendorProfile, metric: Metric) -> Option<ChannelRef> {
        self.channels.get(&(vendor, metric)).copied()
    }

    /// Reverse lookup: which metric a characteristic carries for a vendor.
    #[must_use]
    pub fn metric_for(&self, vendor: VendorProfile, characteristic: Uuid) -> Option<Metric> {
        self.channels
            .iter()
            .find(|((v, _), c)| *v == vendor && c.characteristic == characteristic)
            .map(|((_, m), _)| *m)
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// True when the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        APPLE_ECG_UUID, BATTERY_LEVEL_UUID, HEART_RATE_MEASUREMENT_UUID, SAMSUNG_HEALTH_SERVICE_UUID,
        SAMSUNG_PPG_UUID,
    };

    #[test]
    fn test_builtin_table_parses() {
        let map = VendorChannelMap::builtin();
        assert_eq!(map.len(), 12);
    }

    #[test]
    fn test_builtin_vendor_channels() {
        let map = VendorChannelMap::builtin();

        let ppg = map.lookup(VendorProfile::Samsung, Metric::Ppg).unwrap();
        assert_eq!(ppg.service, SAMSUNG_HEALTH_SERVICE_UUID);
        assert_eq!(ppg.characteristic, SAMSUNG_PPG_UUID);

        let ecg = map.lookup(VendorProfile::Apple, Metric::Ecg).unwrap();
        assert_eq!(ecg.characteristic, APPLE_ECG_UUID);
    }

    #[test]
    fn test_generic_has_no_vendor_channels() {
        let map = VendorChannelMap::builtin();
        for vendor in [VendorProfile::Generic, VendorProfile::Unknown] {
            assert!(map.lookup(vendor, Metric::Ecg).is_none());
            assert!(map.lookup(vendor, Metric::Ppg).is_none());
            assert!(map.lookup(vendor, Metric::HeartRate).is_some());
            assert!(map.lookup(vendor, Metric::Battery).is_some());
        }
    }

    #[test]
    fn test_metric_for_characteristic() {
        let map = VendorChannelMap::builtin();
        assert_eq!(
            map.metric_for(VendorProfile::Generic, HEART_RATE_MEASUREMENT_UUID),
            Some(Metric::HeartRate)
        );
        assert_eq!(
            map.metric_for(VendorProfile::Apple, BATTERY_LEVEL_UUID),
            Some(Metric::Battery)
        );
        assert_eq!(map.metric_for(VendorProfile::Generic, SAMSUNG_PPG_UUID), None);
    }

    #[test]
    fn test_custom_vendor_table() {
        let json = r#"{ "entries": [
            { "vendor": "generic", "metric": "ecg",
              "service": "12340001-1234-5678-9abc-def012345678",
              "characteristic": "12340002-1234-5678-9abc-def012345678" }
        ] }"#;
        let map = VendorChannelMap::from_json(json).unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.lookup(VendorProfile::Generic, Metric::Ecg).is_some());
        assert!(map.lookup(VendorProfile::Generic, Metric::HeartRate).is_none());
    }

    #[test]
    fn test_duplicate_rows_rejected() {
        let entry = ChannelEntry {
            vendor: VendorProfile::Apple,
            metric: Metric::Battery,
            service: Uuid::from_u128(1),
            characteristic: Uuid::from_u128(2),
        };
        let err = VendorChannelMap::from_entries([entry.clone(), entry]).unwrap_err();
        assert!(matches!(err, ChannelMapError::Duplicate { .. }));
    }

    #[test]
    fn test_bad_json_rejected() {
        assert!(matches!(
            VendorChannelMap::from_json("{ \"entries\": [ { \"vendor\": \"nokia\" } ] }"),
            Err(ChannelMapError::Parse(_))
        ));
    }
}
