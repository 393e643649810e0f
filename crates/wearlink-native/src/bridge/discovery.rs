//! Device discovery
//!
//! Runs a bounded scan, keeps candidates that advertise one of the
//! discovery services or carry a known name prefix, and classifies them.
//! Every descriptor returned is remembered in the [`DeviceRegistry`] so the
//! connection manager can later resolve ids to vendors.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use wearlink_core::classifier::classify_name;
use wearlink_core::error::ScanError;
use wearlink_core::protocol::{DISCOVERY_NAME_PREFIXES, DISCOVERY_SERVICES};
use wearlink_core::types::{DeviceDescriptor, DeviceId};

use super::transport::{AdvertisedPeripheral, BleTransport};

/// Descriptors seen by discovery, keyed by id.
#[derive(Clone, Debug, Default)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<HashMap<DeviceId, DeviceDescriptor>>>,
}

impl DeviceRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a descriptor, replacing any previous one for the same id.
    pub fn register(&self, descriptor: DeviceDescriptor) {
        self.devices
            .write()
            .insert(descriptor.id.clone(), descriptor);
    }

    /// Look up a descriptor.
    pub fn get(&self, id: &DeviceId) -> Option<DeviceDescriptor> {
        self.devices.read().get(id).cloned()
    }

    /// All known descriptors.
    pub fn all(&self) -> Vec<DeviceDescriptor> {
        self.devices.read().values().cloned().collect()
    }
}

/// Whether an advertisement looks like a supported wearable.
pub fn matches_signature(peripheral: &AdvertisedPeripheral) -> bool {
    let by_service = peripheral
        .services
        .iter()
        .any(|s| DISCOVERY_SERVICES.contains(s));
    let by_name = peripheral
        .name
        .as_deref()
        .is_some_and(|name| DISCOVERY_NAME_PREFIXES.iter().any(|p| name.starts_with(p)));
    by_service || by_name
}

fn matches_hint(peripheral: &AdvertisedPeripheral, hint: Option<&str>) -> bool {
    match hint {
        None => true,
        Some(hint) => peripheral
            .name
            .as_deref()
            .is_some_and(|name| name.to_lowercase().contains(&hint.to_lowercase())),
    }
}

fn describe(peripheral: AdvertisedPeripheral) -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_profile: classify_name(peripheral.name.as_deref()),
        id: peripheral.id,
        advertised_name: peripheral.name,
        rssi: peripheral.rssi,
        services: peripheral.services,
    }
}

/// Scanner over a [`BleTransport`].
#[derive(Clone)]
pub struct Discovery {
    transport: Arc<dyn BleTransport>,
    registry: DeviceRegistry,
    scan_window: Duration,
}

impl Discovery {
    /// Create a scanner.
    pub fn new(
        transport: Arc<dyn BleTransport>,
        registry: DeviceRegistry,
        scan_window: Duration,
    ) -> Self {
        Self {
            transport,
            registry,
            scan_window,
        }
    }

    /// Scan for the full window.
    ///
    /// `filter_hint` narrows results to names containing it,
    /// case-insensitively.
    ///
    /// # Errors
    ///
    /// [`ScanError::NoDeviceFound`] when nothing matched, or whatever the
    /// transport reports for radio problems.
    pub async fn scan(&self, filter_hint: Option<&str>) -> Result<Vec<DeviceDescriptor>, ScanError> {
        self.scan_until(filter_hint, std::future::pending::<()>()).await
    }

    /// Scan until the window elapses or `cancel` completes, whichever is
    /// first. A cancelled scan still returns what it saw so far.
    ///
    /// # Errors
    ///
    /// Same as [`Discovery::scan`].
    pub async fn scan_until<C>(
        &self,
        filter_hint: Option<&str>,
        cancel: C,
    ) -> Result<Vec<DeviceDescriptor>, ScanError>
    where
        C: Future<Output = ()> + Send,
    {
        tracing::info!(
            "Starting BLE scan ({} ms, hint: {:?})",
            self.scan_window.as_millis(),
            filter_hint
        );
        self.transport.start_scan().await?;

        tokio::select! {
            () = tokio::time::sleep(self.scan_window) => {}
            () = cancel => tracing::info!("Scan cancelled"),
        }

        if let Err(e) = self.transport.stop_scan().await {
            tracing::warn!("Failed to stop scan: {}", e);
        }

        let devices: Vec<DeviceDescriptor> = self
            .transport
            .peripherals()
            .await?
            .into_iter()
            .filter(matches_signature)
            .filter(|p| matches_hint(p, filter_hint))
            .map(describe)
            .collect();

        if devices.is_empty() {
            tracing::info!("Scan complete: no matching devices");
            return Err(ScanError::NoDeviceFound);
        }

        for device in &devices {
            tracing::debug!(
                "Found {} ({}) as {}",
                device.label(),
                device.id,
                device.vendor_profile
            );
            self.registry.register(device.clone());
        }
        tracing::info!("Scan complete: found {} devices", devices.len());
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::mock::{MockPeripheral, MockRadio, MockTransport};
    use wearlink_core::types::VendorProfile;

    fn discovery(transport: &MockTransport) -> (Discovery, DeviceRegistry) {
        let registry = DeviceRegistry::new();
        let discovery = Discovery::new(
            Arc::new(transport.clone()),
            registry.clone(),
            Duration::from_millis(50),
        );
        (discovery, registry)
    }

    fn radio() -> MockTransport {
        MockTransport::with_peripherals([
            MockPeripheral::galaxy_watch("gw-5", "Galaxy Watch 5"),
            MockPeripheral::heart_rate_strap("h10", "Polar H10"),
            // Name prefix only, no advertised services
            MockPeripheral::new("aw", Some("Apple Watch Ultra")),
            // Neither
            MockPeripheral::new("tv", Some("Living Room TV")),
        ])
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_filters_and_classifies() {
        let transport = radio();
        let (discovery, registry) = discovery(&transport);

        let mut found = discovery.scan(None).await.unwrap();
        found.sort_by(|a, b| a.id.cmp(&b.id));

        let summary: Vec<_> = found
            .iter()
            .map(|d| (d.id.as_str(), d.vendor_profile))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("aw", VendorProfile::Apple),
                ("gw-5", VendorProfile::Samsung),
                ("h10", VendorProfile::Generic),
            ]
        );
        assert_eq!(registry.all().len(), 3);
        assert!(!transport.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_hint_is_case_insensitive() {
        let (discovery, _) = discovery(&radio());
        let found = discovery.scan(Some("galaxy")).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].label(), "Galaxy Watch 5");
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_without_match() {
        let (discovery, _) = discovery(&radio());
        assert_eq!(
            discovery.scan(Some("fitbit")).await,
            Err(ScanError::NoDeviceFound)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_radio_errors() {
        let transport = radio();
        let (discovery, _) = discovery(&transport);

        transport.set_radio(MockRadio::Denied);
        assert_eq!(discovery.scan(None).await, Err(ScanError::PermissionDenied));

        transport.set_radio(MockRadio::Absent);
        assert_eq!(discovery.scan(None).await, Err(ScanError::Unsupported));
    }

    #[tokio::test]
    async fn test_cancelled_scan_returns_early() {
        let transport = radio();
        let registry = DeviceRegistry::new();
        let discovery = Discovery::new(
            Arc::new(transport.clone()),
            registry,
            Duration::from_secs(3600),
        );

        let found = tokio::time::timeout(
            Duration::from_secs(5),
            discovery.scan_until(None, async {}),
        )
        .await
        .expect("cancelled scan should not wait for the window")
        .unwrap();
        assert_eq!(found.len(), 3);
    }
}
