//! In-memory transport
//!
//! Behaves like a radio with a fixed set of peripherals. Tests and the
//! `--transport mock` CLI mode drive it by pushing notification payloads and
//! dropping links by hand.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use wearlink_core::error::{ConnectError, ScanError};
use wearlink_core::protocol::{
    APPLE_ECG_UUID, APPLE_HEALTH_SERVICE_UUID, APPLE_PPG_UUID, BATTERY_LEVEL_UUID,
    BATTERY_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID,
    SAMSUNG_ECG_UUID, SAMSUNG_HEALTH_SERVICE_UUID, SAMSUNG_PPG_UUID,
};
use wearlink_core::types::{ChannelRef, DeviceId, ServiceCache};

use super::transport::{
    AdvertisedPeripheral, BleTransport, LinkError, NotificationStream, PeripheralLink,
    TransportEvent,
};

/// Per-subscriber notification buffer
const NOTIFY_CAPACITY: usize = 64;

// ============================================================================
// Peripherals
// ============================================================================

/// A simulated peripheral.
#[derive(Clone, Debug)]
pub struct MockPeripheral {
    /// Identifier
    pub id: DeviceId,
    /// Advertised name
    pub name: Option<String>,
    /// Services listed in the advertisement
    pub advertised_services: Vec<Uuid>,
    /// Signal strength
    pub rssi: Option<i16>,
    /// Services and characteristics exposed after connecting
    pub gatt: ServiceCache,
    /// Battery Level value, when the battery service is exposed
    pub battery: Option<u8>,
}

impl MockPeripheral {
    /// Bare peripheral with no services.
    pub fn new(id: impl Into<DeviceId>, name: Option<&str>) -> Self {
        Self {
            id: id.into(),
            name: name.map(str::to_owned),
            advertised_services: Vec::new(),
            rssi: Some(-60),
            gatt: ServiceCache::new(),
            battery: None,
        }
    }

    /// Expose a characteristic.
    #[must_use]
    pub fn with_channel(mut self, service: Uuid, characteristic: Uuid) -> Self {
        self.gatt.insert(service, characteristic);
        self
    }

    /// List a service in the advertisement.
    #[must_use]
    pub fn advertising(mut self, service: Uuid) -> Self {
        if !self.advertised_services.contains(&service) {
            self.advertised_services.push(service);
        }
        self
    }

    /// Expose the standard battery service with a fixed level.
    #[must_use]
    pub fn with_battery(mut self, percent: u8) -> Self {
        self.gatt.insert(BATTERY_SERVICE_UUID, BATTERY_LEVEL_UUID);
        self.battery = Some(percent);
        self
    }

    /// Standard heart rate strap.
    pub fn heart_rate_strap(id: impl Into<DeviceId>, name: &str) -> Self {
        Self::new(id, Some(name))
            .advertising(HEART_RATE_SERVICE_UUID)
            .with_channel(HEART_RATE_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID)
            .with_battery(90)
    }

    /// Samsung watch exposing the vendor health service.
    pub fn galaxy_watch(id: impl Into<DeviceId>, name: &str) -> Self {
        Self::heart_rate_strap(id, name)
            .advertising(SAMSUNG_HEALTH_SERVICE_UUID)
            .with_channel(SAMSUNG_HEALTH_SERVICE_UUID, SAMSUNG_ECG_UUID)
            .with_channel(SAMSUNG_HEALTH_SERVICE_UUID, SAMSUNG_PPG_UUID)
    }

    /// Apple watch exposing the vendor health service.
    pub fn apple_watch(id: impl Into<DeviceId>, name: &str) -> Self {
        Self::heart_rate_strap(id, name)
            .advertising(APPLE_HEALTH_SERVICE_UUID)
            .with_channel(APPLE_HEALTH_SERVICE_UUID, APPLE_ECG_UUID)
            .with_channel(APPLE_HEALTH_SERVICE_UUID, APPLE_PPG_UUID)
    }
}

/// Radio availability of the mock adapter.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MockRadio {
    /// Adapter present and usable
    #[default]
    Ready,
    /// No adapter on this host
    Absent,
    /// OS refuses Bluetooth access
    Denied,
}

// ============================================================================
// Transport
// ============================================================================

#[derive(Default)]
struct MockState {
    peripherals: Mutex<Vec<MockPeripheral>>,
    radio: Mutex<MockRadio>,
    connect_delay: Mutex<Duration>,
    failing_subscribe: Mutex<HashSet<Uuid>>,
    connected: Mutex<HashSet<DeviceId>>,
    negotiating: Mutex<HashSet<DeviceId>>,
    aborted: Mutex<HashSet<DeviceId>>,
    subscribers: Mutex<HashMap<(DeviceId, Uuid), Vec<mpsc::Sender<Vec<u8>>>>>,
    scanning: Mutex<bool>,
    events: Mutex<Option<broadcast::Sender<TransportEvent>>>,
}

impl MockState {
    fn emit(&self, event: TransportEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn peripheral(&self, id: &DeviceId) -> Option<MockPeripheral> {
        self.peripherals.lock().iter().find(|p| &p.id == id).cloned()
    }

    fn is_connected(&self, id: &DeviceId) -> bool {
        self.connected.lock().contains(id)
    }
}

/// In-memory [`BleTransport`].
///
/// Cheap to clone; clones share the same radio.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Empty radio.
    #[must_use]
    pub fn new() -> Self {
        let state = MockState::default();
        let (tx, _) = broadcast::channel(64);
        *state.events.lock() = Some(tx);
        Self {
            state: Arc::new(state),
        }
    }

    /// Radio with the given peripherals in range.
    #[must_use]
    pub fn with_peripherals(peripherals: impl IntoIterator<Item = MockPeripheral>) -> Self {
        let transport = Self::new();
        for p in peripherals {
            transport.add_peripheral(p);
        }
        transport
    }

    /// Bring a peripheral into range.
    pub fn add_peripheral(&self, peripheral: MockPeripheral) {
        self.state.peripherals.lock().push(peripheral);
    }

    /// Change adapter availability.
    pub fn set_radio(&self, radio: MockRadio) {
        *self.state.radio.lock() = radio;
    }

    /// Delay every link negotiation.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock() = delay;
    }

    /// Make enabling notifications on a characteristic fail.
    pub fn fail_subscribe(&self, characteristic: Uuid) {
        self.state.failing_subscribe.lock().insert(characteristic);
    }

    /// Whether a scan is running.
    pub fn is_scanning(&self) -> bool {
        *self.state.scanning.lock()
    }

    /// Whether a link to the device is up.
    pub fn is_link_up(&self, id: &DeviceId) -> bool {
        self.state.is_connected(id)
    }

    /// Number of live notification subscribers on a characteristic.
    pub fn subscriber_count(&self, id: &DeviceId, characteristic: Uuid) -> usize {
        self.state
            .subscribers
            .lock()
            .get(&(id.clone(), characteristic))
            .map_or(0, |subs| subs.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Push a notification payload. Returns how many subscribers got it.
    ///
    /// A full subscriber buffer drops the payload for that subscriber.
    pub fn notify(&self, id: &DeviceId, characteristic: Uuid, payload: &[u8]) -> usize {
        let mut subscribers = self.state.subscribers.lock();
        let Some(subs) = subscribers.get_mut(&(id.clone(), characteristic)) else {
            return 0;
        };
        subs.retain(|tx| !tx.is_closed());
        subs.iter()
            .filter(|tx| tx.try_send(payload.to_vec()).is_ok())
            .count()
    }

    /// Simulate the peripheral going out of range.
    ///
    /// Ends every notification stream and emits
    /// [`TransportEvent::Disconnected`]. A negotiation still in progress for
    /// the device fails with [`ConnectError::LinkLost`].
    pub fn drop_link(&self, id: &DeviceId) {
        let was_connected = self.state.connected.lock().remove(id);
        let was_negotiating = self.state.negotiating.lock().contains(id);
        if was_negotiating {
            self.state.aborted.lock().insert(id.clone());
        }
        self.state.subscribers.lock().retain(|(dev, _), _| dev != id);
        if was_connected || was_negotiating {
            tracing::debug!("Mock link to {} dropped", id);
            self.state.emit(TransportEvent::Disconnected(id.clone()));
        }
    }

    /// End the notification streams of one characteristic while the link
    /// stays up.
    pub fn end_notifications(&self, id: &DeviceId, characteristic: Uuid) {
        self.state
            .subscribers
            .lock()
            .remove(&(id.clone(), characteristic));
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn start_scan(&self) -> Result<(), ScanError> {
        match *self.state.radio.lock() {
            MockRadio::Ready => {}
            MockRadio::Absent => return Err(ScanError::Unsupported),
            MockRadio::Denied => return Err(ScanError::PermissionDenied),
        }
        *self.state.scanning.lock() = true;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), ScanError> {
        *self.state.scanning.lock() = false;
        Ok(())
    }

    async fn peripherals(&self) -> Result<Vec<AdvertisedPeripheral>, ScanError> {
        Ok(self
            .state
            .peripherals
            .lock()
            .iter()
            .map(|p| AdvertisedPeripheral {
                id: p.id.clone(),
                name: p.name.clone(),
                services: p.advertised_services.clone(),
                rssi: p.rssi,
            })
            .collect())
    }

    async fn connect(&self, id: &DeviceId) -> Result<Arc<dyn PeripheralLink>, ConnectError> {
        if *self.state.radio.lock() != MockRadio::Ready {
            return Err(ConnectError::Transport("radio unavailable".into()));
        }
        if self.state.peripheral(id).is_none() {
            return Err(ConnectError::DeviceNotFound(id.to_string()));
        }

        let delay = *self.state.connect_delay.lock();
        self.state.aborted.lock().remove(id);
        self.state.negotiating.lock().insert(id.clone());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.negotiating.lock().remove(id);
        if self.state.aborted.lock().remove(id) {
            return Err(ConnectError::LinkLost);
        }

        self.state.connected.lock().insert(id.clone());
        Ok(Arc::new(MockLink {
            id: id.clone(),
            state: Arc::clone(&self.state),
        }))
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        match self.state.events.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }
}

struct MockLink {
    id: DeviceId,
    state: Arc<MockState>,
}

impl MockLink {
    fn ensure_connected(&self) -> Result<MockPeripheral, LinkError> {
        if !self.state.is_connected(&self.id) {
            return Err(LinkError::NotConnected);
        }
        self.state.peripheral(&self.id).ok_or(LinkError::NotConnected)
    }

    fn ensure_exposed(&self, channel: ChannelRef) -> Result<MockPeripheral, LinkError> {
        let peripheral = self.ensure_connected()?;
        if peripheral
            .gatt
            .contains(channel.service, channel.characteristic)
        {
            Ok(peripheral)
        } else {
            Err(LinkError::CharacteristicNotFound(channel.characteristic))
        }
    }
}

#[async_trait]
impl PeripheralLink for MockLink {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    async fn is_connected(&self) -> bool {
        self.state.is_connected(&self.id)
    }

    async fn discover_services(&self) -> Result<ServiceCache, LinkError> {
        Ok(self.ensure_connected()?.gatt)
    }

    async fn subscribe(&self, channel: ChannelRef) -> Result<NotificationStream, LinkError> {
        self.ensure_exposed(channel)?;
        if self
            .state
            .failing_subscribe
            .lock()
            .contains(&channel.characteristic)
        {
            return Err(LinkError::Io("CCCD write rejected".into()));
        }

        let (tx, rx) = mpsc::channel(NOTIFY_CAPACITY);
        self.state
            .subscribers
            .lock()
            .entry((self.id.clone(), channel.characteristic))
            .or_default()
            .push(tx);
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn unsubscribe(&self, channel: ChannelRef) -> Result<(), LinkError> {
        self.state
            .subscribers
            .lock()
            .remove(&(self.id.clone(), channel.characteristic));
        Ok(())
    }

    async fn read(&self, channel: ChannelRef) -> Result<Vec<u8>, LinkError> {
        let peripheral = self.ensure_exposed(channel)?;
        match (channel.characteristic, peripheral.battery) {
            (c, Some(level)) if c == BATTERY_LEVEL_UUID => Ok(vec![level]),
            _ => Err(LinkError::Io("characteristic not readable".into())),
        }
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.state.connected.lock().remove(&self.id);
        self.state
            .subscribers
            .lock()
            .retain(|(dev, _), _| dev != &self.id);
        Ok(())
    }
}
