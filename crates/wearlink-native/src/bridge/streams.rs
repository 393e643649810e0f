//! Notification stream management
//!
//! Owns every active monitoring subscription. Each `(device, metric)` pair
//! has at most one subscription; starting a new one replaces the old one.
//!
//! # Data path
//!
//! ```text
//! characteristic / simulator ──► producer task ──► bounded queue ──► delivery task ──► callback
//!                                  (decode)                            (DeliveryGate)
//! ```
//!
//! The [`DeliveryGate`] is the only way a sample reaches a callback. Closing
//! it waits for an in-flight callback to return, so once teardown returns no
//! further invocation can happen. A callback must therefore not stop its
//! own subscription or disconnect its own device synchronously; spawn a
//! task for that instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use wearlink_core::error::MonitorError;
use wearlink_core::protocol::decode;
use wearlink_core::simulation::{SimulationConfig, Simulator};
use wearlink_core::types::{now_us, ChannelRef, DeviceId, Metric, Sample};

use super::connection::ConnectionManager;
use super::resolver::ChannelResolver;
use super::synthetic;
use super::transport::{NotificationStream, PeripheralLink};

/// Sample consumer.
pub type SampleCallback = Arc<dyn Fn(Sample) + Send + Sync>;

/// Identifies one monitoring subscription.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionHandle {
    /// Monitored device
    pub device_id: DeviceId,
    /// Monitored metric
    pub metric: Metric,
    /// Unique per subscription, never reused
    pub callback_id: u64,
}

/// Stream manager settings.
#[derive(Clone, Debug)]
pub struct StreamSettings {
    /// Simulator parameters
    pub simulation: SimulationConfig,
    /// Serve simulated samples when no real channel is usable
    pub simulation_fallback: bool,
    /// Samples buffered between producer and callback
    pub queue_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            simulation: SimulationConfig::default(),
            simulation_fallback: true,
            queue_capacity: 256,
        }
    }
}

// ============================================================================
// Delivery gate
// ============================================================================

/// Serializes callback invocation against teardown.
pub struct DeliveryGate {
    callback: Mutex<Option<SampleCallback>>,
}

impl DeliveryGate {
    fn new(callback: SampleCallback) -> Self {
        Self {
            callback: Mutex::new(Some(callback)),
        }
    }

    /// Invoke the callback. Returns false once the gate is closed.
    pub fn deliver(&self, sample: Sample) -> bool {
        let guard = self.callback.lock();
        match guard.as_ref() {
            Some(callback) => {
                callback(sample);
                true
            }
            None => false,
        }
    }

    /// Close the gate, waiting for an in-flight callback to return.
    pub fn close(&self) {
        self.callback.lock().take();
    }

    /// Whether samples are still delivered.
    pub fn is_open(&self) -> bool {
        self.callback.lock().is_some()
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

enum Feed {
    Device {
        link: Arc<dyn PeripheralLink>,
        channel: ChannelRef,
        stream: NotificationStream,
    },
    Simulated,
}

enum Source {
    Device {
        link: Arc<dyn PeripheralLink>,
        channel: ChannelRef,
    },
    Simulated,
}

impl Source {
    fn channel(&self) -> Option<ChannelRef> {
        match self {
            Self::Device { channel, .. } => Some(*channel),
            Self::Simulated => None,
        }
    }
}

struct ActiveSubscription {
    handle: SubscriptionHandle,
    gate: Arc<DeliveryGate>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    source: Source,
}

impl ActiveSubscription {
    /// Stop delivery. Synchronous; after return the callback is never
    /// invoked again.
    fn close(&self) {
        self.gate.close();
        self.cancel.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct StreamsInner {
    connections: ConnectionManager,
    resolver: ChannelResolver,
    settings: StreamSettings,
    subscriptions: Mutex<HashMap<(DeviceId, Metric), ActiveSubscription>>,
    drivers: Mutex<HashMap<DeviceId, Arc<watch::Sender<Option<u16>>>>>,
    next_callback_id: AtomicU64,
    stream_ended: mpsc::UnboundedSender<SubscriptionHandle>,
}

impl Drop for StreamsInner {
    fn drop(&mut self) {
        for (_, active) in self.subscriptions.get_mut().drain() {
            active.close();
        }
    }
}

/// Subscription table.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct NotificationStreamManager {
    inner: Arc<StreamsInner>,
}

impl NotificationStreamManager {
    /// Create a manager.
    ///
    /// The returned receiver yields the handle of every subscription whose
    /// notification stream ended without being stopped. Usually the link is
    /// gone; if it is not, the subscription is dead and should be stopped.
    pub fn new(
        connections: ConnectionManager,
        resolver: ChannelResolver,
        settings: StreamSettings,
    ) -> (Self, mpsc::UnboundedReceiver<SubscriptionHandle>) {
        let (stream_ended, stream_ended_rx) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(StreamsInner {
                connections,
                resolver,
                settings,
                subscriptions: Mutex::new(HashMap::new()),
                drivers: Mutex::new(HashMap::new()),
                next_callback_id: AtomicU64::new(1),
                stream_ended,
            }),
        };
        (manager, stream_ended_rx)
    }

    /// Start delivering `metric` samples from a device to `on_sample`.
    ///
    /// Uses the device's real characteristic when it resolves; otherwise,
    /// with fallback enabled, a simulated stream of the same metric. An
    /// existing subscription for the same pair is stopped first.
    ///
    /// # Errors
    ///
    /// Only with simulation fallback disabled: the reason no real channel
    /// could be used.
    pub async fn start_monitoring(
        &self,
        device_id: &DeviceId,
        metric: Metric,
        on_sample: SampleCallback,
    ) -> Result<SubscriptionHandle, MonitorError> {
        let key = (device_id.clone(), metric);

        let previous = self.inner.subscriptions.lock().remove(&key);
        if let Some(previous) = previous {
            tracing::debug!(
                "Replacing {} {} subscription #{}",
                device_id,
                metric,
                previous.handle.callback_id
            );
            self.retire(previous).await;
        }

        let feed = self.open_feed(device_id, metric).await?;

        let handle = SubscriptionHandle {
            device_id: device_id.clone(),
            metric,
            callback_id: self.inner.next_callback_id.fetch_add(1, Ordering::Relaxed),
        };
        let active = self.spawn(handle.clone(), feed, on_sample);
        self.install(key, active).await;

        tracing::info!(
            "Monitoring {} {} (subscription #{})",
            device_id,
            metric,
            handle.callback_id
        );
        Ok(handle)
    }

    /// Stop a subscription. Stale or unknown handles are ignored.
    ///
    /// After this returns the callback is not invoked again.
    pub async fn stop_monitoring(&self, handle: &SubscriptionHandle) {
        let key = (handle.device_id.clone(), handle.metric);
        let removed = {
            let mut subscriptions = self.inner.subscriptions.lock();
            match subscriptions.get(&key) {
                Some(active) if active.handle.callback_id == handle.callback_id => {
                    subscriptions.remove(&key)
                }
                _ => None,
            }
        };

        if let Some(active) = removed {
            self.retire(active).await;
            tracing::info!(
                "Stopped {} {} (subscription #{})",
                handle.device_id,
                handle.metric,
                handle.callback_id
            );
        }
    }

    /// Drop every subscription of a device without touching the link.
    ///
    /// Used when the link is already gone or about to be closed. Returns the
    /// number of subscriptions invalidated.
    pub fn invalidate_device(&self, device_id: &DeviceId) -> usize {
        let removed: Vec<ActiveSubscription> = {
            let mut subscriptions = self.inner.subscriptions.lock();
            let keys: Vec<_> = subscriptions
                .keys()
                .filter(|(id, _)| id == device_id)
                .cloned()
                .collect();
            keys.iter()
                .filter_map(|key| subscriptions.remove(key))
                .collect()
        };
        self.inner.drivers.lock().remove(device_id);

        for active in &removed {
            active.close();
        }
        if !removed.is_empty() {
            tracing::debug!(
                "Invalidated {} subscriptions for {}",
                removed.len(),
                device_id
            );
        }
        removed.len()
    }

    /// Whether a handle still refers to a live subscription.
    pub fn is_active(&self, handle: &SubscriptionHandle) -> bool {
        self.inner
            .subscriptions
            .lock()
            .get(&(handle.device_id.clone(), handle.metric))
            .is_some_and(|a| a.handle.callback_id == handle.callback_id)
    }

    /// Handles of all live subscriptions.
    pub fn active_subscriptions(&self) -> Vec<SubscriptionHandle> {
        self.inner
            .subscriptions
            .lock()
            .values()
            .map(|a| a.handle.clone())
            .collect()
    }

    /// Put a subscription in the table.
    ///
    /// A concurrent start for the same pair may have slipped in; it is
    /// retired, except that a characteristic both of them read stays
    /// subscribed.
    async fn install(&self, key: (DeviceId, Metric), active: ActiveSubscription) {
        let ours = active.source.channel();
        let interloper = self.inner.subscriptions.lock().insert(key, active);
        let Some(interloper) = interloper else {
            return;
        };

        if ours.is_some() && interloper.source.channel() == ours {
            interloper.close();
        } else {
            self.retire(interloper).await;
        }
    }

    /// Close a removed subscription and disable its notifications.
    async fn retire(&self, active: ActiveSubscription) {
        active.close();

        if let Source::Device { link, channel } = &active.source {
            if let Err(e) = link.unsubscribe(*channel).await {
                tracing::debug!("{}: unsubscribe failed: {}", active.handle.device_id, e);
            }
            if active.handle.metric == Metric::HeartRate {
                if let Some(driver) = self.inner.drivers.lock().get(&active.handle.device_id) {
                    driver.send_replace(None);
                }
            }
        }
    }

    /// Pick the real channel, or fall back to simulation.
    async fn open_feed(&self, device_id: &DeviceId, metric: Metric) -> Result<Feed, MonitorError> {
        let connections = &self.inner.connections;
        let (Some(session), Some(link), Some(vendor)) = (
            connections.session(device_id),
            connections.link(device_id),
            connections.vendor(device_id),
        ) else {
            return self.fall_back(
                device_id,
                metric,
                MonitorError::NotConnected(device_id.to_string()),
            );
        };

        let channel = match self.inner.resolver.resolve(&session, vendor, metric) {
            Ok(channel) => channel,
            Err(e) => return self.fall_back(device_id, metric, e.into()),
        };

        match link.subscribe(channel).await {
            Ok(stream) => Ok(Feed::Device {
                link,
                channel,
                stream,
            }),
            Err(e) => self.fall_back(device_id, metric, MonitorError::Notify(e.to_string())),
        }
    }

    fn fall_back(
        &self,
        device_id: &DeviceId,
        metric: Metric,
        reason: MonitorError,
    ) -> Result<Feed, MonitorError> {
        if !self.inner.settings.simulation_fallback {
            return Err(reason);
        }
        tracing::warn!(
            "{} {}: {}; serving simulated samples",
            device_id,
            metric,
            reason
        );
        Ok(Feed::Simulated)
    }

    fn driver(&self, device_id: &DeviceId) -> Arc<watch::Sender<Option<u16>>> {
        Arc::clone(
            self.inner
                .drivers
                .lock()
                .entry(device_id.clone())
                .or_insert_with(|| Arc::new(watch::channel(None).0)),
        )
    }

    fn spawn(
        &self,
        handle: SubscriptionHandle,
        feed: Feed,
        on_sample: SampleCallback,
    ) -> ActiveSubscription {
        let gate = Arc::new(DeliveryGate::new(on_sample));
        let cancel = CancellationToken::new();
        let (queue_tx, queue_rx) = mpsc::channel(self.inner.settings.queue_capacity.max(1));
        // Only devices with a session share a heart-rate driver
        let driver = match &feed {
            Feed::Device { .. } => Some(self.driver(&handle.device_id)),
            Feed::Simulated if self.inner.connections.is_connected(&handle.device_id) => {
                Some(self.driver(&handle.device_id))
            }
            Feed::Simulated => None,
        };

        let (producer, source) = match feed {
            Feed::Device {
                link,
                channel,
                stream,
            } => {
                let driver = driver.filter(|_| handle.metric == Metric::HeartRate);
                let producer = tokio::spawn(pump_notifications(
                    handle.clone(),
                    stream,
                    queue_tx,
                    driver,
                    cancel.clone(),
                    self.inner.stream_ended.clone(),
                ));
                (producer, Source::Device { link, channel })
            }
            Feed::Simulated => {
                let driver = driver
                    .filter(|_| handle.metric != Metric::HeartRate)
                    .map(|driver| driver.subscribe());
                let initial = driver.as_ref().and_then(|rx| *rx.borrow());
                let simulation = self.inner.settings.simulation.clone();
                let tick = Duration::from_millis(simulation.tick_ms.max(1));
                let simulator = Simulator::with_config(handle.metric, initial, simulation);
                let producer = tokio::spawn(synthetic::simulated_stream(
                    simulator,
                    tick,
                    queue_tx,
                    driver,
                    cancel.clone(),
                ));
                (producer, Source::Simulated)
            }
        };

        let delivery = tokio::spawn(deliver_samples(queue_rx, Arc::clone(&gate), cancel.clone()));

        ActiveSubscription {
            handle,
            gate,
            cancel,
            tasks: vec![producer, delivery],
            source,
        }
    }
}

/// Decode notifications into the queue until cancelled or the stream ends.
async fn pump_notifications(
    handle: SubscriptionHandle,
    mut stream: NotificationStream,
    queue: mpsc::Sender<Sample>,
    driver: Option<Arc<watch::Sender<Option<u16>>>>,
    cancel: CancellationToken,
    stream_ended: mpsc::UnboundedSender<SubscriptionHandle>,
) {
    let device_id = &handle.device_id;
    let metric = handle.metric;
    loop {
        let payload = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            payload = stream.next() => payload,
        };

        let Some(payload) = payload else {
            if !cancel.is_cancelled() {
                tracing::warn!("{} {} notification stream ended", device_id, metric);
                let _ = stream_ended.send(handle.clone());
            }
            return;
        };

        let sample = match decode(metric, &payload, now_us()) {
            Ok(sample) => sample,
            Err(e) => {
                tracing::warn!("{}: dropping sample: {}", device_id, e);
                continue;
            }
        };

        if let (Some(driver), Sample::HeartRate(hr)) = (&driver, &sample) {
            driver.send_replace(Some(hr.bpm));
        }

        match queue.try_send(sample) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("{} {}: consumer lagging, sample dropped", device_id, metric);
            }
            Err(TrySendError::Closed(_)) => return,
        }
    }
}

/// Hand queued samples to the gate, in order.
async fn deliver_samples(
    mut queue: mpsc::Receiver<Sample>,
    gate: Arc<DeliveryGate>,
    cancel: CancellationToken,
) {
    loop {
        let sample = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            sample = queue.recv() => sample,
        };
        let Some(sample) = sample else {
            return;
        };
        if !gate.deliver(sample) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use wearlink_core::channel_map::VendorChannelMap;
    use wearlink_core::protocol::HEART_RATE_MEASUREMENT_UUID;
    use wearlink_core::types::HeartRateSample;

    use crate::bridge::discovery::{DeviceRegistry, Discovery};
    use crate::bridge::mock::{MockPeripheral, MockTransport};
    use crate::bridge::transport::BleTransport;

    async fn connected_strap() -> (MockTransport, NotificationStreamManager) {
        let transport =
            MockTransport::with_peripherals([MockPeripheral::heart_rate_strap("h10", "Polar H10")]);
        let shared: Arc<dyn BleTransport> = Arc::new(transport.clone());
        let registry = DeviceRegistry::new();
        Discovery::new(Arc::clone(&shared), registry.clone(), Duration::from_millis(10))
            .scan(None)
            .await
            .unwrap();
        let connections = ConnectionManager::new(shared, registry, Duration::from_secs(10));
        connections.connect(&DeviceId::from("h10")).await.unwrap();

        let resolver = ChannelResolver::new(Arc::new(VendorChannelMap::builtin()));
        let (manager, _ended) =
            NotificationStreamManager::new(connections, resolver, StreamSettings::default());
        (transport, manager)
    }

    fn subscription(manager: &NotificationStreamManager, feed: Feed) -> ActiveSubscription {
        let handle = SubscriptionHandle {
            device_id: DeviceId::from("h10"),
            metric: Metric::HeartRate,
            callback_id: manager.inner.next_callback_id.fetch_add(1, Ordering::Relaxed),
        };
        manager.spawn(handle, feed, Arc::new(|_: Sample| {}))
    }

    fn hr(bpm: u16) -> Sample {
        Sample::HeartRate(HeartRateSample {
            bpm,
            timestamp_us: 0,
        })
    }

    #[test]
    fn test_gate_delivers_until_closed() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let gate = DeliveryGate::new(Arc::new(move |_: Sample| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(gate.deliver(hr(60)));
        assert!(gate.deliver(hr(61)));
        gate.close();
        assert!(!gate.is_open());
        assert!(!gate.deliver(hr(62)));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_gate_close_waits_for_inflight_callback() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let finished = Arc::new(AtomicUsize::new(0));
        let done = Arc::clone(&finished);

        let gate = Arc::new(DeliveryGate::new(Arc::new(move |_: Sample| {
            entered_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(50));
            done.fetch_add(1, Ordering::SeqCst);
        })));

        let worker = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || gate.deliver(hr(70)))
        };
        entered_rx.recv().unwrap();
        gate.close();

        // Close returned, so the callback must have finished
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(worker.join().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_interloper_is_unsubscribed() {
        let (transport, manager) = connected_strap().await;
        let id = DeviceId::from("h10");
        let key = (id.clone(), Metric::HeartRate);

        let feed = manager.open_feed(&id, Metric::HeartRate).await.unwrap();
        manager.install(key.clone(), subscription(&manager, feed)).await;
        assert_eq!(transport.subscriber_count(&id, HEART_RATE_MEASUREMENT_UUID), 1);

        manager
            .install(key, subscription(&manager, Feed::Simulated))
            .await;
        assert_eq!(transport.subscriber_count(&id, HEART_RATE_MEASUREMENT_UUID), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interloper_on_same_characteristic_keeps_it_subscribed() {
        let (transport, manager) = connected_strap().await;
        let id = DeviceId::from("h10");
        let key = (id.clone(), Metric::HeartRate);

        let first = manager.open_feed(&id, Metric::HeartRate).await.unwrap();
        let second = manager.open_feed(&id, Metric::HeartRate).await.unwrap();
        manager.install(key.clone(), subscription(&manager, first)).await;
        manager.install(key, subscription(&manager, second)).await;

        assert!(transport.subscriber_count(&id, HEART_RATE_MEASUREMENT_UUID) >= 1);
        assert_eq!(manager.active_subscriptions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_only_for_connected_devices() {
        let (_, manager) = connected_strap().await;

        let ghost = DeviceId::from("ghost");
        let handle = manager
            .start_monitoring(&ghost, Metric::Ecg, Arc::new(|_: Sample| {}))
            .await
            .unwrap();
        assert!(manager.inner.drivers.lock().is_empty());
        manager.stop_monitoring(&handle).await;

        let strap = DeviceId::from("h10");
        manager
            .start_monitoring(&strap, Metric::Ecg, Arc::new(|_: Sample| {}))
            .await
            .unwrap();
        assert!(manager.inner.drivers.lock().contains_key(&strap));

        manager.invalidate_device(&strap);
        assert!(manager.inner.drivers.lock().is_empty());
    }
}
