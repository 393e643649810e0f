//! Acquisition facade
//!
//! Single entry point wiring discovery, sessions and notification streams
//! over one transport, plus the link watcher that tears everything down for
//! a device whose link drops.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use wearlink_core::channel_map::VendorChannelMap;
use wearlink_core::error::{ChannelMapError, ConnectError, MonitorError, ScanError};
use wearlink_core::types::{DeviceDescriptor, DeviceId, Metric, Sample, Session};

use crate::bridge::connection::ConnectionManager;
use crate::bridge::discovery::{DeviceRegistry, Discovery};
use crate::bridge::resolver::ChannelResolver;
use crate::bridge::streams::{NotificationStreamManager, SubscriptionHandle};
use crate::bridge::transport::{BleTransport, TransportEvent};
use crate::config::AcquisitionConfig;

/// Wearable acquisition over one transport.
///
/// Must be created inside a tokio runtime.
pub struct Acquisition {
    config: AcquisitionConfig,
    registry: DeviceRegistry,
    discovery: Discovery,
    connections: ConnectionManager,
    resolver: ChannelResolver,
    streams: NotificationStreamManager,
    watcher: JoinHandle<()>,
}

impl Acquisition {
    /// Create with the configured (or built-in) vendor table.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelMapError`] if a configured vendor table cannot be
    /// loaded.
    pub fn new(
        transport: Arc<dyn BleTransport>,
        config: AcquisitionConfig,
    ) -> Result<Self, ChannelMapError> {
        let map = config.channel_map()?;
        Ok(Self::with_channel_map(transport, config, map))
    }

    /// Create with an explicit vendor table.
    pub fn with_channel_map(
        transport: Arc<dyn BleTransport>,
        config: AcquisitionConfig,
        map: VendorChannelMap,
    ) -> Self {
        let registry = DeviceRegistry::new();
        let discovery = Discovery::new(
            Arc::clone(&transport),
            registry.clone(),
            config.scan_window(),
        );
        let connections = ConnectionManager::new(
            Arc::clone(&transport),
            registry.clone(),
            config.connect_timeout(),
        );
        let resolver = ChannelResolver::new(Arc::new(map));
        let (streams, stream_ended) = NotificationStreamManager::new(
            connections.clone(),
            resolver.clone(),
            config.stream_settings(),
        );

        let watcher = tokio::spawn(watch_links(
            transport.events(),
            stream_ended,
            connections.clone(),
            streams.clone(),
        ));

        Self {
            config,
            registry,
            discovery,
            connections,
            resolver,
            streams,
            watcher,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// Devices seen by discovery so far.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Vendor table in use.
    pub fn channel_map(&self) -> &VendorChannelMap {
        self.resolver.map()
    }

    /// Scan for the configured window. See [`Discovery::scan`].
    ///
    /// # Errors
    ///
    /// See [`Discovery::scan`].
    pub async fn scan(&self, filter_hint: Option<&str>) -> Result<Vec<DeviceDescriptor>, ScanError> {
        self.discovery.scan(filter_hint).await
    }

    /// Scan until the window elapses or `cancel` completes.
    ///
    /// # Errors
    ///
    /// See [`Discovery::scan`].
    pub async fn scan_until<C>(
        &self,
        filter_hint: Option<&str>,
        cancel: C,
    ) -> Result<Vec<DeviceDescriptor>, ScanError>
    where
        C: Future<Output = ()> + Send,
    {
        self.discovery.scan_until(filter_hint, cancel).await
    }

    /// Connect to a discovered device.
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::connect`].
    pub async fn connect(&self, device_id: &DeviceId) -> Result<Session, ConnectError> {
        self.connections.connect(device_id).await
    }

    /// Disconnect a device. Every subscription on it is invalidated first,
    /// so no callback fires once this returns. Idempotent.
    pub async fn disconnect(&self, device_id: &DeviceId) {
        self.streams.invalidate_device(device_id);
        self.connections.disconnect(device_id).await;
    }

    /// Whether the device has a connected session.
    pub fn is_connected(&self, device_id: &DeviceId) -> bool {
        self.connections.is_connected(device_id)
    }

    /// Snapshot of a device's session.
    pub fn session(&self, device_id: &DeviceId) -> Option<Session> {
        self.connections.session(device_id)
    }

    /// Ids of connected devices.
    pub fn connected_devices(&self) -> Vec<DeviceId> {
        self.connections.connected_devices()
    }

    /// Start delivering samples of `metric` to `on_sample`.
    ///
    /// The callback runs on a runtime worker. It must not call
    /// [`Acquisition::stop_monitoring`] for its own handle or
    /// [`Acquisition::disconnect`] for its own device synchronously.
    ///
    /// # Errors
    ///
    /// Only when simulation fallback is disabled. See
    /// [`NotificationStreamManager::start_monitoring`].
    pub async fn start_monitoring<F>(
        &self,
        device_id: &DeviceId,
        metric: Metric,
        on_sample: F,
    ) -> Result<SubscriptionHandle, MonitorError>
    where
        F: Fn(Sample) + Send + Sync + 'static,
    {
        self.streams
            .start_monitoring(device_id, metric, Arc::new(on_sample))
            .await
    }

    /// Stop a subscription. Stale handles are ignored.
    pub async fn stop_monitoring(&self, handle: &SubscriptionHandle) {
        self.streams.stop_monitoring(handle).await;
    }

    /// Whether a handle still refers to a live subscription.
    pub fn is_monitoring(&self, handle: &SubscriptionHandle) -> bool {
        self.streams.is_active(handle)
    }

    /// Disconnect every device.
    pub async fn shutdown(&self) {
        for device_id in self.connections.connected_devices() {
            self.disconnect(&device_id).await;
        }
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

/// Tear down a device whose link is gone: handles first, then the session.
///
/// A notification stream that ends while its link is still up only takes
/// its own subscription down.
async fn watch_links(
    mut events: broadcast::Receiver<TransportEvent>,
    mut stream_ended: mpsc::UnboundedReceiver<SubscriptionHandle>,
    connections: ConnectionManager,
    streams: NotificationStreamManager,
) {
    let mut events_open = true;
    loop {
        let (device_id, ended) = tokio::select! {
            event = events.recv(), if events_open => match event {
                Ok(TransportEvent::Disconnected(id)) => (id, None),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Link watcher missed {} transport events", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    events_open = false;
                    continue;
                }
            },
            handle = stream_ended.recv() => match handle {
                Some(handle) => (handle.device_id.clone(), Some(handle)),
                None => return,
            },
        };

        if let Some(link) = connections.link(&device_id) {
            if link.is_connected().await {
                match ended {
                    Some(handle) => {
                        tracing::warn!(
                            "{} {} stream ended on a live link, stopping subscription #{}",
                            handle.device_id,
                            handle.metric,
                            handle.callback_id
                        );
                        streams.stop_monitoring(&handle).await;
                    }
                    // A late event for a link that has since been re-established
                    None => tracing::debug!("Ignoring stale disconnect for {}", device_id),
                }
                continue;
            }
        }

        let invalidated = streams.invalidate_device(&device_id);
        if connections.mark_link_lost(&device_id) {
            tracing::warn!(
                "Link to {} lost, {} subscriptions invalidated",
                device_id,
                invalidated
            );
        }
    }
}
