//! Connection management
//!
//! Owns one [`Session`] per device. At most one session exists per device
//! id at any time; callers only ever receive clones of it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::broadcast;

use wearlink_core::error::ConnectError;
use wearlink_core::protocol::{decode_battery, BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID};
use wearlink_core::types::{
    now_us, ChannelRef, ConnectionState, DeviceId, Session, VendorProfile,
};

use super::discovery::DeviceRegistry;
use super::transport::{BleTransport, PeripheralLink, TransportEvent};

/// Live session plus the link backing it.
struct SessionEntry {
    /// Connect call that created this entry
    attempt: u64,
    session: Session,
    link: Option<Arc<dyn PeripheralLink>>,
    vendor: VendorProfile,
    connected_at: Option<Instant>,
}

/// Session table over a [`BleTransport`].
///
/// Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct ConnectionManager {
    transport: Arc<dyn BleTransport>,
    registry: DeviceRegistry,
    sessions: Arc<RwLock<HashMap<DeviceId, SessionEntry>>>,
    next_attempt: Arc<AtomicU64>,
    connect_timeout: Duration,
}

impl ConnectionManager {
    /// Create a manager.
    pub fn new(
        transport: Arc<dyn BleTransport>,
        registry: DeviceRegistry,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            registry,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_attempt: Arc::new(AtomicU64::new(1)),
            connect_timeout,
        }
    }

    /// Establish a session and discover services.
    ///
    /// Connecting an already connected device returns its existing session.
    /// Dropping the returned future before it completes abandons the attempt
    /// and leaves no session behind.
    ///
    /// # Errors
    ///
    /// - [`ConnectError::DeviceNotFound`]: id never discovered (immediate)
    /// - [`ConnectError::InProgress`]: another connect for this id is running
    /// - [`ConnectError::Timeout`]: negotiation exceeded the timeout
    /// - [`ConnectError::LinkLost`]: link dropped during negotiation
    pub async fn connect(&self, device_id: &DeviceId) -> Result<Session, ConnectError> {
        let descriptor = self
            .registry
            .get(device_id)
            .ok_or_else(|| ConnectError::DeviceNotFound(device_id.to_string()))?;

        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        {
            let mut sessions = self.sessions.write();
            if let Some(entry) = sessions.get(device_id) {
                match entry.session.connection_state {
                    ConnectionState::Connected => return Ok(entry.session.clone()),
                    ConnectionState::Connecting => {
                        return Err(ConnectError::InProgress(device_id.to_string()))
                    }
                    ConnectionState::Disconnected => {}
                }
            }
            sessions.insert(
                device_id.clone(),
                SessionEntry {
                    attempt,
                    session: Session::connecting(device_id.clone()),
                    link: None,
                    vendor: descriptor.vendor_profile,
                    connected_at: None,
                },
            );
        }

        let _pending = PendingAttempt {
            sessions: &self.sessions,
            device_id,
            attempt,
        };

        tracing::info!("Connecting to {} ({})", descriptor.label(), device_id);

        // Subscribe before negotiating so a drop mid-handshake is not missed
        let mut events = self.transport.events();
        let negotiation = async {
            let link = self.transport.connect(device_id).await?;
            let cache = link
                .discover_services()
                .await
                .map_err(|e| ConnectError::Transport(e.to_string()))?;
            Ok::<_, ConnectError>((link, cache))
        };

        let outcome = tokio::time::timeout(self.connect_timeout, async {
            tokio::select! {
                result = negotiation => result,
                () = wait_for_disconnect(&mut events, device_id) => Err(ConnectError::LinkLost),
            }
        })
        .await
        .unwrap_or_else(|_| {
            Err(ConnectError::Timeout(
                u64::try_from(self.connect_timeout.as_millis()).unwrap_or(u64::MAX),
            ))
        });

        let (link, cache) = match outcome {
            Ok(negotiated) => negotiated,
            Err(e) => {
                match &e {
                    ConnectError::Transport(_) => {
                        tracing::error!("Connection to {} failed: {}", device_id, e);
                    }
                    _ => tracing::warn!("Connection to {} failed: {}", device_id, e),
                }
                return Err(e);
            }
        };

        let promoted = {
            let mut sessions = self.sessions.write();
            match sessions.get_mut(device_id) {
                Some(entry)
                    if entry.attempt == attempt
                        && entry.session.connection_state == ConnectionState::Connecting =>
                {
                    entry.session.connection_state = ConnectionState::Connected;
                    entry.session.service_cache = cache;
                    entry.link = Some(Arc::clone(&link));
                    entry.connected_at = Some(Instant::now());
                    Ok(entry.session.clone())
                }
                // A newer connect owns the device now; its link is the same peripheral
                Some(_) => Err(false),
                // Disconnected while negotiating
                None => Err(true),
            }
        };

        let session = match promoted {
            Ok(session) => session,
            Err(orphaned) => {
                tracing::warn!("Connection to {} superseded during negotiation", device_id);
                if orphaned {
                    let _ = link.disconnect().await;
                }
                return Err(ConnectError::LinkLost);
            }
        };

        tracing::info!(
            "Connected to {} with {} services",
            device_id,
            session.service_cache.len()
        );
        self.report_battery(&session, link.as_ref()).await;

        Ok(session)
    }

    /// Read the battery level once and log it.
    async fn report_battery(&self, session: &Session, link: &dyn PeripheralLink) {
        if !session
            .service_cache
            .contains(BATTERY_SERVICE_UUID, BATTERY_LEVEL_UUID)
        {
            return;
        }

        let channel = ChannelRef::new(BATTERY_SERVICE_UUID, BATTERY_LEVEL_UUID);
        match link.read(channel).await {
            Ok(bytes) => match decode_battery(&bytes, now_us()) {
                Ok(sample) => tracing::info!(
                    "{} battery level: {}%",
                    session.device_id,
                    sample.percent
                ),
                Err(e) => tracing::warn!("{}: {}", session.device_id, e),
            },
            Err(e) => tracing::warn!("{}: battery read failed: {}", session.device_id, e),
        }
    }

    /// Tear down a session. Idempotent.
    pub async fn disconnect(&self, device_id: &DeviceId) {
        let entry = self.sessions.write().remove(device_id);
        let Some(entry) = entry else {
            return;
        };

        if let Some(link) = entry.link {
            if let Err(e) = link.disconnect().await {
                tracing::warn!("Error closing link to {}: {}", device_id, e);
            }
        }
        match entry.connected_at {
            Some(at) => tracing::info!(
                "Disconnected from {} after {:.1}s",
                device_id,
                at.elapsed().as_secs_f64()
            ),
            None => tracing::info!("Disconnected from {}", device_id),
        }
    }

    /// Drop a connected session whose link is already gone.
    ///
    /// Returns false when there was no connected session. Sessions still
    /// negotiating are left to [`ConnectionManager::connect`].
    pub fn mark_link_lost(&self, device_id: &DeviceId) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(device_id) {
            Some(entry) if entry.session.is_connected() => {
                sessions.remove(device_id);
                true
            }
            _ => false,
        }
    }

    /// Whether the device has a connected session.
    pub fn is_connected(&self, device_id: &DeviceId) -> bool {
        self.sessions
            .read()
            .get(device_id)
            .is_some_and(|e| e.session.is_connected())
    }

    /// Snapshot of the device's session.
    pub fn session(&self, device_id: &DeviceId) -> Option<Session> {
        self.sessions.read().get(device_id).map(|e| e.session.clone())
    }

    /// Vendor of a device with a session.
    pub fn vendor(&self, device_id: &DeviceId) -> Option<VendorProfile> {
        self.sessions.read().get(device_id).map(|e| e.vendor)
    }

    /// Link of a connected device.
    pub fn link(&self, device_id: &DeviceId) -> Option<Arc<dyn PeripheralLink>> {
        self.sessions
            .read()
            .get(device_id)
            .and_then(|e| e.link.clone())
    }

    /// Ids of all connected devices.
    pub fn connected_devices(&self) -> Vec<DeviceId> {
        self.sessions
            .read()
            .iter()
            .filter(|(_, e)| e.session.is_connected())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Removes a `Connecting` entry when its connect call fails or is dropped.
struct PendingAttempt<'a> {
    sessions: &'a RwLock<HashMap<DeviceId, SessionEntry>>,
    device_id: &'a DeviceId,
    attempt: u64,
}

impl Drop for PendingAttempt<'_> {
    fn drop(&mut self) {
        let mut sessions = self.sessions.write();
        let abandoned = sessions.get(self.device_id).is_some_and(|entry| {
            entry.attempt == self.attempt
                && entry.session.connection_state == ConnectionState::Connecting
        });
        if abandoned {
            sessions.remove(self.device_id);
        }
    }
}

/// Resolve once the transport reports this device disconnected.
async fn wait_for_disconnect(events: &mut broadcast::Receiver<TransportEvent>, id: &DeviceId) {
    loop {
        match events.recv().await {
            Ok(TransportEvent::Disconnected(dev)) if &dev == id => return,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::discovery::Discovery;
    use crate::bridge::mock::{MockPeripheral, MockTransport};

    async fn connected_setup(timeout: Duration) -> (MockTransport, ConnectionManager) {
        let transport = MockTransport::with_peripherals([
            MockPeripheral::galaxy_watch("gw", "Galaxy Watch 5"),
            MockPeripheral::heart_rate_strap("h10", "Polar H10"),
        ]);
        let registry = DeviceRegistry::new();
        let shared: Arc<dyn BleTransport> = Arc::new(transport.clone());
        Discovery::new(Arc::clone(&shared), registry.clone(), Duration::from_millis(10))
            .scan(None)
            .await
            .unwrap();
        (transport, ConnectionManager::new(shared, registry, timeout))
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_discovers_services() {
        let (_, manager) = connected_setup(Duration::from_secs(10)).await;
        let id = DeviceId::from("gw");

        let session = manager.connect(&id).await.unwrap();
        assert!(session.is_connected());
        assert!(session.service_cache.len() >= 3);
        assert_eq!(manager.vendor(&id), Some(VendorProfile::Samsung));
        assert_eq!(manager.connected_devices(), vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent() {
        let (_, manager) = connected_setup(Duration::from_secs(10)).await;
        let id = DeviceId::from("h10");
        let first = manager.connect(&id).await.unwrap();
        let second = manager.connect(&id).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_unknown_device_fails_immediately() {
        let (_, manager) = connected_setup(Duration::from_secs(10)).await;
        let err = manager.connect(&DeviceId::from("nope")).await.unwrap_err();
        assert_eq!(err, ConnectError::DeviceNotFound("nope".into()));
        assert!(manager.session(&DeviceId::from("nope")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_leaves_no_session() {
        let (transport, manager) = connected_setup(Duration::from_secs(2)).await;
        transport.set_connect_delay(Duration::from_secs(30));
        let id = DeviceId::from("h10");

        assert_eq!(manager.connect(&id).await, Err(ConnectError::Timeout(2_000)));
        assert!(manager.session(&id).is_none());
        assert!(!manager.is_connected(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connect_is_rejected() {
        let (transport, manager) = connected_setup(Duration::from_secs(10)).await;
        transport.set_connect_delay(Duration::from_secs(1));
        let id = DeviceId::from("h10");

        let background = {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move { manager.connect(&id).await })
        };
        tokio::task::yield_now().await;

        assert_eq!(
            manager.connect(&id).await,
            Err(ConnectError::InProgress("h10".into()))
        );
        assert!(background.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_connect_can_be_retried() {
        let (transport, manager) = connected_setup(Duration::from_secs(10)).await;
        transport.set_connect_delay(Duration::from_secs(3));
        let id = DeviceId::from("h10");

        let cancelled = tokio::time::timeout(Duration::from_secs(1), manager.connect(&id)).await;
        assert!(cancelled.is_err());
        assert!(manager.session(&id).is_none());

        transport.set_connect_delay(Duration::ZERO);
        assert!(manager.connect(&id).await.unwrap().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_drop_during_connect_reports_link_lost() {
        let (transport, manager) = connected_setup(Duration::from_secs(10)).await;
        transport.set_connect_delay(Duration::from_secs(2));
        let id = DeviceId::from("h10");

        let pending = {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move { manager.connect(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        transport.drop_link(&id);

        assert_eq!(pending.await.unwrap(), Err(ConnectError::LinkLost));
        assert!(manager.session(&id).is_none());
        assert!(!manager.is_connected(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_attempt_leaves_newer_session_alone() {
        let (transport, manager) = connected_setup(Duration::from_secs(10)).await;
        transport.set_connect_delay(Duration::from_secs(2));
        let id = DeviceId::from("h10");

        let stale = {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move { manager.connect(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;

        // Abandon the first attempt and start over while it is still negotiating
        manager.disconnect(&id).await;
        transport.set_connect_delay(Duration::ZERO);
        let fresh = manager.connect(&id).await.unwrap();

        assert_eq!(stale.await.unwrap(), Err(ConnectError::LinkLost));
        assert_eq!(manager.session(&id), Some(fresh));
        assert!(manager.is_connected(&id));
        assert!(transport.is_link_up(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent() {
        let (transport, manager) = connected_setup(Duration::from_secs(10)).await;
        let id = DeviceId::from("h10");
        manager.connect(&id).await.unwrap();

        manager.disconnect(&id).await;
        manager.disconnect(&id).await;

        assert!(!manager.is_connected(&id));
        assert!(!transport.is_link_up(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_link_lost() {
        let (_, manager) = connected_setup(Duration::from_secs(10)).await;
        let id = DeviceId::from("h10");
        manager.connect(&id).await.unwrap();

        assert!(manager.mark_link_lost(&id));
        assert!(!manager.mark_link_lost(&id));
        assert!(manager.session(&id).is_none());
    }
}
