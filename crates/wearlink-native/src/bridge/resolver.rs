//! Channel resolution
//!
//! Decides which characteristic carries a metric for a connected device:
//! the vendor table says where it should be, the session's service cache
//! says whether the device actually exposes it.

use std::sync::Arc;

use wearlink_core::channel_map::VendorChannelMap;
use wearlink_core::error::ChannelError;
use wearlink_core::types::{ChannelRef, Metric, Session, VendorProfile};

/// Resolver over a shared vendor table.
#[derive(Clone, Debug)]
pub struct ChannelResolver {
    map: Arc<VendorChannelMap>,
}

impl ChannelResolver {
    /// Create a resolver.
    pub fn new(map: Arc<VendorChannelMap>) -> Self {
        Self { map }
    }

    /// The vendor table in use.
    pub fn map(&self) -> &VendorChannelMap {
        &self.map
    }

    /// Resolve `metric` for a session.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Unsupported`] when the table has no entry,
    /// [`ChannelError::NotAdvertised`] when the device lacks the
    /// characteristic the table names.
    pub fn resolve(
        &self,
        session: &Session,
        vendor: VendorProfile,
        metric: Metric,
    ) -> Result<ChannelRef, ChannelError> {
        let channel = self
            .map
            .lookup(vendor, metric)
            .ok_or(ChannelError::Unsupported { vendor, metric })?;

        if session
            .service_cache
            .contains(channel.service, channel.characteristic)
        {
            Ok(channel)
        } else {
            Err(ChannelError::NotAdvertised { vendor, metric })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wearlink_core::protocol::{
        HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID, SAMSUNG_HEALTH_SERVICE_UUID,
        SAMSUNG_PPG_UUID,
    };
    use wearlink_core::types::{ConnectionState, DeviceId, ServiceCache};

    fn session(cache: ServiceCache) -> Session {
        Session {
            device_id: DeviceId::from("dev"),
            connection_state: ConnectionState::Connected,
            service_cache: cache,
        }
    }

    fn resolver() -> ChannelResolver {
        ChannelResolver::new(Arc::new(VendorChannelMap::builtin()))
    }

    #[test]
    fn test_resolves_exposed_vendor_channel() {
        let s = session(
            [(SAMSUNG_HEALTH_SERVICE_UUID, SAMSUNG_PPG_UUID)]
                .into_iter()
                .collect(),
        );
        let channel = resolver()
            .resolve(&s, VendorProfile::Samsung, Metric::Ppg)
            .unwrap();
        assert_eq!(channel.characteristic, SAMSUNG_PPG_UUID);
    }

    #[test]
    fn test_missing_characteristic_not_advertised() {
        let s = session(
            [(HEART_RATE_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID)]
                .into_iter()
                .collect(),
        );
        assert_eq!(
            resolver().resolve(&s, VendorProfile::Samsung, Metric::Ppg),
            Err(ChannelError::NotAdvertised {
                vendor: VendorProfile::Samsung,
                metric: Metric::Ppg
            })
        );
    }

    #[test]
    fn test_generic_ecg_unsupported() {
        let s = session(ServiceCache::new());
        assert_eq!(
            resolver().resolve(&s, VendorProfile::Generic, Metric::Ecg),
            Err(ChannelError::Unsupported {
                vendor: VendorProfile::Generic,
                metric: Metric::Ecg
            })
        );
    }
}
