//! GATT Characteristic Resolver
//!
//! Turns a connected peripheral's service table into a [`DeviceLinkHandle`].
//! A handle is only ever produced with both characteristics resolved.

use crate::domain::models::DeviceRef;
use crate::error::ResolveError;
use crate::infrastructure::bluetooth::protocol::ProfileKind;
use crate::infrastructure::bluetooth::transport::{BleTransport, GattCharacteristic, GattService};
use tracing::{debug, info};
use uuid::Uuid;

/// Everything the link needs to talk to one connected pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLinkHandle {
    pub device: DeviceRef,
    pub service_id: Uuid,
    pub command: GattCharacteristic,
    pub notify: GattCharacteristic,
    pub profile: ProfileKind,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CharacteristicResolver;

impl CharacteristicResolver {
    pub fn new() -> Self {
        Self
    }

    /// Discover services on a connected device and resolve its profile.
    /// No retries: the caller decides whether to rerun the connect sequence.
    pub async fn resolve(
        &self,
        transport: &dyn BleTransport,
        device: &DeviceRef,
    ) -> Result<DeviceLinkHandle, ResolveError> {
        let services = self.discover_services(transport, device).await?;
        let (profile, service) = self.select_service(&services)?;
        self.resolve_characteristics(device, profile, service)
    }

    pub async fn discover_services(
        &self,
        transport: &dyn BleTransport,
        device: &DeviceRef,
    ) -> Result<Vec<GattService>, ResolveError> {
        let services = transport.services(device).await?;
        info!("Found {} GATT services on {}", services.len(), device.name);
        Ok(services)
    }

    /// Pick the preferred profile service present in `services`.
    pub fn select_service<'a>(
        &self,
        services: &'a [GattService],
    ) -> Result<(ProfileKind, &'a GattService), ResolveError> {
        for profile in ProfileKind::PREFERENCE {
            if let Some(service) = services.iter().find(|s| s.uuid == profile.service_uuid()) {
                info!("Found {:?} service {}", profile, service.uuid);
                return Ok((profile, service));
            }
        }
        Err(ResolveError::ServiceNotFound)
    }

    /// Require a write-capable command and a notify-capable data
    /// characteristic inside the chosen service.
    pub fn resolve_characteristics(
        &self,
        device: &DeviceRef,
        profile: ProfileKind,
        service: &GattService,
    ) -> Result<DeviceLinkHandle, ResolveError> {
        debug!(
            "{:?} service exposes {} characteristics",
            profile,
            service.characteristics.len()
        );

        let command = service
            .characteristics
            .iter()
            .find(|c| c.uuid == profile.command_uuid() && c.properties.can_write())
            .cloned()
            .ok_or(ResolveError::CharacteristicNotFound {
                profile,
                role: "command",
                uuid: profile.command_uuid(),
            })?;

        let notify = service
            .characteristics
            .iter()
            .find(|c| c.uuid == profile.notify_uuid() && c.properties.can_notify())
            .cloned()
            .ok_or(ResolveError::CharacteristicNotFound {
                profile,
                role: "notify",
                uuid: profile.notify_uuid(),
            })?;

        Ok(DeviceLinkHandle {
            device: device.clone(),
            service_id: service.uuid,
            command,
            notify,
            profile,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::testing::{
        characteristic, notifiable, pod, profile_service, writable, FakeTransport,
    };

    #[test]
    fn watch_wins_when_both_profiles_are_present() {
        let services = vec![
            profile_service(ProfileKind::MetaWear),
            profile_service(ProfileKind::Watch),
        ];
        let (profile, _) = CharacteristicResolver::new().select_service(&services).unwrap();
        assert_eq!(profile, ProfileKind::Watch);
    }

    #[test]
    fn falls_back_to_metawear() {
        let services = vec![profile_service(ProfileKind::MetaWear)];
        let resolver = CharacteristicResolver::new();
        let (profile, service) = resolver.select_service(&services).unwrap();
        let handle = resolver
            .resolve_characteristics(&pod("a"), profile, service)
            .unwrap();
        assert_eq!(handle.profile, ProfileKind::MetaWear);
        assert_eq!(handle.command.uuid, ProfileKind::MetaWear.command_uuid());
        assert_eq!(handle.notify.uuid, ProfileKind::MetaWear.notify_uuid());
    }

    #[test]
    fn unknown_services_are_rejected() {
        let services = vec![GattService {
            uuid: Uuid::from_u128(0x180d),
            characteristics: vec![],
        }];
        let err = CharacteristicResolver::new()
            .select_service(&services)
            .unwrap_err();
        assert!(matches!(err, ResolveError::ServiceNotFound));
        assert!(!err.is_retryable());
    }

    #[test]
    fn notify_uuid_without_notify_property_is_not_accepted() {
        let profile = ProfileKind::Watch;
        let service_uuid = profile.service_uuid();
        let service = GattService {
            uuid: service_uuid,
            characteristics: vec![
                characteristic(service_uuid, profile.command_uuid(), writable()),
                characteristic(service_uuid, profile.notify_uuid(), writable()),
            ],
        };
        let err = CharacteristicResolver::new()
            .resolve_characteristics(&pod("a"), profile, &service)
            .unwrap_err();
        assert!(matches!(
            err,
            ResolveError::CharacteristicNotFound { role: "notify", .. }
        ));
    }

    #[test]
    fn missing_command_characteristic_is_rejected() {
        let profile = ProfileKind::MetaWear;
        let service_uuid = profile.service_uuid();
        let service = GattService {
            uuid: service_uuid,
            characteristics: vec![characteristic(
                service_uuid,
                profile.notify_uuid(),
                notifiable(),
            )],
        };
        let err = CharacteristicResolver::new()
            .resolve_characteristics(&pod("a"), profile, &service)
            .unwrap_err();
        assert!(matches!(
            err,
            ResolveError::CharacteristicNotFound { role: "command", .. }
        ));
    }

    #[tokio::test]
    async fn resolve_runs_discovery_through_the_transport() {
        let transport = FakeTransport::with_profile(ProfileKind::Watch);
        let handle = CharacteristicResolver::new()
            .resolve(&transport, &pod("a"))
            .await
            .unwrap();
        assert_eq!(handle.service_id, ProfileKind::Watch.service_uuid());
        assert_eq!(transport.calls(), vec!["services".to_string()]);
    }
}
