//! Per-profile service attachments.
//!
//! After discovery each matching registered profile gets one service
//! attachment on the device. Attachments are ordered by profile priority
//! and carry their own connect lifecycle; the controller walks them to
//! drive the pending-connect queue.

use std::collections::HashSet;
use std::sync::Arc;
use strum::Display;
use uuid::Uuid;

use crate::{event::GattPrimary, profile::Profile};

/// Connection state of a service attachment.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Display)]
pub enum ServiceState {
    /// Not connected.
    #[default]
    #[strum(serialize = "disconnected")]
    Disconnected,
    /// Connect in progress.
    #[strum(serialize = "connecting")]
    Connecting,
    /// Connected.
    #[strum(serialize = "connected")]
    Connected,
    /// Disconnect in progress.
    #[strum(serialize = "disconnecting")]
    Disconnecting,
}

/// One profile's service attachment on a device.
#[derive(Clone, Debug)]
pub struct Service {
    /// The profile driving this service.
    pub profile: Arc<Profile>,
    /// Connection state.
    pub state: ServiceState,
    /// The service may be connected automatically: the profile wants
    /// auto-connect and the adapter's UUID allow-list permits it.
    pub allowed: bool,
    /// Attribute range claimed by the service, for GATT services handled
    /// by an internal profile.
    pub att_range: Option<(u16, u16)>,
}

impl Service {
    /// The remote UUID of the service.
    pub fn uuid(&self) -> Uuid {
        self.profile.uuid
    }
}

/// Ordered set of service attachments of one device.
#[derive(Clone, Debug, Default)]
pub struct ServiceSet {
    services: Vec<Service>,
}

impl ServiceSet {
    /// Rebuilds the set from the profiles matching the device's UUIDs.
    ///
    /// `matched` must already be in descending priority order. States of
    /// attachments that survive the rebuild are preserved. The allowed
    /// flag of every service is recomputed from the profile's
    /// auto-connect intent and the adapter's UUID allow-list.
    pub fn rebuild(
        &mut self, matched: Vec<Arc<Profile>>, allow_list: Option<&HashSet<Uuid>>,
        primaries: &[GattPrimary],
    ) {
        let mut services = Vec::with_capacity(matched.len());
        for profile in matched {
            let allowed = profile.auto_connect
                && allow_list.map_or(true, |list| list.contains(&profile.uuid));
            let att_range = if profile.external {
                None
            } else {
                primaries.iter().find(|p| p.uuid == profile.uuid).map(|p| (p.start, p.end))
            };
            let state = self
                .services
                .iter()
                .find(|s| s.uuid() == profile.uuid)
                .map(|s| s.state)
                .unwrap_or_default();
            services.push(Service { profile, state, allowed, att_range });
        }
        self.services = services;
    }

    /// Drops all attachments.
    pub fn clear(&mut self) {
        self.services.clear();
    }

    /// Number of attachments.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// The set has no attachments.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Attachment for the given UUID.
    pub fn get(&self, uuid: &Uuid) -> Option<&Service> {
        self.services.iter().find(|s| s.uuid() == *uuid)
    }

    /// Mutable attachment for the given UUID.
    pub fn get_mut(&mut self, uuid: &Uuid) -> Option<&mut Service> {
        self.services.iter_mut().find(|s| s.uuid() == *uuid)
    }

    /// Iterates over the attachments in priority order.
    pub fn iter(&self) -> impl Iterator<Item = &Service> {
        self.services.iter()
    }

    /// Iterates mutably over the attachments in priority order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Service> {
        self.services.iter_mut()
    }

    /// At least one service is connected.
    pub fn any_connected(&self) -> bool {
        self.services.iter().any(|s| s.state == ServiceState::Connected)
    }

    /// A service is connected or on its way there.
    pub fn busy(&self) -> bool {
        self.services
            .iter()
            .any(|s| matches!(s.state, ServiceState::Connecting | ServiceState::Connected))
    }

    /// UUIDs of auto-connect-eligible services not yet connected, in
    /// priority order.
    pub fn connectable_uuids(&self) -> Vec<Uuid> {
        self.services
            .iter()
            .filter(|s| s.allowed && s.state == ServiceState::Disconnected)
            .map(|s| s.uuid())
            .collect()
    }

    /// Updates the state of a service. Returns `true` if it changed.
    pub fn set_state(&mut self, uuid: &Uuid, state: ServiceState) -> bool {
        match self.get_mut(uuid) {
            Some(service) if service.state != state => {
                service.state = state;
                true
            }
            _ => false,
        }
    }

    /// An internal profile claims the given attribute handle.
    pub fn claims(&self, handle: u16) -> bool {
        self.services.iter().any(|s| {
            s.att_range.map_or(false, |(start, end)| (start..=end).contains(&handle))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{profile::ProfileDriver, uuid_ext::ids, Address, Result};

    struct NullDriver;

    impl ProfileDriver for NullDriver {
        fn connect(&self, _address: Address, _uuid: Uuid) -> Result<()> {
            Ok(())
        }

        fn disconnect(&self, _address: Address, _uuid: Uuid) -> Result<()> {
            Ok(())
        }
    }

    fn profile(uuid: Uuid, priority: u16, auto_connect: bool, external: bool) -> Arc<Profile> {
        Arc::new(Profile {
            uuid,
            name: format!("profile-{priority}"),
            priority,
            auto_connect,
            external,
            driver: Arc::new(NullDriver),
        })
    }

    #[test]
    fn allowed_is_intersection_of_intent_and_allow_list() {
        let mut set = ServiceSet::default();
        let mut allow = HashSet::new();
        allow.insert(ids::AUDIO_SINK);

        set.rebuild(
            vec![
                profile(ids::AUDIO_SINK, 20, true, false),
                profile(ids::AV_REMOTE_CONTROL, 10, true, false),
                profile(ids::HID, 5, false, false),
            ],
            Some(&allow),
            &[],
        );

        assert!(set.get(&ids::AUDIO_SINK).unwrap().allowed);
        assert!(!set.get(&ids::AV_REMOTE_CONTROL).unwrap().allowed);
        assert!(!set.get(&ids::HID).unwrap().allowed);
        assert_eq!(set.connectable_uuids(), vec![ids::AUDIO_SINK]);
    }

    #[test]
    fn rebuild_preserves_surviving_states() {
        let mut set = ServiceSet::default();
        set.rebuild(vec![profile(ids::AUDIO_SINK, 20, true, false)], None, &[]);
        assert!(set.set_state(&ids::AUDIO_SINK, ServiceState::Connected));

        set.rebuild(
            vec![
                profile(ids::AUDIO_SINK, 20, true, false),
                profile(ids::AV_REMOTE_CONTROL, 10, true, false),
            ],
            None,
            &[],
        );
        assert_eq!(set.get(&ids::AUDIO_SINK).unwrap().state, ServiceState::Connected);
        assert_eq!(set.get(&ids::AV_REMOTE_CONTROL).unwrap().state, ServiceState::Disconnected);
        assert!(set.any_connected());
    }

    #[test]
    fn internal_profile_claims_attribute_range() {
        let mut set = ServiceSet::default();
        let primaries = [GattPrimary { uuid: ids::BATTERY, start: 0x10, end: 0x1f }];
        set.rebuild(vec![profile(ids::BATTERY, 10, true, false)], None, &primaries);
        assert!(set.claims(0x15));
        assert!(!set.claims(0x20));

        set.rebuild(vec![profile(ids::BATTERY, 10, true, true)], None, &primaries);
        assert!(!set.claims(0x15));
    }
}
