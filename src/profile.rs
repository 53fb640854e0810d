//! Profile capability table.
//!
//! Profiles (A2DP, HID, HOG, ...) live outside this crate; what the
//! device engine needs is a table of what is registered: which remote
//! UUID each profile drives, its connect priority, whether it wants to
//! auto-connect, and a driver handle to start and stop the per-device
//! service attachment. The table is consulted by devices but never owned
//! by them.

use std::{fmt, sync::Arc};
use uuid::Uuid;

use crate::{Address, Result};

/// Driver side of a profile.
///
/// Called by the engine to connect or disconnect the profile's service on
/// a device. Completion is reported back as a
/// [ProfileConnected](crate::event::DeviceEvent::ProfileConnected) or
/// [ProfileDisconnected](crate::event::DeviceEvent::ProfileDisconnected)
/// event.
pub trait ProfileDriver: Send + Sync {
    /// Starts connecting the profile's service on the device.
    fn connect(&self, address: Address, uuid: Uuid) -> Result<()>;

    /// Starts disconnecting the profile's service on the device.
    fn disconnect(&self, address: Address, uuid: Uuid) -> Result<()>;
}

/// A registered profile.
pub struct Profile {
    /// Remote service UUID the profile drives.
    pub uuid: Uuid,
    /// Short profile name for logging.
    pub name: String,
    /// Connect priority; higher connects first.
    pub priority: u16,
    /// The profile wants its service connected automatically.
    pub auto_connect: bool,
    /// The profile is implemented outside the daemon.
    ///
    /// Internal profiles claim the attribute range of their GATT service,
    /// suppressing external handlers for those handles.
    pub external: bool,
    /// Driver used to connect and disconnect the service.
    pub driver: Arc<dyn ProfileDriver>,
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Profile")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("auto_connect", &self.auto_connect)
            .field("external", &self.external)
            .finish()
    }
}

/// Table of registered profiles.
#[derive(Clone, Default)]
pub struct ProfileRegistry {
    profiles: Vec<Arc<Profile>>,
}

impl fmt::Debug for ProfileRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.profiles.iter().map(|p| &p.name)).finish()
    }
}

impl ProfileRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a profile.
    ///
    /// A profile registered for an already claimed UUID replaces the
    /// previous registration.
    pub fn register(&mut self, profile: Profile) {
        self.profiles.retain(|p| p.uuid != profile.uuid);
        self.profiles.push(Arc::new(profile));
        self.profiles.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Looks up the profile registered for a UUID.
    pub fn lookup(&self, uuid: &Uuid) -> Option<Arc<Profile>> {
        self.profiles.iter().find(|p| p.uuid == *uuid).cloned()
    }

    /// Profiles matching any of the given UUIDs, in descending priority
    /// order.
    pub fn probe<'a>(&self, uuids: impl IntoIterator<Item = &'a Uuid>) -> Vec<Arc<Profile>> {
        let mut matched: Vec<Arc<Profile>> = Vec::new();
        for uuid in uuids {
            if let Some(profile) = self.lookup(uuid) {
                if !matched.iter().any(|p| p.uuid == profile.uuid) {
                    matched.push(profile);
                }
            }
        }
        matched.sort_by(|a, b| b.priority.cmp(&a.priority));
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uuid_ext::ids;

    struct NullDriver;

    impl ProfileDriver for NullDriver {
        fn connect(&self, _address: Address, _uuid: Uuid) -> Result<()> {
            Ok(())
        }

        fn disconnect(&self, _address: Address, _uuid: Uuid) -> Result<()> {
            Ok(())
        }
    }

    fn profile(uuid: Uuid, name: &str, priority: u16) -> Profile {
        Profile {
            uuid,
            name: name.to_string(),
            priority,
            auto_connect: true,
            external: false,
            driver: Arc::new(NullDriver),
        }
    }

    #[test]
    fn probe_orders_by_priority() {
        let mut registry = ProfileRegistry::new();
        registry.register(profile(ids::AUDIO_SINK, "a2dp-sink", 10));
        registry.register(profile(ids::AV_REMOTE_CONTROL, "avrcp", 20));

        let uuids = [ids::AUDIO_SINK, ids::AV_REMOTE_CONTROL, ids::BATTERY];
        let matched = registry.probe(uuids.iter());
        let names: Vec<_> = matched.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["avrcp", "a2dp-sink"]);
    }

    #[test]
    fn register_replaces_same_uuid() {
        let mut registry = ProfileRegistry::new();
        registry.register(profile(ids::AUDIO_SINK, "old", 1));
        registry.register(profile(ids::AUDIO_SINK, "new", 2));
        assert_eq!(registry.lookup(&ids::AUDIO_SINK).unwrap().name, "new");
        assert_eq!(registry.probe([ids::AUDIO_SINK].iter()).len(), 1);
    }
}
