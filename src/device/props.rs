//! Observable properties of a device.
//!
//! Each observable is one entry in [PROPERTIES]: its name, a getter, an
//! optional setter and an existence test for conditional properties.
//! The table drives both the generic property access used by the
//! publication layer and [Device::all_properties].

use std::collections::HashMap;
use uuid::Uuid;

use super::{bearer::PreferredBearer, keys::DeviceSet, Device};
use crate::{Address, AddressType, Error, ErrorKind, Result};

/// Bluetooth device property with its value.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum DeviceProperty {
    /// Peer address.
    Address(Address),
    /// Peer address type.
    AddressType(AddressType),
    /// Remote name.
    Name(String),
    /// Friendly name, falling back to the remote name.
    Alias(String),
    /// Class of device.
    Class(u32),
    /// GAP appearance.
    Appearance(u16),
    /// Icon name derived from class or appearance.
    Icon(String),
    /// Keys were exchanged on at least one bearer.
    Paired(bool),
    /// Exchanged keys are persisted on at least one bearer.
    Bonded(bool),
    /// The device is trusted.
    Trusted(bool),
    /// Incoming connections are rejected.
    Blocked(bool),
    /// The device only supports pre-2.1 pairing.
    LegacyPairing(bool),
    /// The device was cable-paired.
    CablePairing(bool),
    /// Signal strength of the last report.
    Rssi(i16),
    /// At least one bearer is connected.
    Connected(bool),
    /// Known service UUIDs: resolved if discovery completed, otherwise
    /// the advertised ones.
    Uuids(Vec<Uuid>),
    /// Device ID in modalias format.
    Modalias(String),
    /// Name of the adapter the device belongs to.
    Adapter(String),
    /// Manufacturer specific advertising data.
    ManufacturerData(HashMap<u16, Vec<u8>>),
    /// Service advertising data.
    ServiceData(HashMap<Uuid, Vec<u8>>),
    /// Advertised transmit power.
    TxPower(i16),
    /// Discovery completed while connected.
    ServicesResolved(bool),
    /// Advertising data flags.
    AdvertisingFlags(Vec<u8>),
    /// Raw advertising data records.
    AdvertisingData(HashMap<u8, Vec<u8>>),
    /// The device may wake the host from suspend.
    WakeAllowed(bool),
    /// Coordinated-set memberships.
    Sets(Vec<DeviceSet>),
    /// Preferred bearer for connecting.
    PreferredBearer(PreferredBearer),
}

impl DeviceProperty {
    /// Name of the property.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Address(_) => "Address",
            Self::AddressType(_) => "AddressType",
            Self::Name(_) => "Name",
            Self::Alias(_) => "Alias",
            Self::Class(_) => "Class",
            Self::Appearance(_) => "Appearance",
            Self::Icon(_) => "Icon",
            Self::Paired(_) => "Paired",
            Self::Bonded(_) => "Bonded",
            Self::Trusted(_) => "Trusted",
            Self::Blocked(_) => "Blocked",
            Self::LegacyPairing(_) => "LegacyPairing",
            Self::CablePairing(_) => "CablePairing",
            Self::Rssi(_) => "RSSI",
            Self::Connected(_) => "Connected",
            Self::Uuids(_) => "UUIDs",
            Self::Modalias(_) => "Modalias",
            Self::Adapter(_) => "Adapter",
            Self::ManufacturerData(_) => "ManufacturerData",
            Self::ServiceData(_) => "ServiceData",
            Self::TxPower(_) => "TxPower",
            Self::ServicesResolved(_) => "ServicesResolved",
            Self::AdvertisingFlags(_) => "AdvertisingFlags",
            Self::AdvertisingData(_) => "AdvertisingData",
            Self::WakeAllowed(_) => "WakeAllowed",
            Self::Sets(_) => "Sets",
            Self::PreferredBearer(_) => "PreferredBearer",
        }
    }
}

/// One entry of the property dispatch table.
pub struct PropertyDef {
    /// Property name.
    pub name: &'static str,
    /// Reads the current value; `None` when the property does not exist.
    pub get: fn(&Device) -> Option<DeviceProperty>,
    /// Writes the property, if it is writable.
    pub set: Option<fn(&mut Device, DeviceProperty) -> Result<()>>,
    /// The property currently exists on the device.
    pub exists: fn(&Device) -> bool,
}

fn bad_value() -> Error {
    Error::new(ErrorKind::InvalidArguments)
}

/// Property dispatch table of a device.
pub const PROPERTIES: &[PropertyDef] = &[
    PropertyDef {
        name: "Address",
        get: |d| Some(DeviceProperty::Address(d.address())),
        set: None,
        exists: |_| true,
    },
    PropertyDef {
        name: "AddressType",
        get: |d| Some(DeviceProperty::AddressType(d.address_type())),
        set: None,
        exists: |_| true,
    },
    PropertyDef {
        name: "Name",
        get: |d| d.name().map(|n| DeviceProperty::Name(n.to_string())),
        set: None,
        exists: |d| d.name().is_some(),
    },
    PropertyDef {
        name: "Alias",
        get: |d| Some(DeviceProperty::Alias(d.alias())),
        set: Some(|d, v| match v {
            DeviceProperty::Alias(alias) => d.set_alias(&alias),
            _ => Err(bad_value()),
        }),
        exists: |_| true,
    },
    PropertyDef {
        name: "Class",
        get: |d| d.class().map(DeviceProperty::Class),
        set: None,
        exists: |d| d.class().is_some(),
    },
    PropertyDef {
        name: "Appearance",
        get: |d| d.appearance().map(DeviceProperty::Appearance),
        set: None,
        exists: |d| d.appearance().is_some(),
    },
    PropertyDef {
        name: "Icon",
        get: |d| d.icon().map(|i| DeviceProperty::Icon(i.to_string())),
        set: None,
        exists: |d| d.icon().is_some(),
    },
    PropertyDef {
        name: "Paired",
        get: |d| Some(DeviceProperty::Paired(d.is_paired())),
        set: None,
        exists: |_| true,
    },
    PropertyDef {
        name: "Bonded",
        get: |d| Some(DeviceProperty::Bonded(d.is_bonded())),
        set: None,
        exists: |_| true,
    },
    PropertyDef {
        name: "Trusted",
        get: |d| Some(DeviceProperty::Trusted(d.is_trusted())),
        set: Some(|d, v| match v {
            DeviceProperty::Trusted(trusted) => d.set_trusted(trusted),
            _ => Err(bad_value()),
        }),
        exists: |_| true,
    },
    PropertyDef {
        name: "Blocked",
        get: |d| Some(DeviceProperty::Blocked(d.is_blocked())),
        set: Some(|d, v| match v {
            DeviceProperty::Blocked(true) => d.block(),
            DeviceProperty::Blocked(false) => d.unblock(),
            _ => Err(bad_value()),
        }),
        exists: |_| true,
    },
    PropertyDef {
        name: "LegacyPairing",
        get: |d| Some(DeviceProperty::LegacyPairing(d.legacy_pairing())),
        set: None,
        exists: |_| true,
    },
    PropertyDef {
        name: "CablePairing",
        get: |d| Some(DeviceProperty::CablePairing(d.cable_pairing())),
        set: None,
        exists: |_| true,
    },
    PropertyDef {
        name: "RSSI",
        get: |d| d.rssi().map(DeviceProperty::Rssi),
        set: None,
        exists: |d| d.rssi().is_some(),
    },
    PropertyDef {
        name: "Connected",
        get: |d| Some(DeviceProperty::Connected(d.is_connected())),
        set: None,
        exists: |_| true,
    },
    PropertyDef {
        name: "UUIDs",
        get: |d| Some(DeviceProperty::Uuids(d.uuids_observable())),
        set: None,
        exists: |_| true,
    },
    PropertyDef {
        name: "Modalias",
        get: |d| d.modalias().map(|m| DeviceProperty::Modalias(m.to_string())),
        set: None,
        exists: |d| d.modalias().is_some(),
    },
    PropertyDef {
        name: "Adapter",
        get: |d| Some(DeviceProperty::Adapter(d.adapter_name().to_string())),
        set: None,
        exists: |_| true,
    },
    PropertyDef {
        name: "ManufacturerData",
        get: |d| Some(DeviceProperty::ManufacturerData(d.manufacturer_data().clone())),
        set: None,
        exists: |d| !d.manufacturer_data().is_empty(),
    },
    PropertyDef {
        name: "ServiceData",
        get: |d| Some(DeviceProperty::ServiceData(d.service_data().clone())),
        set: None,
        exists: |d| !d.service_data().is_empty(),
    },
    PropertyDef {
        name: "TxPower",
        get: |d| d.tx_power().map(DeviceProperty::TxPower),
        set: None,
        exists: |d| d.tx_power().is_some(),
    },
    PropertyDef {
        name: "ServicesResolved",
        get: |d| Some(DeviceProperty::ServicesResolved(d.services_resolved())),
        set: None,
        exists: |_| true,
    },
    PropertyDef {
        name: "AdvertisingFlags",
        get: |d| Some(DeviceProperty::AdvertisingFlags(d.advertising_flags().to_vec())),
        set: None,
        exists: |_| true,
    },
    PropertyDef {
        name: "AdvertisingData",
        get: |d| Some(DeviceProperty::AdvertisingData(d.advertising_data().clone())),
        set: None,
        exists: |d| !d.advertising_data().is_empty(),
    },
    PropertyDef {
        name: "WakeAllowed",
        get: |d| {
            if d.wake_supported() {
                Some(DeviceProperty::WakeAllowed(d.wake_allowed()))
            } else {
                None
            }
        },
        set: Some(|d, v| match v {
            DeviceProperty::WakeAllowed(allowed) => d.set_wake_allowed(allowed),
            _ => Err(bad_value()),
        }),
        exists: |d| d.wake_supported(),
    },
    PropertyDef {
        name: "Sets",
        get: |d| Some(DeviceProperty::Sets(d.sets())),
        set: None,
        exists: |d| !d.sets().is_empty(),
    },
    PropertyDef {
        name: "PreferredBearer",
        get: |d| {
            if d.is_dual_mode() {
                Some(DeviceProperty::PreferredBearer(d.preferred_bearer()))
            } else {
                None
            }
        },
        set: Some(|d, v| match v {
            DeviceProperty::PreferredBearer(bearer) => d.set_preferred_bearer(bearer),
            _ => Err(bad_value()),
        }),
        exists: |d| d.is_dual_mode(),
    },
];

impl Device {
    /// Looks up a property dispatch entry by name.
    pub fn property_def(name: &str) -> Option<&'static PropertyDef> {
        PROPERTIES.iter().find(|p| p.name == name)
    }

    /// Reads one property by name.
    pub fn property(&self, name: &str) -> Option<DeviceProperty> {
        Self::property_def(name).and_then(|def| (def.get)(self))
    }

    /// Writes one writable property.
    pub fn set_property(&mut self, value: DeviceProperty) -> Result<()> {
        let def = Self::property_def(value.name())
            .ok_or_else(|| Error::new(ErrorKind::InvalidArguments))?;
        match def.set {
            Some(set) => set(self, value),
            None => Err(Error::new(ErrorKind::NotSupported)),
        }
    }

    /// Returns all currently existing properties.
    pub fn all_properties(&self) -> Vec<DeviceProperty> {
        PROPERTIES.iter().filter_map(|def| (def.get)(self)).collect()
    }
}

/// Icon name for a BR/EDR class of device.
pub(crate) fn class_to_icon(class: u32) -> Option<&'static str> {
    let major = (class >> 8) & 0x1f;
    let minor = (class >> 2) & 0x3f;
    match major {
        0x01 => Some("computer"),
        0x02 => Some("phone"),
        0x03 => Some("network-wireless"),
        0x04 => Some(match minor {
            0x01 | 0x02 => "audio-headset",
            0x06 => "audio-headphones",
            0x0b | 0x0c | 0x0d => "camera-video",
            _ => "audio-card",
        }),
        0x05 => match minor & 0x30 {
            0x10 => Some("input-keyboard"),
            0x20 => Some("input-mouse"),
            _ => match minor & 0x0f {
                0x01 | 0x02 => Some("input-gaming"),
                0x05 => Some("input-tablet"),
                _ => None,
            },
        },
        0x06 => {
            if class & 0x80 != 0 {
                Some("printer")
            } else if class & 0x20 != 0 {
                Some("camera-photo")
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Icon name for a GAP appearance.
pub(crate) fn appearance_to_icon(appearance: u16) -> Option<&'static str> {
    match appearance >> 6 {
        0x01 => Some("phone"),
        0x02 => Some("computer"),
        0x03 => Some("watch"),
        0x05 => Some("video-display"),
        0x0a => Some("multimedia-player"),
        0x0b => Some("scanner"),
        0x0f => match appearance & 0x3f {
            0x01 => Some("input-keyboard"),
            0x02 => Some("input-mouse"),
            0x03 | 0x04 => Some("input-gaming"),
            0x05 | 0x08 => Some("input-tablet"),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_class_maps_to_icons() {
        assert_eq!(class_to_icon(0x240404), Some("audio-headset"));
        assert_eq!(class_to_icon(0x240418), Some("audio-headphones"));
        assert_eq!(class_to_icon(0x240414), Some("audio-card"));
        assert_eq!(class_to_icon(0x000100), Some("computer"));
    }

    #[test]
    fn hid_appearance_maps_to_input_icons() {
        assert_eq!(appearance_to_icon(0x03c1), Some("input-keyboard"));
        assert_eq!(appearance_to_icon(0x03c2), Some("input-mouse"));
        assert_eq!(appearance_to_icon(0x00c0 | 0x02), Some("watch"));
        assert_eq!(appearance_to_icon(0), None);
    }
}
