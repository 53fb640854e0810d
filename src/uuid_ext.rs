use uuid::Uuid;

/// The Bluetooth base UUID.
///
/// Assigned 16 and 32-bit numbers occupy the four leading bytes of a
/// derived UUID; the remaining twelve bytes are fixed.
const BASE: Uuid = Uuid::from_u128(0x00000000_0000_1000_8000_00805f9b34fb);

/// Splits a UUID into its leading 32 bits and the 96-bit remainder.
fn split(uuid: &Uuid) -> (u32, u128) {
    let value = uuid.as_u128();
    ((value >> 96) as u32, value & ((1u128 << 96) - 1))
}

/// Places an assigned number into the leading bytes of the base UUID.
const fn with_short(v: u32) -> Uuid {
    Uuid::from_u128(BASE.as_u128() | ((v as u128) << 96))
}

/// Conversions between full UUIDs and Bluetooth short forms.
pub trait UuidExt {
    /// 32-bit short form, if the UUID derives from the base UUID.
    fn as_u32(&self) -> Option<u32>;
    /// 16-bit short form, if the UUID derives from the base UUID and
    /// the assigned number fits.
    fn as_u16(&self) -> Option<u16>;
    /// Expands a 32-bit assigned number to its full UUID.
    fn from_u32(v: u32) -> Uuid;
    /// Expands a 16-bit assigned number to its full UUID.
    fn from_u16(v: u16) -> Uuid;
}

impl UuidExt for Uuid {
    fn as_u32(&self) -> Option<u32> {
        let (short, remainder) = split(self);
        (remainder == split(&BASE).1).then_some(short)
    }

    fn as_u16(&self) -> Option<u16> {
        self.as_u32().and_then(|short| short.try_into().ok())
    }

    fn from_u32(v: u32) -> Uuid {
        with_short(v)
    }

    fn from_u16(v: u16) -> Uuid {
        with_short(v as u32)
    }
}

/// Well-known Bluetooth service and protocol UUIDs.
pub mod ids {
    use super::with_short;
    use uuid::Uuid;

    /// L2CAP protocol.
    pub const L2CAP: Uuid = with_short(0x0100);
    /// SDP public browse group root.
    pub const PUBLIC_BROWSE_GROUP: Uuid = with_short(0x1002);
    /// PnP Information service (Device ID profile).
    pub const PNP_INFORMATION: Uuid = with_short(0x1200);
    /// Audio Source (A2DP).
    pub const AUDIO_SOURCE: Uuid = with_short(0x110a);
    /// Audio Sink (A2DP).
    pub const AUDIO_SINK: Uuid = with_short(0x110b);
    /// A/V Remote Control (AVRCP).
    pub const AV_REMOTE_CONTROL: Uuid = with_short(0x110e);
    /// Human Interface Device profile.
    pub const HID: Uuid = with_short(0x1124);
    /// Generic Access Profile service.
    pub const GAP: Uuid = with_short(0x1800);
    /// Generic Attribute Profile service.
    pub const GATT: Uuid = with_short(0x1801);
    /// Device Information service.
    pub const DEVICE_INFORMATION: Uuid = with_short(0x180a);
    /// Battery service.
    pub const BATTERY: Uuid = with_short(0x180f);
    /// HID over GATT service.
    pub const HOG: Uuid = with_short(0x1812);
    /// Coordinated Set Identification service.
    pub const CSIS: Uuid = with_short(0x1846);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_form_roundtrip() {
        let uuid = Uuid::from_u16(0x110b);
        assert_eq!(uuid.to_string(), "0000110b-0000-1000-8000-00805f9b34fb");
        assert_eq!(uuid.as_u16(), Some(0x110b));
        assert_eq!(uuid.as_u32(), Some(0x110b));
        assert_eq!(Uuid::from_u32(0x110b), uuid);
    }

    #[test]
    fn full_uuid_has_no_short_form() {
        let uuid: Uuid = "f00dcafe-0000-1000-8000-00805f9b34fb".parse().unwrap();
        assert_eq!(uuid.as_u16(), None);
        assert_eq!(uuid.as_u32(), Some(0xf00dcafe));
        let uuid: Uuid = "f00dcafe-aaaa-bbbb-cccc-00805f9b34fb".parse().unwrap();
        assert_eq!(uuid.as_u32(), None);
    }

    #[test]
    fn well_known_ids_match_assigned_numbers() {
        assert_eq!(ids::L2CAP.as_u16(), Some(0x0100));
        assert_eq!(ids::PUBLIC_BROWSE_GROUP.as_u16(), Some(0x1002));
        assert_eq!(ids::PNP_INFORMATION.as_u16(), Some(0x1200));
        assert_eq!(ids::AUDIO_SINK.as_u16(), Some(0x110b));
    }
}
