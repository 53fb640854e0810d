//! # BlueDev — Host-side Bluetooth Device Engine
//!
//! This library implements the per-remote-device core of a host-side
//! Bluetooth stack: the dual-bearer (BR/EDR and Low Energy) lifecycle
//! state machine, pairing and bonding, service discovery (SDP for BR/EDR,
//! GATT for LE), per-profile service attachment and the persistence of
//! learned identity and security material.
//!
//! This library depends on the [tokio] asynchronous runtime.
//!
//! The following functionality is provided.
//!
//! * [Device controller](Device)
//!     * dual-bearer connect/disconnect with bearer selection and fallback
//!     * pairing and bonding with retry and agent handoff
//!     * service discovery and per-profile service attachment
//!     * temporary-device lifecycle with expiry
//!     * change events for every observable property
//! * [Pairing agents](agent::Agent)
//!     * pin code, passkey, numeric comparison and display prompts
//! * [Key material](device::KeyStore)
//!     * long-term keys, signature keys with monotonic counters,
//!       set identity resolving keys
//! * [Persistence](store::Store)
//!     * per-device `info` and `cache` groups with debounced writeback
//! * [Event loop driver](Engine)
//!     * serialized device mutations, timers and idle-tick store flushes
//!
//! The surrounding stack (management channel framing, transport I/O, the
//! object-bus publication layer, agent user interfaces and profile business
//! logic) is reached through the traits in [adapter] and [profile] and can
//! be substituted in tests.
//!
//! ## Basic usage
//! Construct a [DeviceContext] with your collaborators, hand it to
//! [Engine::new] and spawn [Engine::run]. Deliver inbound events through
//! the returned [EngineHandle] and issue operations such as
//! [connect](EngineHandle::connect) and [pair](EngineHandle::pair) on it.

#![warn(missing_docs)]

use macaddr::MacAddr6;
use num_derive::FromPrimitive;
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};
use strum::{Display, EnumString};

pub mod adapter;
pub mod agent;
pub mod config;
pub mod device;
mod engine;
pub mod event;
pub mod profile;
mod registry;
pub mod store;

pub use crate::{engine::*, registry::*};
pub use device::{Device, DeviceContext, DeviceProperty};

#[doc(no_inline)]
pub use uuid::Uuid;
mod uuid_ext;
pub use uuid_ext::{ids, UuidExt};

/// Bluetooth error.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Bearer the error applies to, if it is bearer-local.
    pub bearer: Option<Bearer>,
    /// Detailed error message.
    pub message: String,
}

/// Bluetooth error kind.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq, Ord, PartialOrd, Hash, EnumString)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Bluetooth device already connected
    AlreadyConnected,
    /// Bluetooth device already paired or bonded
    AlreadyExists,
    /// Bluetooth authentication canceled
    AuthenticationCanceled,
    /// Bluetooth authentication failed
    AuthenticationFailed,
    /// Bluetooth authentication rejected
    AuthenticationRejected,
    /// Bluetooth authentication timeout
    AuthenticationTimeout,
    /// Bluetooth pairing key is missing on the remote device
    AuthenticationKeyMissing,
    /// Bluetooth operation canceled
    Canceled,
    /// Bluetooth connection attempt failed
    ConnectionAttemptFailed,
    /// Bluetooth device does not exist
    DoesNotExist,
    /// Bluetooth operation failed
    Failed,
    /// Bluetooth operation in progress
    InProgress,
    /// invalid arguments for Bluetooth operation
    InvalidArguments,
    /// Bluetooth operation not available
    NotAvailable,
    /// Bluetooth device not connected
    NotConnected,
    /// Bluetooth adapter or service not ready
    NotReady,
    /// Bluetooth operation not supported
    NotSupported,
    /// no connectable Bluetooth profile available
    ProfileUnavailable,
    /// Bluetooth operation illegal in the current device state
    Unsupported,
    /// invalid Bluetooth address: {0}
    #[strum(disabled)]
    InvalidAddress(String),
    /// internal error: {0}
    #[strum(disabled)]
    Internal(InternalErrorKind),
}

/// Internal Bluetooth error kind.
///
/// This is most likely caused by a disagreement between this library and
/// its collaborators about the device state.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[non_exhaustive]
pub enum InternalErrorKind {
    /// invalid UUID: {0}
    InvalidUuid(String),
    /// invalid value
    InvalidValue,
    /// invalid modalias: {0}
    InvalidModalias(String),
    /// IO error {0:?}
    Io(std::io::ErrorKind),
    /// persistent store error: {0}
    Store(String),
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, bearer: None, message: String::new() }
    }

    pub(crate) fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, bearer: None, message: message.into() }
    }

    pub(crate) fn for_bearer(kind: ErrorKind, bearer: Bearer) -> Self {
        Self { kind, bearer: Some(bearer), message: String::new() }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(bearer) = &self.bearer {
            write!(f, "[{bearer}] ")?;
        }
        if self.message.is_empty() {
            write!(f, "{}", &self.kind)
        } else {
            write!(f, "{}: {}", &self.kind, &self.message)
        }
    }
}

impl std::error::Error for Error {}

impl From<strum::ParseError> for Error {
    fn from(_: strum::ParseError) -> Self {
        Self::new(ErrorKind::Internal(InternalErrorKind::InvalidValue))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self {
            kind: ErrorKind::Internal(InternalErrorKind::Io(err.kind())),
            bearer: None,
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self {
            kind: ErrorKind::Internal(InternalErrorKind::Store(err.message().to_string())),
            bearer: None,
            message: err.to_string(),
        }
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Self {
            kind: ErrorKind::Internal(InternalErrorKind::Store(err.to_string())),
            bearer: None,
            message: err.to_string(),
        }
    }
}

impl From<InvalidAddress> for Error {
    fn from(err: InvalidAddress) -> Self {
        Self::new(ErrorKind::InvalidAddress(err.0))
    }
}

/// Bluetooth result.
pub type Result<T> = std::result::Result<T, Error>;

/// Bluetooth address.
///
/// The serialized representation is a string in colon-hexadecimal notation.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address(pub [u8; 6]);

impl Address {
    /// Creates a new Bluetooth address with the specified value.
    pub const fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    /// Any Bluetooth address.
    ///
    /// Corresponds to `00:00:00:00:00:00`.
    pub const fn any() -> Self {
        Self([0; 6])
    }

    /// The six address octets, most significant first.
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        for (i, octet) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{octet:02X}")?;
        }
        Ok(())
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl From<MacAddr6> for Address {
    fn from(addr: MacAddr6) -> Self {
        Self(addr.into_array())
    }
}

impl From<Address> for MacAddr6 {
    fn from(addr: Address) -> Self {
        addr.0.into()
    }
}

/// Invalid Bluetooth address error.
#[derive(Debug, Clone)]
pub struct InvalidAddress(pub String);

impl fmt::Display for InvalidAddress {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "invalid Bluetooth address: {}", &self.0)
    }
}

impl std::error::Error for InvalidAddress {}

impl FromStr for Address {
    type Err = InvalidAddress;
    fn from_str(s: &str) -> std::result::Result<Self, InvalidAddress> {
        let bad = || InvalidAddress(s.to_string());
        let mut octets = [0; 6];
        let mut fields = s.split(':');
        for octet in &mut octets {
            let field = fields.next().ok_or_else(bad)?;
            *octet = u8::from_str_radix(field, 16).map_err(|_| bad())?;
        }
        if fields.next().is_some() {
            return Err(bad());
        }
        Ok(Self(octets))
    }
}

impl From<[u8; 6]> for Address {
    fn from(addr: [u8; 6]) -> Self {
        Self(addr)
    }
}

impl From<Address> for [u8; 6] {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl serde::Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let text = <String as serde::Deserialize>::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Bluetooth device address type.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Display, EnumString, FromPrimitive,
)]
#[repr(u8)]
pub enum AddressType {
    /// Classic Bluetooth (BR/EDR) address.
    #[strum(serialize = "br/edr")]
    BrEdr = 0,
    /// Bluetooth Low Energy (LE) public address.
    #[strum(serialize = "public")]
    LePublic = 1,
    /// Bluetooth Low Energy (LE) random address.
    #[strum(serialize = "random")]
    LeRandom = 2,
}

impl Default for AddressType {
    fn default() -> Self {
        Self::LePublic
    }
}

impl AddressType {
    /// The bearer this address type connects over.
    pub fn bearer(&self) -> Bearer {
        match self {
            Self::BrEdr => Bearer::BrEdr,
            Self::LePublic | Self::LeRandom => Bearer::Le,
        }
    }
}

/// One of the two Bluetooth link layers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Display, EnumString)]
pub enum Bearer {
    /// Classic Bluetooth (BR/EDR).
    #[strum(serialize = "br/edr")]
    BrEdr,
    /// Bluetooth Low Energy (LE).
    #[strum(serialize = "le")]
    Le,
}

impl Bearer {
    /// The opposite bearer.
    pub fn other(&self) -> Bearer {
        match self {
            Self::BrEdr => Self::Le,
            Self::Le => Self::BrEdr,
        }
    }
}

/// Device ID information from the Device Information service or the
/// PnP SDP record.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct DeviceId {
    /// Assigner of the vendor id: 1 is the Bluetooth SIG, 2 is the USB forum.
    pub source: u16,
    /// Vendor id.
    pub vendor: u16,
    /// Product id.
    pub product: u16,
    /// Product version.
    pub version: u16,
}

impl DeviceId {
    /// Modalias representation as used by the kernel and udev.
    pub fn modalias(&self) -> Modalias {
        let source = match self.source {
            2 => "usb",
            _ => "bluetooth",
        };
        Modalias {
            source: source.to_string(),
            vendor: self.vendor.into(),
            product: self.product.into(),
            device: self.version.into(),
        }
    }
}

/// Linux kernel modalias information.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Modalias {
    /// Source.
    pub source: String,
    /// Vendor id.
    pub vendor: u32,
    /// Product id.
    pub product: u32,
    /// Device id.
    pub device: u32,
}

impl FromStr for Modalias {
    type Err = Error;

    fn from_str(m: &str) -> Result<Self> {
        // source:vVVVVpPPPPdDDDD, ids are 4-digit hexadecimal
        fn id<'a>(text: &'a str, tag: char) -> Option<(u32, &'a str)> {
            let text = text.strip_prefix(tag)?;
            let value = u32::from_str_radix(text.get(..4)?, 16).ok()?;
            Some((value, text.get(4..)?))
        }

        let parse = || -> Option<Modalias> {
            let (source, rest) = m.split_once(':')?;
            let (vendor, rest) = id(rest, 'v')?;
            let (product, rest) = id(rest, 'p')?;
            let (device, _) = id(rest, 'd')?;
            Some(Modalias { source: source.to_string(), vendor, product, device })
        };
        parse().ok_or_else(|| {
            Error::new(ErrorKind::Internal(InternalErrorKind::InvalidModalias(m.to_string())))
        })
    }
}

impl Display for Modalias {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{}:v{:04X}p{:04X}d{:04X}",
            self.source, self.vendor, self.product, self.device
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_roundtrips_through_string() {
        let addr = Address::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:01");
        assert_eq!("AA:BB:CC:DD:EE:01".parse::<Address>().unwrap(), addr);
    }

    #[test]
    fn address_rejects_garbage() {
        assert!("AA:BB:CC".parse::<Address>().is_err());
        assert!("AA:BB:CC:DD:EE:FF:00".parse::<Address>().is_err());
        assert!("AA:BB:CC:DD:EE:GG".parse::<Address>().is_err());
    }

    #[test]
    fn modalias_roundtrips() {
        let m: Modalias = "bluetooth:v05ACp022Cd011A".parse().unwrap();
        assert_eq!(m.source, "bluetooth");
        assert_eq!(m.vendor, 0x05ac);
        assert_eq!(m.product, 0x022c);
        assert_eq!(m.device, 0x011a);
        assert_eq!(m.to_string(), "bluetooth:v05ACp022Cd011A");
    }

    #[test]
    fn device_id_modalias_source() {
        let id = DeviceId { source: 2, vendor: 0x1234, product: 1, version: 2 };
        assert_eq!(id.modalias().source, "usb");
        let id = DeviceId { source: 1, ..id };
        assert_eq!(id.modalias().source, "bluetooth");
    }

    #[test]
    fn error_display_carries_bearer_tag() {
        let err = Error::for_bearer(ErrorKind::ConnectionAttemptFailed, Bearer::BrEdr);
        assert_eq!(err.to_string(), "[br/edr] Bluetooth connection attempt failed");
    }
}
