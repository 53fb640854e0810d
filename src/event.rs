//! Inbound events delivered to the device engine.
//!
//! Everything a device learns about the outside world arrives as a
//! [DeviceEvent]: management-channel notifications, transport state
//! changes, discovery results and agent replies. Events are serialized
//! onto the engine loop; handlers never block.

use std::collections::HashMap;
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::{
    adapter::DeviceFlags,
    agent::ReqResult,
    device::{LongTermKey, SetIdentityKey, SignatureKey},
    AddressType, Bearer, DeviceId, Error, ErrorKind,
};

/// Reason a device link was disconnected.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Display, EnumString)]
pub enum DisconnectReason {
    /// Reason is unknown or not reported.
    #[default]
    Unknown,
    /// Supervision timeout, the link was lost.
    Timeout,
    /// The local host terminated the connection.
    Local,
    /// The remote device terminated the connection.
    Remote,
    /// Authentication failure tore the link down.
    Authentication,
    /// The host is suspending.
    Suspend,
}

/// Outcome of a bonding attempt as reported by the management layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[non_exhaustive]
pub enum BondingStatus {
    /// Keys were exchanged and stored.
    Success,
    /// The remote device failed authentication.
    AuthFailed,
    /// The remote device rejected the pairing request.
    AuthRejected,
    /// The pairing was canceled.
    AuthCanceled,
    /// The remote device did not answer in time.
    AuthTimeout,
    /// The remote device lost its copy of our keys.
    KeyMissing,
    /// Paging the remote device timed out.
    PageTimeout,
    /// The controller was busy with another operation.
    Busy,
    /// Unspecified failure.
    Failed,
}

impl BondingStatus {
    /// A transient status makes the bonding engine schedule a retry
    /// instead of failing the request.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy | Self::PageTimeout)
    }

    /// Maps the status to the caller-visible error taxonomy.
    pub fn to_error(self, bearer: Bearer) -> Error {
        let kind = match self {
            Self::Success => return Error::new(ErrorKind::Failed),
            Self::AuthFailed => ErrorKind::AuthenticationFailed,
            Self::AuthRejected => ErrorKind::AuthenticationRejected,
            Self::AuthCanceled => ErrorKind::AuthenticationCanceled,
            Self::AuthTimeout => ErrorKind::AuthenticationTimeout,
            Self::KeyMissing => ErrorKind::AuthenticationKeyMissing,
            Self::PageTimeout | Self::Busy => ErrorKind::ConnectionAttemptFailed,
            Self::Failed => ErrorKind::AuthenticationFailed,
        };
        Error::for_bearer(kind, bearer)
    }
}

/// Failure of a browse-engine I/O operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum BrowseFault {
    /// The remote host is down (page timeout on BR/EDR).
    HostDown,
    /// The transport reported an I/O error.
    Io,
    /// The operation timed out.
    Timeout,
}

impl BrowseFault {
    pub(crate) fn to_error(self, bearer: Bearer) -> Error {
        let mut err = Error::for_bearer(ErrorKind::ConnectionAttemptFailed, bearer);
        err.message = match self {
            Self::HostDown => "host is down",
            Self::Io => "transport error",
            Self::Timeout => "timed out",
        }
        .to_string();
        err
    }
}

/// Advertising or inquiry report about a device.
///
/// Carries everything a device-found notification can deliver: EIR from
/// inquiry, advertising data from scanning, or both merged by the
/// controller.
#[derive(Clone, Debug)]
pub struct AdvReport {
    /// Address type the report was received for.
    pub address_type: AddressType,
    /// Received signal strength, 0 if unknown.
    pub rssi: i16,
    /// The device currently accepts connections on this bearer.
    pub connectable: bool,
    /// Replace previously cached manufacturer/service data instead of
    /// merging into it.
    pub replace_data: bool,
    /// Complete or shortened remote name.
    pub name: Option<String>,
    /// Class of device (BR/EDR inquiry only).
    pub class: Option<u32>,
    /// GAP appearance (LE advertising only).
    pub appearance: Option<u16>,
    /// Advertised transmit power, 127 if not observed.
    pub tx_power: i8,
    /// Advertising data flags.
    pub flags: Vec<u8>,
    /// Service UUIDs observed in the report.
    pub uuids: Vec<Uuid>,
    /// Manufacturer specific data keyed by company id.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Service data keyed by service UUID.
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// Raw advertising data records keyed by AD type.
    pub data: HashMap<u8, Vec<u8>>,
    /// The device only supports pre-2.1 pairing.
    pub legacy_pairing: Option<bool>,
    /// The reported address is a resolvable private address.
    pub rpa: bool,
}

impl Default for AdvReport {
    fn default() -> Self {
        Self {
            address_type: AddressType::LePublic,
            rssi: 0,
            connectable: true,
            replace_data: false,
            name: None,
            class: None,
            appearance: None,
            tx_power: 127,
            flags: Vec::new(),
            uuids: Vec::new(),
            manufacturer_data: HashMap::new(),
            service_data: HashMap::new(),
            data: HashMap::new(),
            legacy_pairing: None,
            rpa: false,
        }
    }
}

/// One SDP service record.
#[derive(Clone, Debug, Default)]
pub struct SdpRecord {
    /// Service record handle.
    pub handle: u32,
    /// Service class UUIDs of the record.
    pub uuids: Vec<Uuid>,
    /// Device ID attributes, present on PnP records.
    pub device_id: Option<DeviceId>,
    /// GATT attribute range for GATT-over-BR/EDR services.
    pub att_range: Option<(u16, u16)>,
    /// Raw record bytes as cached on disk.
    pub raw: Vec<u8>,
}

/// A primary GATT service extracted from the attribute database.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GattPrimary {
    /// Service UUID.
    pub uuid: Uuid,
    /// First attribute handle.
    pub start: u16,
    /// Last attribute handle.
    pub end: u16,
}

/// An authentication prompt requested by the management layer.
#[derive(Clone, Debug)]
pub enum AuthEvent {
    /// A legacy PIN code is required.
    PinCode {
        /// A 16-digit secure PIN is required.
        secure: bool,
    },
    /// A passkey must be entered on the local side.
    Passkey,
    /// A numeric comparison value must be confirmed.
    Confirm {
        /// The value to confirm.
        passkey: u32,
        /// The request would resolve just-works; user consent is only a
        /// policy question.
        confirm_hint: bool,
    },
    /// A passkey must be shown for entry on the remote side.
    DisplayPasskey {
        /// The passkey to display.
        passkey: u32,
        /// Digits already typed on the remote side.
        entered: u16,
    },
    /// A PIN code must be shown for entry on the remote side.
    DisplayPinCode {
        /// The PIN code to display.
        pincode: String,
    },
}

/// Reply from the pairing agent to an outstanding authentication request.
#[derive(Clone, Debug)]
pub enum AgentReply {
    /// Reply to a PIN code request.
    PinCode(ReqResult<String>),
    /// Reply to a passkey request.
    Passkey(ReqResult<u32>),
    /// Reply to a confirmation or authorization request.
    Confirm(ReqResult<()>),
    /// Completion of a display request.
    Display(ReqResult<()>),
}

/// Event delivered to a device.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum DeviceEvent {
    /// The device was seen in an inquiry or advertising report.
    Found(AdvReport),
    /// A baseband or LE link to the device came up.
    Connected {
        /// Bearer the link is on.
        bearer: Bearer,
        /// Address the connection actually used.
        address_type: AddressType,
        /// The local host initiated the link.
        initiator: bool,
    },
    /// The link on a bearer went down.
    Disconnected {
        /// Bearer the link was on.
        bearer: Bearer,
        /// Reason reported by the controller.
        reason: DisconnectReason,
    },
    /// A bonding attempt finished.
    BondingComplete {
        /// Bearer the bonding ran on.
        bearer: Bearer,
        /// Outcome.
        status: BondingStatus,
    },
    /// The device paired on a bearer. Sent for peer-initiated pairing as
    /// well as for locally requested bonding.
    Paired {
        /// Bearer that paired.
        bearer: Bearer,
        /// Keys will be persisted by the kernel (bonded, not just paired).
        bonded: bool,
    },
    /// Pairing information for a bearer was removed.
    Unpaired {
        /// Bearer that unpaired.
        bearer: Bearer,
    },
    /// A new long-term key was generated.
    NewLongTermKey {
        /// The key.
        key: LongTermKey,
        /// The host is expected to store the key persistently.
        store_hint: bool,
    },
    /// A new signature resolving key was generated.
    NewSignatureKey {
        /// The key.
        key: SignatureKey,
        /// Key for outbound (local) signing rather than inbound
        /// verification.
        local: bool,
        /// The host is expected to store the key persistently.
        store_hint: bool,
    },
    /// A set identity resolving key was delivered.
    NewSetIdentityKey {
        /// The key.
        key: SetIdentityKey,
    },
    /// A signed write arrived from the device.
    SignedWriteReceived {
        /// Sign counter claimed by the sender.
        counter: u32,
    },
    /// An SDP search for one UUID finished.
    SdpResult {
        /// The UUID that was searched.
        uuid: Uuid,
        /// Records found for the UUID.
        records: Vec<SdpRecord>,
    },
    /// An SDP search failed.
    SdpFailed {
        /// Failure cause.
        fault: BrowseFault,
    },
    /// The ATT channel to the device is open.
    AttConnected,
    /// Opening the ATT channel failed.
    AttFailed {
        /// Failure cause.
        fault: BrowseFault,
    },
    /// The ATT channel was closed.
    AttClosed,
    /// The GATT client finished initial discovery.
    GattReady {
        /// Primary services in the remote attribute database.
        primaries: Vec<GattPrimary>,
    },
    /// GATT discovery failed.
    GattFailed {
        /// Failure cause.
        fault: BrowseFault,
    },
    /// The remote attribute database changed in the given handle range.
    GattServiceChanged {
        /// First changed handle.
        start: u16,
        /// Last changed handle.
        end: u16,
    },
    /// The remote device subscribed to Service Changed indications.
    ServiceChangedSubscribed {
        /// Bearer the subscription is on.
        bearer: Bearer,
        /// Client characteristic configuration value.
        ccc: u16,
    },
    /// The kernel device flags changed.
    FlagsChanged {
        /// Flags the kernel supports for this device.
        supported: DeviceFlags,
        /// Flags currently in effect.
        current: DeviceFlags,
    },
    /// The management layer requests user authentication.
    Authentication(AuthEvent),
    /// The pairing agent answered an authentication request.
    AgentReply(AgentReply),
    /// Remote name resolution succeeded.
    NameResolved {
        /// The resolved name.
        name: String,
    },
    /// Remote name resolution failed.
    NameResolveFailed,
    /// A profile driver finished connecting its service.
    ProfileConnected {
        /// Remote UUID of the service.
        uuid: Uuid,
        /// Outcome of the connect.
        result: crate::Result<()>,
    },
    /// A profile's service disconnected.
    ProfileDisconnected {
        /// Remote UUID of the service.
        uuid: Uuid,
    },
}
