//! Adapter-side collaborators of the device engine.
//!
//! The engine never talks to the kernel, the transport or the object bus
//! directly. Everything it needs from the surrounding stack is reachable
//! through [AdapterOps] (outbound commands) and [DeviceWatcher] (change
//! notifications), passed in explicitly when the
//! [DeviceContext](crate::DeviceContext) is built so tests can
//! substitute them.
//!
//! Command methods never block and never call back into the engine
//! synchronously; their completions arrive later as
//! [DeviceEvent](crate::event::DeviceEvent)s.

use futures::Stream;
use std::collections::HashSet;
use std::sync::Arc;
use strum::Display;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::{
    agent::IoCapability, device::DeviceProperty, event::DisconnectReason, Address, AddressType,
    Result,
};

/// Security level of an ATT link.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Display)]
pub enum SecurityLevel {
    /// No encryption.
    #[strum(serialize = "low")]
    Low,
    /// Encryption with unauthenticated keys.
    #[strum(serialize = "medium")]
    Medium,
    /// Encryption with authenticated keys.
    #[strum(serialize = "high")]
    High,
}

/// Per-device kernel feature flags.
#[derive(Clone, Copy, Default, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeviceFlags {
    /// The device may wake the host from suspend.
    pub remote_wakeup: bool,
    /// The controller resolves the device address in hardware.
    pub address_resolution: bool,
}

impl DeviceFlags {
    const REMOTE_WAKEUP: u32 = 1 << 0;
    const ADDRESS_RESOLUTION: u32 = 1 << 1;

    /// Parses flags from their wire representation.
    pub fn from_bits(bits: u32) -> Self {
        Self {
            remote_wakeup: bits & Self::REMOTE_WAKEUP != 0,
            address_resolution: bits & Self::ADDRESS_RESOLUTION != 0,
        }
    }

    /// Wire representation of the flags.
    pub fn to_bits(self) -> u32 {
        let mut bits = 0;
        if self.remote_wakeup {
            bits |= Self::REMOTE_WAKEUP;
        }
        if self.address_resolution {
            bits |= Self::ADDRESS_RESOLUTION;
        }
        bits
    }
}

/// Outbound commands to the adapter, the management layer and the
/// transports.
///
/// Implementations forward these to the kernel management channel, the
/// SDP client and the ATT transport. All methods are fire-and-forget or
/// fail fast; results arrive as events.
pub trait AdapterOps: Send + Sync {
    /// Adapter name, for example `hci0`.
    fn name(&self) -> &str;

    /// The adapter is powered and ready for commands.
    fn is_powered(&self) -> bool;

    /// UUID allow-list restricting which services may auto-connect.
    ///
    /// `None` allows everything.
    fn allowed_uuids(&self) -> Option<HashSet<Uuid>>;

    /// Starts bonding with the device.
    fn create_bonding(
        &self, address: Address, address_type: AddressType, io_cap: IoCapability,
    ) -> Result<()>;

    /// Aborts an in-flight bonding attempt.
    fn cancel_bonding(&self, address: Address, address_type: AddressType);

    /// Removes stored bonding material for the device.
    fn remove_bonding(&self, address: Address, address_type: AddressType);

    /// Forces the link on the given address down.
    fn disconnect(&self, address: Address, address_type: AddressType) -> Result<()>;

    /// Adds the device to the kernel reject list.
    fn block(&self, address: Address, address_type: AddressType) -> Result<()>;

    /// Removes the device from the kernel reject list.
    fn unblock(&self, address: Address, address_type: AddressType) -> Result<()>;

    /// Requests a change of the per-device kernel flags.
    ///
    /// Completion arrives as a
    /// [FlagsChanged](crate::event::DeviceEvent::FlagsChanged) event.
    fn set_device_flags(
        &self, address: Address, address_type: AddressType, flags: DeviceFlags,
    ) -> Result<()>;

    /// Adds the device to the passive-scan auto-connect list.
    fn add_auto_connect(&self, address: Address, address_type: AddressType);

    /// Removes the device from the passive-scan auto-connect list.
    fn remove_auto_connect(&self, address: Address, address_type: AddressType);

    /// Starts an SDP search for records in the given UUID's browse group.
    fn sdp_search(&self, address: Address, uuid: Uuid) -> Result<()>;

    /// Cancels the outstanding SDP search.
    fn cancel_sdp_search(&self, address: Address);

    /// Opens the ATT channel to the device.
    fn open_att(
        &self, address: Address, address_type: AddressType, security: SecurityLevel,
    ) -> Result<()>;

    /// Closes the ATT channel to the device.
    fn close_att(&self, address: Address);

    /// Raises the security level of the open ATT link, triggering SMP.
    fn elevate_security(&self, address: Address, level: SecurityLevel) -> Result<()>;

    /// Starts remote name resolution.
    fn resolve_name(&self, address: Address) -> Result<()>;

    /// Answers a PIN code authentication request. `None` rejects.
    fn pin_code_reply(&self, address: Address, address_type: AddressType, pin: Option<String>);

    /// Answers a passkey authentication request. `None` rejects.
    fn passkey_reply(&self, address: Address, address_type: AddressType, passkey: Option<u32>);

    /// Answers a confirmation authentication request.
    fn confirm_reply(&self, address: Address, address_type: AddressType, accept: bool);
}

/// Observer of device state.
///
/// This is the "emit change" contract of the object-bus publication
/// layer: the engine calls it exactly when an observable value changes,
/// after the internal state is consistent.
pub trait DeviceWatcher: Send + Sync {
    /// An observable property of the device changed.
    fn property_changed(&self, address: Address, property: DeviceProperty);

    /// A disconnect was requested; services are about to go down.
    ///
    /// `temporary` tells the observer whether the device will survive
    /// the disconnect.
    fn disconnect_requested(&self, address: Address, temporary: bool);

    /// The device disconnected.
    fn disconnected(&self, address: Address, reason: DisconnectReason);

    /// The device was removed from the registry.
    fn removed(&self, address: Address);
}

/// A change notification forwarded by [ChannelWatcher].
#[derive(Clone, Debug)]
pub enum DeviceChange {
    /// An observable property changed.
    PropertyChanged {
        /// Device the change is for.
        address: Address,
        /// The changed property with its new value.
        property: DeviceProperty,
    },
    /// A disconnect was requested.
    DisconnectRequested {
        /// Device the request is for.
        address: Address,
        /// The device will not survive the disconnect.
        temporary: bool,
    },
    /// The device disconnected.
    Disconnected {
        /// Device that disconnected.
        address: Address,
        /// Reason reported by the controller.
        reason: DisconnectReason,
    },
    /// The device was removed.
    Removed {
        /// Device that was removed.
        address: Address,
    },
}

/// Watcher that forwards change notifications into a stream.
///
/// Convenient for consumers that want to observe devices without
/// implementing [DeviceWatcher] themselves.
pub struct ChannelWatcher {
    tx: mpsc::UnboundedSender<DeviceChange>,
}

impl ChannelWatcher {
    /// Creates the watcher and the stream of changes it forwards.
    ///
    /// The stream ends when the watcher is dropped.
    pub fn new() -> (Arc<Self>, impl Stream<Item = DeviceChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), UnboundedReceiverStream::new(rx))
    }
}

impl DeviceWatcher for ChannelWatcher {
    fn property_changed(&self, address: Address, property: DeviceProperty) {
        let _ = self.tx.send(DeviceChange::PropertyChanged { address, property });
    }

    fn disconnect_requested(&self, address: Address, temporary: bool) {
        let _ = self.tx.send(DeviceChange::DisconnectRequested { address, temporary });
    }

    fn disconnected(&self, address: Address, reason: DisconnectReason) {
        let _ = self.tx.send(DeviceChange::Disconnected { address, reason });
    }

    fn removed(&self, address: Address) {
        let _ = self.tx.send(DeviceChange::Removed { address });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_roundtrip_through_bits() {
        let flags = DeviceFlags { remote_wakeup: true, address_resolution: false };
        assert_eq!(DeviceFlags::from_bits(flags.to_bits()), flags);
        assert_eq!(DeviceFlags::from_bits(0), DeviceFlags::default());
        assert_eq!(DeviceFlags::from_bits(0b11).to_bits(), 0b11);
    }
}
