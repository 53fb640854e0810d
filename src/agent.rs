//! Bluetooth pairing agent.
//!
//! An agent answers the credential prompts that come up during pairing:
//! PIN codes, passkeys, numeric comparison and display requests. The
//! engine calls the agent's methods when the management layer requests
//! authentication; the agent answers asynchronously by delivering an
//! [AgentReply](crate::event::AgentReply) event for the device.
//!
//! An agent never blocks the engine. Prompt methods return immediately;
//! the outstanding request is tracked on the device and canceled through
//! [Agent::cancel] when it becomes moot.

use strum::{Display, EnumString, IntoStaticStr};

use crate::Address;

/// Error response from an agent to an authentication request.
#[derive(Clone, Copy, Debug, displaydoc::Display, Eq, PartialEq, Ord, PartialOrd, Hash, IntoStaticStr)]
#[non_exhaustive]
pub enum ReqError {
    /// Request was rejected.
    Rejected,
    /// Request was canceled.
    Canceled,
}

impl std::error::Error for ReqError {}

impl Default for ReqError {
    fn default() -> Self {
        Self::Canceled
    }
}

/// Result of an authentication request to an agent.
pub type ReqResult<T> = std::result::Result<T, ReqError>;

/// Input and output capability of a pairing agent.
///
/// The capability is reported to the management layer when bonding starts
/// and decides which pairing method the controller negotiates.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Display, EnumString)]
pub enum IoCapability {
    /// Can display values but takes no input.
    DisplayOnly,
    /// Can display values and answer yes/no questions.
    DisplayYesNo,
    /// Takes keyboard input but cannot display values.
    KeyboardOnly,
    /// No input and no output; pairing is just-works.
    NoInputNoOutput,
    /// Full keyboard and display.
    KeyboardDisplay,
}

impl Default for IoCapability {
    fn default() -> Self {
        Self::NoInputNoOutput
    }
}

/// Arguments for a pin code request.
#[derive(Clone, Debug)]
pub struct RequestPinCode {
    /// Adapter making the request.
    pub adapter: String,
    /// Address of device making the request.
    pub device: Address,
    /// A 16-digit secure PIN is required.
    pub secure: bool,
}

/// Arguments for a display pin code request.
#[derive(Clone, Debug)]
pub struct DisplayPinCode {
    /// Adapter making the request.
    pub adapter: String,
    /// Address of device making the request.
    pub device: Address,
    /// Pin code.
    pub pincode: String,
}

/// Arguments for a passkey request.
#[derive(Clone, Debug)]
pub struct RequestPasskey {
    /// Adapter making the request.
    pub adapter: String,
    /// Address of device making the request.
    pub device: Address,
}

/// Arguments for a display passkey request.
#[derive(Clone, Debug)]
pub struct DisplayPasskey {
    /// Adapter making the request.
    pub adapter: String,
    /// Address of device making the request.
    pub device: Address,
    /// Passkey.
    pub passkey: u32,
    /// Digits entered so far on the remote side.
    pub entered: u16,
}

/// Arguments for a confirmation request.
#[derive(Clone, Debug)]
pub struct RequestConfirmation {
    /// Adapter making the request.
    pub adapter: String,
    /// Address of device making the request.
    pub device: Address,
    /// Passkey to confirm.
    pub passkey: u32,
}

/// Arguments for an authorization request.
#[derive(Clone, Debug)]
pub struct RequestAuthorization {
    /// Adapter making the request.
    pub adapter: String,
    /// Address of device making the request.
    pub device: Address,
}

/// Bluetooth pairing agent handler.
///
/// Every method is a prompt forwarded to the user interface behind the
/// agent. The agent answers by delivering the matching
/// [AgentReply](crate::event::AgentReply) event; a device without a
/// pending request ignores stray replies.
///
/// When no agent is available the engine reports `NoInputNoOutput`
/// capability and rejects all requests itself.
pub trait Agent: Send + Sync {
    /// Input/output capability announced to the management layer.
    fn io_capability(&self) -> IoCapability {
        IoCapability::NoInputNoOutput
    }

    /// The pairing process needs a PIN code.
    ///
    /// The reply should be a string of 1-16 alphanumeric characters.
    fn request_pin_code(&self, req: RequestPinCode);

    /// A PIN code needs to be displayed until canceled.
    ///
    /// This is used when pairing keyboards that do not support Secure
    /// Simple Pairing.
    fn display_pin_code(&self, req: DisplayPinCode);

    /// The pairing process needs a passkey.
    ///
    /// The reply should be a numeric value between 0 and 999999.
    fn request_passkey(&self, req: RequestPasskey);

    /// A passkey needs to be displayed until canceled.
    ///
    /// This may be called multiple times to update the count of digits
    /// already entered on the remote side.
    fn display_passkey(&self, req: DisplayPasskey);

    /// A numeric comparison value needs confirmation.
    ///
    /// Note that the passkey is always a 6-digit number, so the display
    /// should be zero-padded at the start if the value contains less
    /// than 6 digits.
    fn request_confirmation(&self, req: RequestConfirmation);

    /// An incoming just-works pairing attempt needs authorization.
    fn request_authorization(&self, req: RequestAuthorization);

    /// The outstanding request is obsolete and should be dismissed.
    ///
    /// Cancellation is idempotent; canceling an agent without an
    /// outstanding request does nothing.
    fn cancel(&self);
}
