//! In-progress credential prompts.
//!
//! At most one authentication request is pending per device. The request
//! remembers which prompt is outstanding, forwards agent replies to the
//! management layer and synthesizes a negative reply when it is canceled
//! under a request-type prompt.

use std::sync::Arc;

use crate::{
    adapter::AdapterOps,
    agent::{
        Agent, DisplayPasskey, DisplayPinCode, RequestConfirmation, RequestPasskey, RequestPinCode,
    },
    event::AgentReply,
    Address, AddressType,
};

/// Kind of credential prompt in progress.
#[derive(Clone, Debug)]
pub enum AuthKind {
    /// A legacy PIN code was requested from us.
    PinCode {
        /// A 16-digit secure PIN is required.
        secure: bool,
    },
    /// A passkey was requested from us.
    Passkey,
    /// A numeric comparison value awaits confirmation.
    Confirm {
        /// The value to confirm.
        passkey: u32,
    },
    /// A passkey is being displayed for remote entry.
    DisplayPasskey {
        /// The displayed passkey.
        passkey: u32,
        /// Digits already entered remotely.
        entered: u16,
    },
    /// A PIN code is being displayed for remote entry.
    DisplayPinCode {
        /// The displayed PIN code.
        pincode: String,
    },
}

/// One in-progress credential prompt.
#[derive(custom_debug::Debug)]
pub struct AuthRequest {
    /// The outstanding prompt.
    pub kind: AuthKind,
    /// Agent answering the prompt, if one is available.
    #[debug(skip)]
    pub agent: Option<Arc<dyn Agent>>,
    /// Address type the prompt was raised for.
    pub address_type: AddressType,
    done: bool,
}

impl AuthRequest {
    pub(crate) fn new(
        kind: AuthKind, agent: Option<Arc<dyn Agent>>, address_type: AddressType,
    ) -> Self {
        Self { kind, agent, address_type, done: false }
    }

    /// Forwards the prompt to the agent.
    ///
    /// Without an agent, request-type prompts are answered negatively
    /// right away and `false` is returned to show that nothing remains
    /// outstanding.
    pub(crate) fn dispatch(&mut self, adapter: &dyn AdapterOps, address: Address) -> bool {
        let adapter_name = adapter.name().to_string();
        let Some(agent) = self.agent.clone() else {
            log::debug!("{address}: no agent for {:?}, rejecting", self.kind);
            self.reject(adapter, address);
            return false;
        };
        match &self.kind {
            AuthKind::PinCode { secure } => agent.request_pin_code(RequestPinCode {
                adapter: adapter_name,
                device: address,
                secure: *secure,
            }),
            AuthKind::Passkey => {
                agent.request_passkey(RequestPasskey { adapter: adapter_name, device: address })
            }
            AuthKind::Confirm { passkey } => agent.request_confirmation(RequestConfirmation {
                adapter: adapter_name,
                device: address,
                passkey: *passkey,
            }),
            AuthKind::DisplayPasskey { passkey, entered } => {
                agent.display_passkey(DisplayPasskey {
                    adapter: adapter_name,
                    device: address,
                    passkey: *passkey,
                    entered: *entered,
                })
            }
            AuthKind::DisplayPinCode { pincode } => agent.display_pin_code(DisplayPinCode {
                adapter: adapter_name,
                device: address,
                pincode: pincode.clone(),
            }),
        }
        true
    }

    /// Applies an agent reply, forwarding it to the management layer.
    ///
    /// Returns `false` if the reply did not match the outstanding prompt.
    pub(crate) fn apply_reply(
        &mut self, adapter: &dyn AdapterOps, address: Address, reply: AgentReply,
    ) -> bool {
        if self.done {
            return false;
        }
        let matched = match (&self.kind, reply) {
            (AuthKind::PinCode { .. }, AgentReply::PinCode(result)) => {
                adapter.pin_code_reply(address, self.address_type, result.ok());
                true
            }
            (AuthKind::Passkey, AgentReply::Passkey(result)) => {
                adapter.passkey_reply(address, self.address_type, result.ok());
                true
            }
            (AuthKind::Confirm { .. }, AgentReply::Confirm(result)) => {
                adapter.confirm_reply(address, self.address_type, result.is_ok());
                true
            }
            (AuthKind::DisplayPasskey { .. }, AgentReply::Display(_))
            | (AuthKind::DisplayPinCode { .. }, AgentReply::Display(_)) => true,
            (kind, reply) => {
                log::warn!("{address}: agent reply {reply:?} does not match prompt {kind:?}");
                return false;
            }
        };
        self.done = matched;
        matched
    }

    /// Cancels the prompt.
    ///
    /// Idempotent. The agent is told to dismiss its prompt and, for
    /// request-type prompts, a negative reply is synthesized so the
    /// management layer is not left waiting.
    pub(crate) fn cancel(&mut self, adapter: &dyn AdapterOps, address: Address) {
        if self.done {
            return;
        }
        if let Some(agent) = &self.agent {
            agent.cancel();
        }
        self.reject(adapter, address);
    }

    fn reject(&mut self, adapter: &dyn AdapterOps, address: Address) {
        match &self.kind {
            AuthKind::PinCode { .. } => adapter.pin_code_reply(address, self.address_type, None),
            AuthKind::Passkey => adapter.passkey_reply(address, self.address_type, None),
            AuthKind::Confirm { .. } => adapter.confirm_reply(address, self.address_type, false),
            // display prompts owe the management layer nothing
            AuthKind::DisplayPasskey { .. } | AuthKind::DisplayPinCode { .. } => {}
        }
        self.done = true;
    }

    /// The prompt has been answered or canceled.
    pub(crate) fn is_done(&self) -> bool {
        self.done
    }
}
