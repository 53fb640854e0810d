//! Event-loop driver.
//!
//! All device mutations are serialized onto one task: external commands,
//! inbound events and timer expiries are multiplexed by [Engine::run],
//! which also flushes coalesced store writes whenever the loop goes
//! idle. [EngineHandle] is the outward face: it enqueues commands and
//! awaits their continuations.

use std::{sync::Arc, time::Instant};
use tokio::sync::{mpsc, oneshot};

use crate::{
    agent::Agent,
    device::{respond, DeviceContext, PreferredBearer, Reply},
    event::DeviceEvent,
    registry::DeviceRegistry,
    Address, Error, ErrorKind, Result, Uuid,
};

/// Command enqueued onto the engine loop.
pub enum Command {
    /// Connect the device.
    Connect {
        /// Device to connect.
        address: Address,
        /// Completion continuation.
        reply: Reply,
    },
    /// Connect a single profile.
    ConnectProfile {
        /// Device to connect.
        address: Address,
        /// Remote UUID of the profile.
        uuid: Uuid,
        /// Completion continuation.
        reply: Reply,
    },
    /// Disconnect the device.
    Disconnect {
        /// Device to disconnect.
        address: Address,
        /// Completion continuation.
        reply: Reply,
    },
    /// Disconnect a single profile.
    DisconnectProfile {
        /// Device the profile is on.
        address: Address,
        /// Remote UUID of the profile.
        uuid: Uuid,
        /// Completion continuation.
        reply: Reply,
    },
    /// Pair the device.
    Pair {
        /// Device to pair.
        address: Address,
        /// Agent of the requesting context.
        agent: Option<Arc<dyn Agent>>,
        /// Completion continuation.
        reply: Reply,
    },
    /// Cancel pairing or remove a stored bond.
    CancelPairing {
        /// Device to cancel on.
        address: Address,
        /// Completion continuation.
        reply: Reply,
    },
    /// Block the device.
    Block {
        /// Device to block.
        address: Address,
        /// Completion continuation.
        reply: Reply,
    },
    /// Unblock the device.
    Unblock {
        /// Device to unblock.
        address: Address,
        /// Completion continuation.
        reply: Reply,
    },
    /// Set the trusted flag.
    SetTrusted {
        /// Device to change.
        address: Address,
        /// New value.
        trusted: bool,
        /// Completion continuation.
        reply: Reply,
    },
    /// Set the alias.
    SetAlias {
        /// Device to change.
        address: Address,
        /// New alias, empty to clear.
        alias: String,
        /// Completion continuation.
        reply: Reply,
    },
    /// Set the remote-wake override.
    SetWakeAllowed {
        /// Device to change.
        address: Address,
        /// New value.
        allowed: bool,
        /// Completion continuation.
        reply: Reply,
    },
    /// Set the preferred bearer.
    SetPreferredBearer {
        /// Device to change.
        address: Address,
        /// New value.
        bearer: PreferredBearer,
        /// Completion continuation.
        reply: Reply,
    },
    /// Remove the device and purge its stored state.
    Remove {
        /// Device to remove.
        address: Address,
        /// Completion continuation.
        reply: Reply,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "Connect",
            Self::ConnectProfile { .. } => "ConnectProfile",
            Self::Disconnect { .. } => "Disconnect",
            Self::DisconnectProfile { .. } => "DisconnectProfile",
            Self::Pair { .. } => "Pair",
            Self::CancelPairing { .. } => "CancelPairing",
            Self::Block { .. } => "Block",
            Self::Unblock { .. } => "Unblock",
            Self::SetTrusted { .. } => "SetTrusted",
            Self::SetAlias { .. } => "SetAlias",
            Self::SetWakeAllowed { .. } => "SetWakeAllowed",
            Self::SetPreferredBearer { .. } => "SetPreferredBearer",
            Self::Remove { .. } => "Remove",
        }
    }
}

/// Handle for talking to a running [Engine].
///
/// Cheap to clone. The engine stops when all handles are dropped.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    event_tx: mpsc::UnboundedSender<(Address, DeviceEvent)>,
}

impl EngineHandle {
    async fn request(&self, build: impl FnOnce(Reply) -> Command) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .map_err(|_| Error::new(ErrorKind::NotAvailable))?;
        rx.await.map_err(|_| Error::new(ErrorKind::Canceled))?
    }

    /// Delivers an inbound event for a device.
    pub fn deliver(&self, address: Address, event: DeviceEvent) {
        let _ = self.event_tx.send((address, event));
    }

    /// Connects the device.
    pub async fn connect(&self, address: Address) -> Result<()> {
        self.request(|reply| Command::Connect { address, reply }).await
    }

    /// Connects a single profile of the device.
    pub async fn connect_profile(&self, address: Address, uuid: Uuid) -> Result<()> {
        self.request(|reply| Command::ConnectProfile { address, uuid, reply }).await
    }

    /// Disconnects the device.
    pub async fn disconnect(&self, address: Address) -> Result<()> {
        self.request(|reply| Command::Disconnect { address, reply }).await
    }

    /// Disconnects a single profile of the device.
    pub async fn disconnect_profile(&self, address: Address, uuid: Uuid) -> Result<()> {
        self.request(|reply| Command::DisconnectProfile { address, uuid, reply }).await
    }

    /// Pairs the device using the given agent.
    pub async fn pair(&self, address: Address, agent: Option<Arc<dyn Agent>>) -> Result<()> {
        self.request(|reply| Command::Pair { address, agent, reply }).await
    }

    /// Cancels pairing, or removes a stored bond when none is running.
    pub async fn cancel_pairing(&self, address: Address) -> Result<()> {
        self.request(|reply| Command::CancelPairing { address, reply }).await
    }

    /// Blocks the device.
    pub async fn block(&self, address: Address) -> Result<()> {
        self.request(|reply| Command::Block { address, reply }).await
    }

    /// Unblocks the device.
    pub async fn unblock(&self, address: Address) -> Result<()> {
        self.request(|reply| Command::Unblock { address, reply }).await
    }

    /// Sets the trusted flag of the device.
    pub async fn set_trusted(&self, address: Address, trusted: bool) -> Result<()> {
        self.request(|reply| Command::SetTrusted { address, trusted, reply }).await
    }

    /// Sets the alias of the device.
    pub async fn set_alias(&self, address: Address, alias: impl Into<String>) -> Result<()> {
        let alias = alias.into();
        self.request(|reply| Command::SetAlias { address, alias, reply }).await
    }

    /// Sets the remote-wake override of the device.
    pub async fn set_wake_allowed(&self, address: Address, allowed: bool) -> Result<()> {
        self.request(|reply| Command::SetWakeAllowed { address, allowed, reply }).await
    }

    /// Sets the preferred bearer of the device.
    pub async fn set_preferred_bearer(
        &self, address: Address, bearer: PreferredBearer,
    ) -> Result<()> {
        self.request(|reply| Command::SetPreferredBearer { address, bearer, reply }).await
    }

    /// Removes the device and purges its stored state.
    pub async fn remove(&self, address: Address) -> Result<()> {
        self.request(|reply| Command::Remove { address, reply }).await
    }
}

enum Tick {
    Command(Option<Command>),
    Event(Option<(Address, DeviceEvent)>),
    Timer,
}

/// The event-loop driver owning a [DeviceRegistry].
pub struct Engine {
    registry: DeviceRegistry,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_rx: mpsc::UnboundedReceiver<(Address, DeviceEvent)>,
}

impl Engine {
    /// Creates the engine and its handle.
    pub fn new(ctx: DeviceContext) -> (Self, EngineHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let registry = DeviceRegistry::new(Arc::new(ctx));
        (Self { registry, cmd_rx, event_rx }, EngineHandle { cmd_tx, event_tx })
    }

    /// The registry driven by this engine.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    fn now() -> Instant {
        tokio::time::Instant::now().into_std()
    }

    /// Runs the loop until all handles are dropped.
    ///
    /// Restores persistent devices first. Events are drained before
    /// commands so commands always act on current state; store writes
    /// are flushed whenever both queues are empty.
    pub async fn run(mut self) {
        if let Err(err) = self.registry.load(Self::now()) {
            log::error!("restoring devices failed: {err}");
        }

        loop {
            if self.cmd_rx.is_empty() && self.event_rx.is_empty() && self.registry.dirty() {
                self.registry.flush();
            }

            let deadline = self.registry.next_timeout();
            let tick = tokio::select! {
                biased;
                event = self.event_rx.recv() => Tick::Event(event),
                cmd = self.cmd_rx.recv() => Tick::Command(cmd),
                _ = sleep_or_never(deadline) => Tick::Timer,
            };

            match tick {
                Tick::Event(Some((address, event))) => {
                    self.registry.handle_event(address, event, Self::now());
                }
                Tick::Command(Some(cmd)) => self.handle_command(cmd),
                Tick::Timer => self.registry.handle_timeout(Self::now()),
                Tick::Event(None) | Tick::Command(None) => break,
            }
        }

        self.registry.flush();
        log::debug!("engine loop terminated");
    }

    fn handle_command(&mut self, cmd: Command) {
        let now = Self::now();
        log::trace!("handling {}", cmd.name());
        match cmd {
            Command::Connect { address, reply } => match self.registry.get_mut(address) {
                Some(device) => device.connect(now, reply),
                None => respond(reply, Err(Error::new(ErrorKind::DoesNotExist))),
            },
            Command::ConnectProfile { address, uuid, reply } => {
                match self.registry.get_mut(address) {
                    Some(device) => device.connect_profile(uuid, now, reply),
                    None => respond(reply, Err(Error::new(ErrorKind::DoesNotExist))),
                }
            }
            Command::Disconnect { address, reply } => match self.registry.get_mut(address) {
                Some(device) => device.disconnect(now, reply),
                None => respond(reply, Err(Error::new(ErrorKind::DoesNotExist))),
            },
            Command::DisconnectProfile { address, uuid, reply } => {
                match self.registry.get_mut(address) {
                    Some(device) => device.disconnect_profile(uuid, reply),
                    None => respond(reply, Err(Error::new(ErrorKind::DoesNotExist))),
                }
            }
            Command::Pair { address, agent, reply } => match self.registry.get_mut(address) {
                Some(device) => device.pair(agent, now, reply),
                None => respond(reply, Err(Error::new(ErrorKind::DoesNotExist))),
            },
            Command::CancelPairing { address, reply } => match self.registry.get_mut(address) {
                Some(device) => device.cancel_pairing(reply),
                None => respond(reply, Err(Error::new(ErrorKind::DoesNotExist))),
            },
            Command::Block { address, reply } => match self.registry.get_mut(address) {
                Some(device) => respond(reply, device.block()),
                None => respond(reply, Err(Error::new(ErrorKind::DoesNotExist))),
            },
            Command::Unblock { address, reply } => match self.registry.get_mut(address) {
                Some(device) => respond(reply, device.unblock()),
                None => respond(reply, Err(Error::new(ErrorKind::DoesNotExist))),
            },
            Command::SetTrusted { address, trusted, reply } => {
                match self.registry.get_mut(address) {
                    Some(device) => respond(reply, device.set_trusted(trusted)),
                    None => respond(reply, Err(Error::new(ErrorKind::DoesNotExist))),
                }
            }
            Command::SetAlias { address, alias, reply } => match self.registry.get_mut(address) {
                Some(device) => respond(reply, device.set_alias(&alias)),
                None => respond(reply, Err(Error::new(ErrorKind::DoesNotExist))),
            },
            Command::SetWakeAllowed { address, allowed, reply } => {
                match self.registry.get_mut(address) {
                    Some(device) => respond(reply, device.set_wake_allowed(allowed)),
                    None => respond(reply, Err(Error::new(ErrorKind::DoesNotExist))),
                }
            }
            Command::SetPreferredBearer { address, bearer, reply } => {
                match self.registry.get_mut(address) {
                    Some(device) => respond(reply, device.set_preferred_bearer(bearer)),
                    None => respond(reply, Err(Error::new(ErrorKind::DoesNotExist))),
                }
            }
            Command::Remove { address, reply } => {
                if self.registry.remove(address, true) {
                    respond(reply, Ok(()));
                } else {
                    respond(reply, Err(Error::new(ErrorKind::DoesNotExist)));
                }
            }
        }
    }
}

async fn sleep_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapter::{ChannelWatcher, DeviceChange},
        config::Config,
        device::tests::fakes::FakeAdapter,
        event::AdvReport,
        profile::ProfileRegistry,
        store::Store,
    };
    use futures::StreamExt;
    use std::time::Duration;

    fn engine_parts(
        powered: bool,
    ) -> (Engine, EngineHandle, impl futures::Stream<Item = DeviceChange>) {
        let (watcher, changes) = ChannelWatcher::new();
        let adapter = Arc::new(FakeAdapter::new(powered));
        let store_dir =
            std::env::temp_dir().join(format!("bluedev-engine-{}", uuid::Uuid::new_v4()));
        let ctx = DeviceContext {
            adapter,
            watcher,
            profiles: ProfileRegistry::new(),
            store: Store::new(store_dir),
            config: Config::default(),
            default_agent: None,
        };
        let (engine, handle) = Engine::new(ctx);
        (engine, handle, changes)
    }

    fn addr() -> Address {
        "AA:BB:CC:DD:EE:42".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn commands_for_unknown_devices_fail() {
        let (engine, handle, _changes) = engine_parts(true);
        tokio::spawn(engine.run());

        let err = handle.connect(addr()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DoesNotExist);
        let err = handle.set_trusted(addr(), true).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DoesNotExist);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_requires_a_powered_adapter() {
        let (engine, handle, _changes) = engine_parts(false);
        tokio::spawn(engine.run());

        handle.deliver(addr(), DeviceEvent::Found(AdvReport::default()));
        let err = handle.connect(addr()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotReady);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_temporary_device_expires() {
        let (engine, handle, mut changes) = engine_parts(true);
        tokio::spawn(engine.run());

        handle.deliver(addr(), DeviceEvent::Found(AdvReport::default()));
        // let the event be processed before advancing the clock
        tokio::task::yield_now().await;

        tokio::time::advance(Config::default().temporary_timeout + Duration::from_secs(1)).await;

        let removed = loop {
            match changes.next().await {
                Some(DeviceChange::Removed { address }) => break address,
                Some(_) => continue,
                None => panic!("change stream ended"),
            }
        };
        assert_eq!(removed, addr());
    }
}
